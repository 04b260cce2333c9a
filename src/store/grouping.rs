//! Calendar-date grouping for display

use chrono::{NaiveDate, TimeZone};

use crate::types::Message;

#[derive(Debug, Clone, PartialEq)]
pub struct DateGroup<'a> {
    pub date: NaiveDate,
    pub messages: Vec<&'a Message>,
}

/// Group already ordered messages by their calendar date in `tz`
pub fn group_by_date<'a, Tz, I>(messages: I, tz: &Tz) -> Vec<DateGroup<'a>>
where
    Tz: TimeZone,
    I: IntoIterator<Item = &'a Message>,
{
    let mut groups: Vec<DateGroup<'a>> = Vec::new();
    for message in messages {
        let date = message.timestamp.with_timezone(tz).date_naive();
        match groups.last_mut() {
            Some(group) if group.date == date => group.messages.push(message),
            _ => groups.push(DateGroup {
                date,
                messages: vec![message],
            }),
        }
    }
    groups
}
