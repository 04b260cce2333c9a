//! Notification feed types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub receiver_id: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            message: message.into(),
            is_read: false,
            receiver_id: receiver_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// One page of the notification feed as returned by the REST collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    #[serde(default)]
    pub data: Vec<Notification>,
    #[serde(default)]
    pub total: u64,
    #[serde(rename = "unReadTotal", default)]
    pub unread_total: u64,
}
