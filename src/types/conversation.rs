//! Conversation types

use serde::{Deserialize, Serialize};

use super::{Identity, Message, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Exactly one client and one vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    pub client: Participant,
    pub vendor: Participant,
}

impl Participants {
    /// Pair the local identity with the other side of the conversation
    pub fn from_pair(me: &Identity, counterpart_id: &str) -> Self {
        let mine = Participant::new(me.id.clone());
        let theirs = Participant::new(counterpart_id);
        match me.role {
            Role::Client => Self {
                client: mine,
                vendor: theirs,
            },
            Role::Vendor => Self {
                client: theirs,
                vendor: mine,
            },
        }
    }

    pub fn get(&self, role: Role) -> &Participant {
        match role {
            Role::Client => &self.client,
            Role::Vendor => &self.vendor,
        }
    }

    /// The participant opposite to `identity`
    pub fn counterpart(&self, identity: &Identity) -> &Participant {
        self.get(identity.role.counterpart())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.client.id == id || self.vendor.id == id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: Participants,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: impl Into<String>, participants: Participants) -> Self {
        Self {
            id: id.into(),
            participants,
            last_message: None,
            unread_count: 0,
        }
    }

    /// Replace the last message unless `candidate` is older
    ///
    /// Returns true if the preview changed.
    pub fn offer_last_message(&mut self, candidate: &Message) -> bool {
        match &self.last_message {
            Some(current) if candidate.timestamp < current.timestamp => false,
            _ => {
                self.last_message = Some(candidate.clone());
                true
            }
        }
    }
}
