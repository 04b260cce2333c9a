//! Identity types for conversation participants

use serde::{Deserialize, Serialize};

/// Which side of a conversation an identity occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Vendor,
}

impl Role {
    /// The role on the other side of a conversation
    pub fn counterpart(self) -> Role {
        match self {
            Role::Client => Role::Vendor,
            Role::Vendor => Role::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Vendor => "vendor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An authenticated actor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(id, Role::Client)
    }

    pub fn vendor(id: impl Into<String>) -> Self {
        Self::new(id, Role::Vendor)
    }
}
