//! Connection session state

use serde::{Deserialize, Serialize};

use super::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unauthenticated,
    Connecting,
    Connected,
    Disconnected,
    Unauthorized,
    Error,
}

impl ConnectionState {
    /// States in which the transport may still recover on its own
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnected
                | ConnectionState::Error
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Unauthenticated => "unauthenticated",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Unauthorized => "unauthorized",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of the push connection published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSession {
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    /// Connection instance number, 0 before the first connect
    pub instance: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionSession {
    pub fn unauthenticated() -> Self {
        Self {
            state: ConnectionState::Unauthenticated,
            identity: None,
            instance: 0,
            last_error: None,
        }
    }

    /// Health flag for the UI: false while the channel is degraded
    pub fn is_online(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::unauthenticated()
    }
}
