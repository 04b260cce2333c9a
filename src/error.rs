//! Error taxonomy for the sync core

use thiserror::Error;

/// Result type for chat-sync operations
pub type ChatResult<T> = Result<T, ChatError>;

/// How an error should be surfaced to the embedding application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport retries on its own; surfaced as a health flag
    Transient,
    /// Requires re-authentication, never retried
    Terminal,
    /// Resolved inside the crate, never shown to the user
    Internal,
    /// Rolled back and reported as a transient notice
    UserVisible,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no identity available to connect with")]
    NoIdentity,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("reconciliation conflict in conversation {conversation_id}: {detail}")]
    Reconciliation {
        conversation_id: String,
        detail: String,
    },

    #[error("request superseded (issued at generation {issued}, current {current})")]
    RequestSuperseded { issued: u64, current: u64 },

    #[error("{label} failed and was rolled back: {reason}")]
    MutationFailure { label: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Classify the error for propagation
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Connection(_) | ChatError::Api(_) | ChatError::Io(_) => ErrorKind::Transient,
            ChatError::Unauthorized(_) | ChatError::NoIdentity => ErrorKind::Terminal,
            ChatError::Reconciliation { .. }
            | ChatError::RequestSuperseded { .. }
            | ChatError::Protocol(_)
            | ChatError::Json(_) => ErrorKind::Internal,
            ChatError::MutationFailure { .. } | ChatError::Config(_) => ErrorKind::UserVisible,
        }
    }

    /// Stale responses are dropped without any notice
    pub fn is_superseded(&self) -> bool {
        matches!(self, ChatError::RequestSuperseded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(ChatError::Connection("reset".into()).kind(), ErrorKind::Transient);
        assert_eq!(ChatError::Unauthorized("bad token".into()).kind(), ErrorKind::Terminal);
        assert_eq!(
            ChatError::RequestSuperseded { issued: 1, current: 2 }.kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            ChatError::MutationFailure {
                label: "mark_all_read".into(),
                reason: "503".into()
            }
            .kind(),
            ErrorKind::UserVisible
        );
    }

    #[test]
    fn test_mutation_failure_message() {
        let err = ChatError::MutationFailure {
            label: "clear_notifications".into(),
            reason: "timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "clear_notifications failed and was rolled back: timeout"
        );
    }
}
