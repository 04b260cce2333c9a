//! Chat Sync
//!
//! Real-time conversation and notification synchronization core for a
//! two-sided (client / vendor) chat.
//!
//! # Features
//!
//! - **Push connection**: one authenticated connection per identity, with
//!   transport-level backoff and terminal handling of rejected credentials
//! - **Reconnect-safe handlers**: subscriptions live in the dispatcher and
//!   re-attach to every new connection instance
//! - **Conversation store**: idempotent merge of pushes and REST pages,
//!   unread tracking, optimistic sends reconciled against server echoes
//! - **Notification feed**: pagination with generation tokens so late
//!   responses never resurrect cleared items
//! - **Optimistic updates**: snapshot and rollback around every mutation
//!   backed by a REST call
//!
//! # Modules
//!
//! - `types`: Data model (Identity, Conversation, Message, Notification)
//! - `protocol`: Push channel frames and the connection handshake
//! - `connection`: Connection manager and transports
//! - `dispatcher`: Event fan-out to registered handlers
//! - `store`: Conversation store
//! - `notifications`: Notification aggregator
//! - `optimistic`: Snapshot/rollback coordinator
//! - `rest`: REST collaborator traits
//! - `session`: Owned wiring of all of the above for one identity
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chat_sync::{ChatSession, ClientConfig, Identity, SessionDeps, WsTransport};
//! # use chat_sync::rest::{ConversationApi, NotificationApi};
//! # fn apis() -> (Arc<dyn ConversationApi>, Arc<dyn NotificationApi>) { unimplemented!() }
//!
//! # async fn run() -> chat_sync::ChatResult<()> {
//! let config = ClientConfig::from_env()?;
//! let (conversation_api, notification_api) = apis();
//! let deps = SessionDeps {
//!     transport: Arc::new(WsTransport::from_config(&config)),
//!     conversation_api,
//!     notification_api,
//! };
//! let session = ChatSession::start(config, Identity::client("client-42"), deps)?;
//! session.load_conversations(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod identity_store;
pub mod logging;
pub mod notifications;
pub mod optimistic;
pub mod protocol;
pub mod rest;
pub mod session;
pub mod store;
pub mod types;

// Re-export commonly used items at crate root
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{ChannelTransport, ConnectionManager, SessionInvalid, Transport, WsTransport};
pub use dispatcher::{EventDispatcher, SubscriptionToken};
pub use error::{ChatError, ChatResult, ErrorKind};
pub use notifications::NotificationAggregator;
pub use protocol::{ClientEvent, EventKind, ServerEvent};
pub use session::{ChatSession, SessionDeps, SessionSignal};
pub use store::{AppendOutcome, ConversationStore, MessageDraft, ReadReceipt};
pub use types::{
    ConnectionSession, ConnectionState, Conversation, DeliveryStatus, Identity, Message,
    MessagePayload, MessageType, Notification, NotificationPage, Participant, Participants, Role,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
