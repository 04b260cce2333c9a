//! Data types for the chat sync core
//!
//! This module contains the data structures shared by the stores, the
//! push protocol and the REST collaborator seams.

mod conversation;
mod identity;
mod message;
mod notification;
mod session;

pub use conversation::{Conversation, Participant, Participants};
pub use identity::{Identity, Role};
pub use message::{DeliveryStatus, Message, MessageKey, MessagePayload, MessageType};
pub use notification::{Notification, NotificationPage};
pub use session::{ConnectionSession, ConnectionState};
