//! Chat session
//!
//! Owns every piece of sync state for one signed-in identity: the
//! connection manager, the dispatcher, the conversation store and the
//! notification feed. `start` wires them together and `logout` (or drop)
//! tears them down. Nothing here is global, so two sessions never share
//! state.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Transport};
use crate::dispatcher::{EventDispatcher, SubscriptionToken};
use crate::error::{ChatResult, ErrorKind};
use crate::identity_store::IdentityStore;
use crate::notifications::{self, NotificationAggregator};
use crate::protocol::{ClientEvent, EventKind, ServerEvent};
use crate::rest::{ConversationApi, NotificationApi};
use crate::store::{ConversationStore, MessageDraft};
use crate::types::{ConnectionSession, Identity, Message};

/// Signals for the embedding UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Credentials were rejected; the UI should ask the user to sign in again
    SessionInvalid { identity: Identity, reason: String },
    /// A transient, user-facing notice such as a rolled back action
    Notice { message: String },
}

/// External collaborators a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn Transport>,
    pub conversation_api: Arc<dyn ConversationApi>,
    pub notification_api: Arc<dyn NotificationApi>,
}

pub struct ChatSession {
    config: ClientConfig,
    deps: SessionDeps,
    identity: Identity,
    identity_store: IdentityStore,
    connection: Arc<ConnectionManager>,
    conversations: Arc<Mutex<ConversationStore>>,
    notifications: Arc<Mutex<NotificationAggregator>>,
    tokens: Vec<SubscriptionToken>,
    signals: broadcast::Sender<SessionSignal>,
    watcher: JoinHandle<()>,
}

impl ChatSession {
    /// Persist `identity`, wire the stores to the push channel and connect
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: ClientConfig, identity: Identity, deps: SessionDeps) -> ChatResult<Self> {
        let identity_store = IdentityStore::new(&config.identity_path);
        identity_store.save(&identity)?;

        let dispatcher = Arc::new(EventDispatcher::new());
        let connection = ConnectionManager::new(deps.transport.clone(), dispatcher.clone());
        let conversations = Arc::new(Mutex::new(ConversationStore::from_config(
            identity.clone(),
            &config,
        )));
        let notifications = Arc::new(Mutex::new(NotificationAggregator::new(config.page_limit)));
        let (signals, _) = broadcast::channel(32);

        let tokens = register_handlers(&dispatcher, &conversations, &notifications);
        let watcher = tokio::spawn(watch_invalid(
            connection.subscribe_invalid(),
            identity_store.clone(),
            signals.clone(),
        ));

        let session = Self {
            config,
            deps,
            identity: identity.clone(),
            identity_store,
            connection,
            conversations,
            notifications,
            tokens,
            signals,
            watcher,
        };
        session.connection.connect(Some(identity))?;
        info!(identity = %session.identity.id, role = %session.identity.role, "chat session started");
        Ok(session)
    }

    /// Start a session for the persisted identity, if there is one
    pub fn resume(config: ClientConfig, deps: SessionDeps) -> ChatResult<Option<Self>> {
        match IdentityStore::new(&config.identity_path).load()? {
            Some(identity) => Self::start(config, identity, deps).map(Some),
            None => {
                debug!("no persisted identity to resume");
                Ok(None)
            }
        }
    }

    /// Replace this session with a fresh one for another identity
    pub fn switch_identity(self, identity: Identity) -> ChatResult<Self> {
        let config = self.config.clone();
        let deps = self.deps.clone();
        drop(self);
        Self::start(config, identity, deps)
    }

    /// Tear the session down and forget the persisted identity
    pub fn logout(self) -> ChatResult<()> {
        info!(identity = %self.identity.id, "logging out");
        let store = self.identity_store.clone();
        drop(self);
        store.clear()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn connection_session(&self) -> ConnectionSession {
        self.connection.session()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionSession> {
        self.connection.subscribe_state()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    /// Force a fresh connection for the current identity
    pub fn reconnect(&self) -> ChatResult<()> {
        self.connection.reconnect()
    }

    /// Read the conversation store
    pub fn with_conversations<R>(&self, f: impl FnOnce(&ConversationStore) -> R) -> R {
        f(&*self.conversations.lock())
    }

    /// Read the notification feed
    pub fn with_notifications<R>(&self, f: impl FnOnce(&NotificationAggregator) -> R) -> R {
        f(&*self.notifications.lock())
    }

    /// Fetch a page of conversations and merge it into the store
    pub async fn load_conversations(&self, page: u32) -> ChatResult<usize> {
        let list = self
            .deps
            .conversation_api
            .fetch_conversations(page, self.config.page_limit)
            .await?;
        let count = list.len();
        self.conversations.lock().upsert_conversations(list);
        Ok(count)
    }

    /// Select a conversation, send its read receipt and load its latest history
    ///
    /// Returns how many history messages were new.
    pub async fn open_conversation(&self, conversation_id: &str) -> ChatResult<usize> {
        let receipt = self.conversations.lock().select_conversation(conversation_id);
        if let Err(e) = self.deps.conversation_api.mark_conversation_read(&receipt).await {
            warn!(conversation = conversation_id, error = %e, "read receipt not delivered");
        }
        self.load_history(conversation_id, 1).await
    }

    pub async fn load_history(&self, conversation_id: &str, page: u32) -> ChatResult<usize> {
        let messages = self
            .deps
            .conversation_api
            .fetch_messages(conversation_id, page, self.config.page_limit)
            .await?;
        Ok(self
            .conversations
            .lock()
            .merge_history(conversation_id, messages))
    }

    pub fn close_conversation(&self) {
        self.conversations.lock().clear_selection();
    }

    /// Send a message optimistically
    ///
    /// The provisional message is in the store before this returns, even
    /// when the push channel is down.
    pub fn send_message(&self, draft: MessageDraft) -> Message {
        let event = self.conversations.lock().send_message(draft);
        let ClientEvent::SendMessage(outbound) = &event;
        if let Err(e) = self.connection.emit(&event) {
            warn!(
                conversation = %outbound.message.conversation_id,
                error = %e,
                "message kept locally, push channel unavailable"
            );
        }
        outbound.message.clone()
    }

    /// Load a page of notifications; superseded responses count as zero
    pub async fn load_notifications(&self, page: u32) -> ChatResult<usize> {
        let result =
            notifications::load_page(&self.notifications, self.deps.notification_api.as_ref(), page).await;
        superseded_as_zero(result)
    }

    pub async fn load_more_notifications(&self) -> ChatResult<usize> {
        let result =
            notifications::load_next(&self.notifications, self.deps.notification_api.as_ref()).await;
        superseded_as_zero(result)
    }

    pub async fn mark_all_notifications_read(&self) -> ChatResult<()> {
        let result =
            notifications::mark_all_read(&self.notifications, self.deps.notification_api.as_ref()).await;
        self.report(result)
    }

    pub async fn mark_notification_read(&self, id: &str) -> ChatResult<()> {
        let result =
            notifications::mark_read(&self.notifications, self.deps.notification_api.as_ref(), id).await;
        self.report(result)
    }

    pub async fn clear_notifications(&self) -> ChatResult<()> {
        let result =
            notifications::clear(&self.notifications, self.deps.notification_api.as_ref()).await;
        self.report(result)
    }

    /// Turn user-visible failures into a notice, then pass the result on
    fn report<T>(&self, result: ChatResult<T>) -> ChatResult<T> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::UserVisible {
                let _ = self.signals.send(SessionSignal::Notice {
                    message: e.to_string(),
                });
            }
        }
        result
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let dispatcher = self.connection.dispatcher();
        for token in self.tokens.drain(..) {
            dispatcher.unsubscribe(token);
        }
        self.connection.disconnect();
        self.watcher.abort();
        debug!(identity = %self.identity.id, "chat session torn down");
    }
}

fn superseded_as_zero(result: ChatResult<usize>) -> ChatResult<usize> {
    match result {
        Err(e) if e.is_superseded() => Ok(0),
        other => other,
    }
}

fn register_handlers(
    dispatcher: &EventDispatcher,
    conversations: &Arc<Mutex<ConversationStore>>,
    notifications: &Arc<Mutex<NotificationAggregator>>,
) -> Vec<SubscriptionToken> {
    let store = conversations.clone();
    let on_message = dispatcher.subscribe(EventKind::NewMessage, move |event| {
        if let ServerEvent::NewMessage(message) = event {
            match store.lock().append_message(message.clone()) {
                Ok(outcome) => trace!(?outcome, "message applied"),
                Err(e) => debug!(error = %e, "message not applied"),
            }
        }
    });

    let feed = notifications.clone();
    let on_notification = dispatcher.subscribe(EventKind::NewNotification, move |event| {
        if let ServerEvent::NewNotification(notification) = event {
            if !feed.lock().receive_push(notification.clone()) {
                trace!(id = %notification.id, "notification already known");
            }
        }
    });

    vec![on_message, on_notification]
}

/// Forward credential rejections to the UI and drop the persisted identity
async fn watch_invalid(
    mut invalid: broadcast::Receiver<crate::connection::SessionInvalid>,
    identity_store: IdentityStore,
    signals: broadcast::Sender<SessionSignal>,
) {
    loop {
        match invalid.recv().await {
            Ok(signal) => {
                if let Err(e) = identity_store.clear() {
                    warn!(error = %e, "could not clear persisted identity");
                }
                let _ = signals.send(SessionSignal::SessionInvalid {
                    identity: signal.identity,
                    reason: signal.reason,
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "session-invalid signals lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("identity", &self.identity)
            .field("connection", &self.connection.session())
            .finish_non_exhaustive()
    }
}

