//! Integration tests for Chat Sync sessions
//!
//! The push channel is scripted through `ChannelTransport`; the REST
//! collaborators are in-memory fakes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use chat_sync::connection::RemoteEnd;
use chat_sync::identity_store::IdentityStore;
use chat_sync::rest::{ConversationApi, NotificationApi};
use chat_sync::{
    ChannelTransport, ChatError, ChatResult, ChatSession, ClientConfig, ClientEvent,
    ConnectionState, Conversation, DeliveryStatus, Identity, Message, MessageDraft, Notification,
    NotificationPage, Participants, ReadReceipt, ServerEvent, SessionDeps, SessionSignal,
};

#[derive(Default)]
struct FakeConversationApi {
    conversations: Vec<Conversation>,
    history: Vec<Message>,
    receipts: Mutex<Vec<ReadReceipt>>,
}

#[async_trait]
impl ConversationApi for FakeConversationApi {
    async fn fetch_conversations(&self, _page: u32, _limit: u32) -> ChatResult<Vec<Conversation>> {
        Ok(self.conversations.clone())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        _page: u32,
        _limit: u32,
    ) -> ChatResult<Vec<Message>> {
        Ok(self
            .history
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn mark_conversation_read(&self, receipt: &ReadReceipt) -> ChatResult<()> {
        self.receipts.lock().push(receipt.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakeNotificationApi {
    feed: Vec<Notification>,
    fail_mutations: AtomicBool,
    mutation_calls: AtomicUsize,
    /// Holds `mark_all_read` until the sender fires
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeNotificationApi {
    fn with_feed(count: usize) -> Self {
        Self {
            feed: (1..=count)
                .map(|i| Notification::new(format!("n{}", i), "booking", format!("update {}", i), "c1"))
                .collect(),
            ..Default::default()
        }
    }

    fn mutation(&self) -> ChatResult<()> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mutations.load(Ordering::SeqCst) {
            Err(ChatError::Api("network unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationApi for FakeNotificationApi {
    async fn fetch_notifications(&self, page: u32, limit: u32) -> ChatResult<NotificationPage> {
        let start = ((page.max(1) - 1) * limit) as usize;
        let data: Vec<Notification> = self
            .feed
            .iter()
            .skip(start)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(NotificationPage {
            data,
            total: self.feed.len() as u64,
            unread_total: self.feed.iter().filter(|n| !n.is_read).count() as u64,
        })
    }

    async fn mark_all_read(&self) -> ChatResult<()> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.mutation()
    }

    async fn mark_read(&self, _id: &str) -> ChatResult<()> {
        self.mutation()
    }

    async fn clear(&self) -> ChatResult<()> {
        self.mutation()
    }
}

struct Harness {
    session: ChatSession,
    remotes: UnboundedReceiver<RemoteEnd>,
    conversation_api: Arc<FakeConversationApi>,
    notification_api: Arc<FakeNotificationApi>,
    config: ClientConfig,
    _dir: TempDir,
}

fn config_in(dir: &TempDir) -> ClientConfig {
    ClientConfig {
        identity_path: dir.path().join("identity.json"),
        page_limit: 5,
        ..ClientConfig::default()
    }
}

fn start_with(
    conversation_api: FakeConversationApi,
    notification_api: FakeNotificationApi,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let (transport, remotes) = ChannelTransport::new();
    let conversation_api = Arc::new(conversation_api);
    let notification_api = Arc::new(notification_api);
    let deps = SessionDeps {
        transport: Arc::new(transport),
        conversation_api: conversation_api.clone(),
        notification_api: notification_api.clone(),
    };
    let session = ChatSession::start(config.clone(), Identity::client("c1"), deps).unwrap();
    Harness {
        session,
        remotes,
        conversation_api,
        notification_api,
        config,
        _dir: dir,
    }
}

fn start() -> Harness {
    start_with(FakeConversationApi::default(), FakeNotificationApi::default())
}

async fn wait_for_state(session: &ChatSession, state: ConnectionState) {
    let mut rx = session.subscribe_state();
    timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn vendor_message(id: &str, conversation_id: &str, text: &str) -> Message {
    Message::confirmed_text(id, conversation_id, "v1", text, Utc::now())
}

#[tokio::test]
async fn test_login_connects_and_persists_identity() {
    let mut h = start();
    assert_eq!(h.session.connection_session().state, ConnectionState::Connecting);

    let remote = h.remotes.recv().await.unwrap();
    assert_eq!(remote.handshake.identity, Identity::client("c1"));
    remote.connected();
    wait_for_state(&h.session, ConnectionState::Connected).await;

    let persisted = IdentityStore::new(&h.config.identity_path).load().unwrap();
    assert_eq!(persisted, Some(Identity::client("c1")));
}

#[tokio::test]
async fn test_unauthorized_then_fresh_connect() {
    let mut h = start();
    let mut signals = h.session.subscribe_signals();
    let first = h.remotes.recv().await.unwrap();
    first.connected();
    wait_for_state(&h.session, ConnectionState::Connected).await;

    first.push(&ServerEvent::Error {
        message: "Unauthorized access".into(),
        code: None,
    });
    wait_for_state(&h.session, ConnectionState::Unauthorized).await;
    assert!(first.is_closed());

    let signal = timeout(Duration::from_secs(2), signals.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(signal, SessionSignal::SessionInvalid { ref identity, .. } if identity.id == "c1"));
    let store = IdentityStore::new(&h.config.identity_path);
    eventually(|| matches!(store.load(), Ok(None))).await;

    // The dead instance no longer drives anything
    first.connected();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(h.session.connection_session().state, ConnectionState::Unauthorized);

    h.session.reconnect().unwrap();
    let second = h.remotes.recv().await.unwrap();
    assert!(h.remotes.try_recv().is_err());
    second.connected();
    wait_for_state(&h.session, ConnectionState::Connected).await;
    assert!(!second.is_closed());
    assert_eq!(h.session.connection_session().instance, 2);
}

#[tokio::test]
async fn test_pushes_reach_store_across_reconnect() {
    let mut h = start();
    let first = h.remotes.recv().await.unwrap();
    first.connected();
    first.push(&ServerEvent::NewMessage(vendor_message("m1", "conv-1", "hello")));
    eventually(|| h.session.with_conversations(|s| s.messages("conv-1").len() == 1)).await;

    h.session.reconnect().unwrap();
    let second = h.remotes.recv().await.unwrap();
    second.connected();
    // Replay of m1 plus a new message; the stale link is ignored
    first.push(&ServerEvent::NewMessage(vendor_message("stale", "conv-1", "ghost")));
    second.push(&ServerEvent::NewMessage(vendor_message("m1", "conv-1", "hello")));
    second.push(&ServerEvent::NewMessage(vendor_message("m2", "conv-1", "again")));

    eventually(|| h.session.with_conversations(|s| s.messages("conv-1").len() == 2)).await;
    sleep(Duration::from_millis(20)).await;
    h.session.with_conversations(|store| {
        let ids: Vec<_> = store
            .messages("conv-1")
            .iter()
            .filter_map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(store.unread_count("conv-1"), 2);
    });
    assert_eq!(h.session.connection().dispatcher().listener_count(), 2);
}

#[tokio::test]
async fn test_send_message_reconciles_with_echo() {
    let mut h = start();
    let mut remote = h.remotes.recv().await.unwrap();
    remote.connected();
    wait_for_state(&h.session, ConnectionState::Connected).await;

    let sent = h
        .session
        .send_message(MessageDraft::text("conv-1", "v1", "is Friday free?").with_recipient_name("Studio"));
    assert!(sent.is_provisional());

    let frame = timeout(Duration::from_secs(2), remote.recv_frame())
        .await
        .unwrap()
        .unwrap();
    let ClientEvent::SendMessage(outbound) = serde_json::from_str::<ClientEvent>(&frame).unwrap();
    assert_eq!(outbound.recipient_id, "v1");
    assert_eq!(outbound.recipient_name.as_deref(), Some("Studio"));
    assert_eq!(outbound.message.client_key, sent.client_key);

    let mut echo = outbound.message.clone();
    echo.id = Some("srv-1".into());
    echo.status = DeliveryStatus::Delivered;
    remote.push(&ServerEvent::NewMessage(echo));

    eventually(|| {
        h.session.with_conversations(|s| {
            s.messages("conv-1")
                .first()
                .map_or(false, |m| m.id.as_deref() == Some("srv-1"))
        })
    })
    .await;
    h.session.with_conversations(|store| {
        assert_eq!(store.messages("conv-1").len(), 1);
        assert_eq!(store.unread_count("conv-1"), 0);
    });
}

#[tokio::test]
async fn test_send_while_offline_keeps_provisional() {
    let mut h = start();
    let remote = h.remotes.recv().await.unwrap();
    remote.push(&ServerEvent::Error {
        message: "rejected".into(),
        code: Some("unauthorized".into()),
    });
    wait_for_state(&h.session, ConnectionState::Unauthorized).await;

    let sent = h.session.send_message(MessageDraft::text("conv-1", "v1", "still here?"));
    h.session.with_conversations(|store| {
        let messages = store.messages("conv-1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].client_key, sent.client_key);
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
    });
}

#[tokio::test]
async fn test_selected_conversation_unread() {
    let me = Identity::client("c1");
    let api = FakeConversationApi {
        conversations: vec![
            Conversation::new("a", Participants::from_pair(&me, "v1")),
            Conversation::new("b", Participants::from_pair(&me, "v2")),
        ],
        ..Default::default()
    };
    let mut h = start_with(api, FakeNotificationApi::default());
    assert_eq!(h.session.load_conversations(1).await.unwrap(), 2);
    h.session.open_conversation("a").await.unwrap();

    let remote = h.remotes.recv().await.unwrap();
    remote.connected();
    for i in 0..3 {
        remote.push(&ServerEvent::NewMessage(vendor_message(&format!("a{}", i), "a", "x")));
        remote.push(&ServerEvent::NewMessage(vendor_message(&format!("b{}", i), "b", "x")));
    }

    eventually(|| h.session.with_conversations(|s| s.unread_count("b") == 3)).await;
    h.session.with_conversations(|s| assert_eq!(s.unread_count("a"), 0));

    let receipts = h.conversation_api.receipts.lock().clone();
    assert_eq!(
        receipts,
        vec![ReadReceipt {
            conversation_id: "a".into(),
            reader_id: "c1".into(),
        }]
    );
}

#[tokio::test]
async fn test_open_conversation_merges_history() {
    let now = Utc::now();
    let api = FakeConversationApi {
        history: vec![
            Message::confirmed_text("h1", "a", "v1", "first", now - chrono::Duration::minutes(3)),
            Message::confirmed_text("h2", "a", "c1", "second", now - chrono::Duration::minutes(2)),
        ],
        ..Default::default()
    };
    let h = start_with(api, FakeNotificationApi::default());

    assert_eq!(h.session.open_conversation("a").await.unwrap(), 2);
    assert_eq!(h.session.open_conversation("a").await.unwrap(), 0);
    h.session.with_conversations(|store| {
        assert_eq!(store.selected(), Some("a"));
        assert_eq!(store.messages("a").len(), 2);
    });

    h.session.close_conversation();
    h.session.with_conversations(|store| assert_eq!(store.selected(), None));
}

#[tokio::test]
async fn test_notification_pages_and_push() {
    let mut h = start_with(FakeConversationApi::default(), FakeNotificationApi::with_feed(10));
    assert_eq!(h.session.load_notifications(1).await.unwrap(), 5);
    assert_eq!(h.session.load_more_notifications().await.unwrap(), 5);

    let remote = h.remotes.recv().await.unwrap();
    remote.connected();
    remote.push(&ServerEvent::NewNotification(Notification::new(
        "n11", "booking", "new booking", "c1",
    )));

    eventually(|| h.session.with_notifications(|f| f.items().len() == 11)).await;
    h.session.with_notifications(|feed| {
        let ids: Vec<_> = feed.items().iter().map(|n| n.id.as_str()).collect();
        let mut expected = vec!["n11".to_string()];
        expected.extend((1..=10).map(|i| format!("n{}", i)));
        assert_eq!(ids, expected);
        assert_eq!(feed.unread_count(), 11);
        assert!(!feed.has_more());
    });
}

#[tokio::test]
async fn test_mark_all_read_failure_rolls_back_with_notice() {
    let api = FakeNotificationApi::with_feed(3);
    api.fail_mutations.store(true, Ordering::SeqCst);
    let h = start_with(FakeConversationApi::default(), api);
    let mut signals = h.session.subscribe_signals();
    h.session.load_notifications(1).await.unwrap();
    let before: Vec<Notification> = h.session.with_notifications(|f| f.items().to_vec());

    let err = h.session.mark_all_notifications_read().await.unwrap_err();
    assert!(matches!(err, ChatError::MutationFailure { .. }));
    assert_eq!(h.notification_api.mutation_calls.load(Ordering::SeqCst), 1);

    h.session.with_notifications(|feed| {
        assert_eq!(feed.items(), before.as_slice());
        assert_eq!(feed.unread_count(), 3);
    });
    let signal = signals.try_recv().unwrap();
    assert!(matches!(signal, SessionSignal::Notice { ref message } if message.contains("mark all notifications read")));
}

#[tokio::test]
async fn test_push_during_failed_mark_all_read_survives() {
    let api = FakeNotificationApi::with_feed(3);
    api.fail_mutations.store(true, Ordering::SeqCst);
    let (release, gate) = oneshot::channel();
    *api.gate.lock() = Some(gate);
    let mut h = start_with(FakeConversationApi::default(), api);
    let remote = h.remotes.recv().await.unwrap();
    remote.connected();
    wait_for_state(&h.session, ConnectionState::Connected).await;
    h.session.load_notifications(1).await.unwrap();

    let session = &h.session;
    let (result, ()) = tokio::join!(session.mark_all_notifications_read(), async {
        eventually(|| session.with_notifications(|f| f.unread_count() == 0)).await;
        remote.push(&ServerEvent::NewNotification(Notification::new(
            "n4", "booking", "late booking", "c1",
        )));
        eventually(|| session.with_notifications(|f| f.items().len() == 4)).await;
        let _ = release.send(());
    });

    assert!(matches!(result, Err(ChatError::MutationFailure { .. })));
    h.session.with_notifications(|feed| {
        let ids: Vec<_> = feed.items().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n4", "n1", "n2", "n3"]);
        assert!(feed.items().iter().all(|n| !n.is_read));
        assert_eq!(feed.unread_count(), 4);
        assert_eq!(feed.total(), 4);
    });
}

#[tokio::test]
async fn test_clear_notifications() {
    let h = start_with(FakeConversationApi::default(), FakeNotificationApi::with_feed(3));
    h.session.load_notifications(1).await.unwrap();
    h.session.mark_notification_read("n2").await.unwrap();
    h.session.with_notifications(|f| assert_eq!(f.unread_count(), 2));

    h.session.clear_notifications().await.unwrap();
    h.session.with_notifications(|feed| {
        assert!(feed.items().is_empty());
        assert_eq!(feed.unread_count(), 0);
        assert_eq!(feed.current_page(), 0);
    });
}

#[tokio::test]
async fn test_resume_and_logout() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let (transport, mut remotes) = ChannelTransport::new();
    let deps = SessionDeps {
        transport: Arc::new(transport),
        conversation_api: Arc::new(FakeConversationApi::default()),
        notification_api: Arc::new(FakeNotificationApi::default()),
    };

    assert!(ChatSession::resume(config.clone(), deps.clone()).unwrap().is_none());

    IdentityStore::new(&config.identity_path)
        .save(&Identity::vendor("v9"))
        .unwrap();
    let session = ChatSession::resume(config.clone(), deps.clone()).unwrap().unwrap();
    assert_eq!(session.identity(), &Identity::vendor("v9"));
    let remote = remotes.recv().await.unwrap();
    assert_eq!(remote.handshake.identity.id, "v9");

    let session = session.switch_identity(Identity::vendor("v10")).unwrap();
    assert!(remote.is_closed());
    let switched = remotes.recv().await.unwrap();
    assert_eq!(switched.handshake.identity.id, "v10");

    session.logout().unwrap();
    assert!(switched.is_closed());
    assert_eq!(IdentityStore::new(&config.identity_path).load().unwrap(), None);
}
