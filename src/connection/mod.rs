//! Connection manager
//!
//! Owns the single live push connection for the current identity and
//! publishes every state transition on a `watch` channel:
//!
//! ```text
//! Unauthenticated -> Connecting -> Connected -> Disconnected | Error | Unauthorized
//!                        ^              |            |
//!                        +--------------+------------+   (transport retries)
//! ```
//!
//! `Unauthorized` is terminal for the connection instance: the link is
//! closed (which also stops transport retries), handlers are unbound and a
//! [`SessionInvalid`] signal is broadcast. Domain events are never buffered
//! here; they go straight to the [`EventDispatcher`].

pub mod transport;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::dispatcher::EventDispatcher;
use crate::error::{ChatError, ChatResult};
use crate::protocol::{ClientEvent, Envelope, Handshake, ServerEvent};
use crate::types::{ConnectionSession, ConnectionState, Identity};

pub use transport::{
    ChannelTransport, LinkCloser, RemoteEnd, Transport, TransportEvent, TransportLink, WsTransport,
};

/// Broadcast when the server rejects the identity's credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInvalid {
    pub identity: Identity,
    pub reason: String,
}

struct LiveConnection {
    instance: u64,
    identity: Identity,
    outbound: mpsc::Sender<String>,
    closer: LinkCloser,
    next_sequence: u64,
}

#[derive(Default)]
struct Inner {
    live: Option<LiveConnection>,
    /// Identity of the most recent connect, kept for `reconnect`
    identity: Option<Identity>,
    last_instance: u64,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionSession>,
    invalid_tx: broadcast::Sender<SessionInvalid>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Arc<EventDispatcher>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionSession::unauthenticated());
        let (invalid_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            transport,
            dispatcher,
            inner: Mutex::new(Inner::default()),
            state_tx,
            invalid_tx,
        })
    }

    /// Current session snapshot
    pub fn session(&self) -> ConnectionSession {
        self.state_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().state
    }

    /// Receive every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionSession> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_invalid(&self) -> broadcast::Receiver<SessionInvalid> {
        self.invalid_tx.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Whether a live connection exists that the transport is still driving
    pub fn is_healthy(&self) -> bool {
        let inner = self.inner.lock();
        self.is_healthy_locked(&inner)
    }

    fn is_healthy_locked(&self, inner: &Inner) -> bool {
        match &inner.live {
            Some(live) => !live.closer.is_closed() && self.state().is_recoverable(),
            None => false,
        }
    }

    /// Connect as `identity`
    ///
    /// A no-op when a healthy connection for the same identity exists. A
    /// different identity replaces the live connection.
    pub fn connect(self: &Arc<Self>, identity: Option<Identity>) -> ChatResult<()> {
        let identity = identity.ok_or(ChatError::NoIdentity)?;
        let mut inner = self.inner.lock();

        if let Some(live) = &inner.live {
            if live.identity == identity && self.is_healthy_locked(&inner) {
                debug!(identity = %identity.id, "connection already live");
                return Ok(());
            }
        }

        self.teardown_locked(&mut inner);
        self.open_locked(&mut inner, identity)
    }

    /// Replace the live connection with a fresh one for the current identity
    pub fn reconnect(self: &Arc<Self>) -> ChatResult<()> {
        let mut inner = self.inner.lock();
        let identity = inner.identity.clone().ok_or(ChatError::NoIdentity)?;
        info!(identity = %identity.id, "forcing reconnect");
        self.teardown_locked(&mut inner);
        self.open_locked(&mut inner, identity)
    }

    /// Close the live connection and forget the identity (logout)
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        self.teardown_locked(&mut inner);
        inner.identity = None;
        self.set_session(ConnectionSession::unauthenticated());
    }

    /// Queue an outbound event on the live connection
    ///
    /// Frames queued while the transport is retrying are flushed once it
    /// reconnects. Without a live connection the event is dropped and a
    /// `Connection` error returned.
    pub fn emit(&self, event: &ClientEvent) -> ChatResult<()> {
        let frame = event.to_frame()?;
        let inner = self.inner.lock();
        let live = inner
            .live
            .as_ref()
            .ok_or_else(|| ChatError::Connection("no live connection".into()))?;
        live.outbound
            .try_send(frame)
            .map_err(|e| ChatError::Connection(format!("outbound queue rejected frame: {}", e)))
    }

    fn open_locked(self: &Arc<Self>, inner: &mut Inner, identity: Identity) -> ChatResult<()> {
        inner.last_instance += 1;
        let instance = inner.last_instance;
        inner.identity = Some(identity.clone());

        self.set_session(ConnectionSession {
            state: ConnectionState::Connecting,
            identity: Some(identity.clone()),
            instance,
            last_error: None,
        });

        let link = match self.transport.open(Handshake::new(identity.clone())) {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "transport refused to open");
                self.update_session(ConnectionState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        self.dispatcher.bind(instance);
        info!(identity = %identity.id, role = %identity.role, instance, "push connection opening");

        let TransportLink {
            outbound,
            inbound,
            closer,
        } = link;
        inner.live = Some(LiveConnection {
            instance,
            identity,
            outbound,
            closer: closer.clone(),
            next_sequence: 0,
        });

        tokio::spawn(pump(Arc::downgrade(self), instance, inbound, closer));
        Ok(())
    }

    fn teardown_locked(&self, inner: &mut Inner) {
        if let Some(live) = inner.live.take() {
            live.closer.close();
            self.dispatcher.unbind(live.instance);
            debug!(instance = live.instance, "push connection closed");
        }
    }

    /// Apply one transport event for `instance`
    ///
    /// Events for an instance that is no longer live are ignored.
    pub(crate) fn handle_transport_event(&self, instance: u64, event: TransportEvent) {
        let mut to_dispatch: Vec<Envelope> = Vec::new();

        {
            let mut inner = self.inner.lock();
            let live_instance = inner.live.as_ref().map(|live| live.instance);
            if live_instance != Some(instance) {
                debug!(instance, ?event, "ignoring event from stale connection");
                return;
            }

            let server_event = match event {
                TransportEvent::Connected => {
                    self.update_session(ConnectionState::Connected, None);
                    Some(ServerEvent::Connect)
                }
                TransportEvent::Frame(text) => match ServerEvent::parse(&text) {
                    Ok(event) if event.is_unauthorized() => {
                        let reason = match &event {
                            ServerEvent::Error { message, .. } => message.clone(),
                            _ => "unauthorized".to_string(),
                        };
                        self.terminate_unauthorized(&mut inner, reason);
                        None
                    }
                    Ok(ServerEvent::Error { message, code }) => {
                        // Application-level error; the socket itself is fine
                        warn!(%message, ?code, "server reported error");
                        self.update_session(self.state(), Some(message.clone()));
                        Some(ServerEvent::Error { message, code })
                    }
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "rejected push frame");
                        None
                    }
                },
                TransportEvent::ConnectError(message) | TransportEvent::Error(message)
                    if message.to_ascii_lowercase().contains("unauthorized") =>
                {
                    self.terminate_unauthorized(&mut inner, message);
                    None
                }
                TransportEvent::ConnectError(message) => {
                    self.update_session(ConnectionState::Error, Some(message.clone()));
                    Some(ServerEvent::ConnectError { message })
                }
                TransportEvent::Error(message) => {
                    self.update_session(ConnectionState::Error, Some(message.clone()));
                    Some(ServerEvent::Error {
                        message,
                        code: None,
                    })
                }
                TransportEvent::ReconnectAttempt(attempt) => {
                    self.update_session(ConnectionState::Connecting, None);
                    Some(ServerEvent::ReconnectAttempt { attempt })
                }
                TransportEvent::Closed => {
                    self.update_session(ConnectionState::Disconnected, None);
                    None
                }
                TransportEvent::Terminated => {
                    // Transport gave up; the next connect() must open a fresh one
                    self.teardown_locked(&mut inner);
                    self.update_session(ConnectionState::Disconnected, None);
                    None
                }
            };

            if let (Some(event), Some(live)) = (server_event, inner.live.as_mut()) {
                to_dispatch.push(Envelope {
                    instance,
                    sequence: live.next_sequence,
                    event,
                });
                live.next_sequence += 1;
            }
        }

        for envelope in to_dispatch {
            self.dispatcher.dispatch(envelope);
        }
    }

    fn terminate_unauthorized(&self, inner: &mut Inner, reason: String) {
        let identity = inner.live.as_ref().map(|live| live.identity.clone());
        self.teardown_locked(inner);
        warn!(%reason, "server rejected credentials; automatic reconnection disabled");
        self.update_session(ConnectionState::Unauthorized, Some(reason.clone()));
        if let Some(identity) = identity {
            let _ = self.invalid_tx.send(SessionInvalid { identity, reason });
        }
    }

    fn set_session(&self, session: ConnectionSession) {
        self.state_tx.send_if_modified(|current| {
            if *current == session {
                return false;
            }
            if current.state != session.state {
                info!(from = %current.state, to = %session.state, instance = session.instance, "connection state");
            }
            *current = session;
            true
        });
    }

    fn update_session(&self, state: ConnectionState, last_error: Option<String>) {
        let mut next = self.session();
        next.state = state;
        next.last_error = last_error;
        self.set_session(next);
    }
}

/// Feed one link's transport events into the manager, in order
async fn pump(
    manager: Weak<ConnectionManager>,
    instance: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    closer: LinkCloser,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = inbound.recv() => event,
            _ = closer.closed() => None,
        };
        let Some(event) = event else { break };
        let terminated = event == TransportEvent::Terminated;

        match manager.upgrade() {
            Some(manager) => manager.handle_transport_event(instance, event),
            None => break,
        }
        if terminated {
            break;
        }
    }
    debug!(instance, "connection pump finished");
}
