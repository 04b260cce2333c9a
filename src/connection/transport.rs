//! Push transports
//!
//! A transport turns a handshake into a [`TransportLink`]: an outbound frame
//! sender, an inbound stream of [`TransportEvent`]s and a close handle.
//! Retry with backoff is the transport's job; the connection manager only
//! observes the lifecycle events it reports.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{ChatError, ChatResult};
use crate::protocol::{Handshake, ServerEvent};

/// Lifecycle and data events reported by a transport, in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket open (first connect or a successful retry)
    Connected,
    /// A text frame from the server
    Frame(String),
    /// Establishing the socket failed
    ConnectError(String),
    /// The open socket failed
    Error(String),
    /// A retry is starting (1-based)
    ReconnectAttempt(u32),
    /// The socket dropped; a retry may follow
    Closed,
    /// No further events will be produced
    Terminated,
}

/// Close handle shared between a link and its owner
///
/// Closing also disables any further automatic retries of the link.
#[derive(Debug, Clone)]
pub struct LinkCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl LinkCloser {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for LinkCloser {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    pub closer: LinkCloser,
}

pub trait Transport: Send + Sync {
    /// Start a connection for `handshake`; must be called inside a tokio runtime
    fn open(&self, handshake: Handshake) -> ChatResult<TransportLink>;
}

/// WebSocket transport with exponential backoff between attempts
pub struct WsTransport {
    url: String,
    policy: ReconnectPolicy,
    outbound_buffer: usize,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            policy,
            outbound_buffer: 256,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.push_url.clone(),
            policy: config.reconnect.clone(),
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }
}

impl Transport for WsTransport {
    fn open(&self, handshake: Handshake) -> ChatResult<TransportLink> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ChatError::Connection("no tokio runtime available".into()));
        }

        let url = handshake.to_url(&self.url);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closer = LinkCloser::new();

        tokio::spawn(run_socket(
            url,
            self.policy.clone(),
            outbound_rx,
            inbound_tx,
            closer.clone(),
        ));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            closer,
        })
    }
}

/// Socket loop: connect, pump frames, back off, retry until closed
async fn run_socket(
    url: String,
    policy: ReconnectPolicy,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
    closer: LinkCloser,
) {
    let mut attempt: u32 = 0;

    'connect: loop {
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = closer.closed() => break 'connect,
        };

        match connected {
            Ok((stream, _response)) => {
                attempt = 0;
                info!("push socket connected");
                let _ = inbound.send(TransportEvent::Connected);
                let (mut sink, mut source) = stream.split();

                loop {
                    tokio::select! {
                        _ = closer.closed() => {
                            let _ = sink.send(WsFrame::Close(None)).await;
                            break 'connect;
                        }
                        frame = outbound.recv() => match frame {
                            Some(text) => {
                                if let Err(e) = sink.send(WsFrame::Text(text)).await {
                                    let _ = inbound.send(TransportEvent::Error(e.to_string()));
                                    break;
                                }
                            }
                            // Owner dropped the link
                            None => {
                                let _ = sink.send(WsFrame::Close(None)).await;
                                break 'connect;
                            }
                        },
                        received = source.next() => match received {
                            Some(Ok(WsFrame::Text(text))) => {
                                let _ = inbound.send(TransportEvent::Frame(text));
                            }
                            Some(Ok(WsFrame::Close(_))) | None => {
                                let _ = inbound.send(TransportEvent::Closed);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = inbound.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "push socket connect failed");
                let _ = inbound.send(TransportEvent::ConnectError(e.to_string()));
            }
        }

        attempt += 1;
        if !policy.allows(attempt) {
            warn!(attempts = attempt - 1, "giving up on push socket");
            break;
        }
        let delay = policy.delay_for(attempt);
        debug!(attempt, ?delay, "backing off before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = closer.closed() => break 'connect,
        }
        let _ = inbound.send(TransportEvent::ReconnectAttempt(attempt));
    }

    let _ = inbound.send(TransportEvent::Terminated);
}

/// Far end of a [`ChannelTransport`] link
///
/// Lets the owner play the server: report lifecycle events, push frames and
/// read what the client emitted.
pub struct RemoteEnd {
    pub handshake: Handshake,
    events: mpsc::UnboundedSender<TransportEvent>,
    frames: mpsc::Receiver<String>,
    closer: LinkCloser,
}

impl RemoteEnd {
    pub fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn connected(&self) {
        self.send(TransportEvent::Connected);
    }

    /// Push a server event as a text frame
    pub fn push(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(frame) => self.send(TransportEvent::Frame(frame)),
            Err(e) => warn!(error = %e, "could not encode server event"),
        }
    }

    pub fn push_raw(&self, frame: &str) {
        self.send(TransportEvent::Frame(frame.to_string()));
    }

    /// Next frame emitted by the client, if one is queued
    pub fn try_recv_frame(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }

    pub async fn recv_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

/// In-memory transport; each `open` hands a [`RemoteEnd`] to the receiver
/// returned by [`ChannelTransport::new`]
pub struct ChannelTransport {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    outbound_buffer: usize,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes: tx,
                outbound_buffer: 64,
            },
            rx,
        )
    }
}

impl Transport for ChannelTransport {
    fn open(&self, handshake: Handshake) -> ChatResult<TransportLink> {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closer = LinkCloser::new();

        let remote = RemoteEnd {
            handshake,
            events: inbound_tx,
            frames: outbound_rx,
            closer: closer.clone(),
        };
        self.remotes
            .send(remote)
            .map_err(|_| ChatError::Connection("channel transport has no listener".into()))?;

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            closer,
        })
    }
}
