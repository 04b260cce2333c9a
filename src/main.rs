//! Chat Sync - push channel watcher
//!
//! Connects to the push channel as the persisted identity (or one given on
//! the command line) and logs every state transition and inbound event
//! until Ctrl+C.
//!
//! ```text
//! chat-sync-watch [--client <ID> | --vendor <ID>]
//! ```

use std::sync::Arc;

use clap::{ArgGroup, Parser};
use chat_sync::config::ClientConfig;
use chat_sync::connection::{ConnectionManager, WsTransport};
use chat_sync::dispatcher::EventDispatcher;
use chat_sync::error::{ChatError, ChatResult};
use chat_sync::identity_store::IdentityStore;
use chat_sync::logging::init_tracing;
use chat_sync::protocol::{EventKind, ServerEvent};
use chat_sync::types::Identity;
use tokio::sync::Notify;
use tracing::{error, info, warn};

const ALL_EVENTS: [EventKind; 6] = [
    EventKind::Connect,
    EventKind::ConnectError,
    EventKind::Error,
    EventKind::ReconnectAttempt,
    EventKind::NewMessage,
    EventKind::NewNotification,
];

#[derive(Parser, Debug)]
#[command(name = "chat-sync-watch", version, about = "Log push channel transitions and events until Ctrl+C")]
#[command(group(ArgGroup::new("identity").args(["client", "vendor"])))]
struct Args {
    /// Connect as this client and persist it; defaults to the saved identity
    #[arg(long, value_name = "ID")]
    client: Option<String>,

    /// Connect as this vendor and persist it
    #[arg(long, value_name = "ID")]
    vendor: Option<String>,
}

impl Args {
    fn identity(&self) -> Option<Identity> {
        match (&self.client, &self.vendor) {
            (Some(id), _) => Some(Identity::client(id.as_str())),
            (None, Some(id)) => Some(Identity::vendor(id.as_str())),
            (None, None) => None,
        }
    }
}

fn describe(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Connect => "connected".to_string(),
        ServerEvent::ConnectError { message } => format!("connect error: {}", message),
        ServerEvent::Error { message, code } => match code {
            Some(code) => format!("error [{}]: {}", code, message),
            None => format!("error: {}", message),
        },
        ServerEvent::ReconnectAttempt { attempt } => format!("reconnect attempt {}", attempt),
        ServerEvent::NewMessage(message) => format!(
            "message {} in {} from {}: {}",
            message.id.as_deref().unwrap_or("?"),
            message.conversation_id,
            message.sender_id,
            message.text().unwrap_or("<attachment>")
        ),
        ServerEvent::NewNotification(notification) => {
            format!("notification {} ({}): {}", notification.id, notification.kind, notification.message)
        }
    }
}

#[tokio::main]
async fn main() -> ChatResult<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = ClientConfig::from_env()?;
    let identity_store = IdentityStore::new(&config.identity_path);

    let identity = match args.identity() {
        Some(identity) => {
            identity_store.save(&identity)?;
            identity
        }
        None => identity_store.load()?.ok_or(ChatError::NoIdentity)?,
    };

    let dispatcher = Arc::new(EventDispatcher::new());
    for kind in ALL_EVENTS {
        dispatcher.subscribe(kind, |event| info!("{}", describe(event)));
    }

    let transport = Arc::new(WsTransport::from_config(&config));
    let manager = ConnectionManager::new(transport, dispatcher);

    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.notify_one())
            .map_err(|e| ChatError::Config(format!("cannot install Ctrl+C handler: {}", e)))?;
    }

    let mut states = manager.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let session = states.borrow_and_update().clone();
            match &session.last_error {
                Some(last_error) => warn!(state = %session.state, instance = session.instance, %last_error, "state changed"),
                None => info!(state = %session.state, instance = session.instance, "state changed"),
            }
        }
    });

    let mut invalid = manager.subscribe_invalid();
    {
        let shutdown = shutdown.clone();
        let identity_store = identity_store.clone();
        tokio::spawn(async move {
            if let Ok(signal) = invalid.recv().await {
                error!(identity = %signal.identity.id, reason = %signal.reason, "credentials rejected, sign in again");
                if let Err(e) = identity_store.clear() {
                    warn!(error = %e, "could not clear persisted identity");
                }
                shutdown.notify_one();
            }
        });
    }

    info!(
        version = chat_sync::VERSION,
        url = %config.push_url,
        identity = %identity.id,
        role = %identity.role,
        "watching push channel"
    );
    manager.connect(Some(identity))?;

    shutdown.notified().await;
    info!("shutting down");
    manager.disconnect();
    Ok(())
}
