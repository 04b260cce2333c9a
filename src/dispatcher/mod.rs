//! Event dispatcher
//!
//! Handlers are registered against the dispatcher, not against a socket, so
//! they survive reconnects: the connection manager binds each new connection
//! instance on creation and unbinds it on teardown. While an instance is
//! bound, its events are delivered in wire order; events from any other
//! instance are dropped.
//!
//! The dispatcher does not deduplicate. Stores are expected to apply events
//! idempotently.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::protocol::{Envelope, EventKind, ServerEvent};

pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Returned by [`EventDispatcher::subscribe`]; pass back to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    id: u64,
    kind: EventKind,
}

impl SubscriptionToken {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

struct Registration {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    instance: u64,
    last_sequence: Option<u64>,
}

#[derive(Default)]
struct DispatcherInner {
    registrations: Vec<Registration>,
    next_id: u64,
    binding: Option<Binding>,
}

#[derive(Default)]
pub struct EventDispatcher {
    inner: Mutex<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.registrations.push(Registration {
            id,
            kind,
            handler: Arc::new(handler),
        });
        debug!(%kind, id, "handler subscribed");
        SubscriptionToken { id, kind }
    }

    /// Remove a handler; returns false if the token was already used
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.registrations.len();
        inner.registrations.retain(|r| r.id != token.id);
        before != inner.registrations.len()
    }

    /// Attach all registered handlers to a connection instance
    pub fn bind(&self, instance: u64) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.binding {
            if previous.instance != instance {
                debug!(previous = previous.instance, instance, "rebinding handlers");
            }
        }
        inner.binding = Some(Binding {
            instance,
            last_sequence: None,
        });
    }

    /// Detach handlers from `instance`; a no-op if another instance is bound
    pub fn unbind(&self, instance: u64) {
        let mut inner = self.inner.lock();
        if inner.binding.map(|b| b.instance) == Some(instance) {
            inner.binding = None;
            debug!(instance, "handlers unbound");
        }
    }

    pub fn bound_instance(&self) -> Option<u64> {
        self.inner.lock().binding.map(|b| b.instance)
    }

    /// Registered handlers, bound or not
    pub fn listener_count(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    /// Handlers currently attached to a live connection
    pub fn bound_listener_count(&self) -> usize {
        let inner = self.inner.lock();
        if inner.binding.is_some() {
            inner.registrations.len()
        } else {
            0
        }
    }

    /// Deliver an event to the handlers registered for its kind
    ///
    /// Returns how many handlers ran. Events for an unbound instance, or
    /// that do not advance the instance's sequence, are dropped.
    pub fn dispatch(&self, envelope: Envelope) -> usize {
        let kind = envelope.event.kind();
        let handlers: Vec<Handler> = {
            let mut inner = self.inner.lock();
            let binding = match inner.binding.as_mut() {
                Some(binding) if binding.instance == envelope.instance => binding,
                _ => {
                    trace!(instance = envelope.instance, %kind, "dropping event for unbound instance");
                    return 0;
                }
            };
            if binding
                .last_sequence
                .map_or(false, |last| envelope.sequence <= last)
            {
                debug!(sequence = envelope.sequence, %kind, "dropping out-of-order event");
                return 0;
            }
            binding.last_sequence = Some(envelope.sequence);

            inner
                .registrations
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.handler.clone())
                .collect()
        };

        // Handlers run without the lock so they may subscribe or unsubscribe
        for handler in &handlers {
            handler(&envelope.event);
        }
        handlers.len()
    }
}
