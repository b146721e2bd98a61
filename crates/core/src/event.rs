use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use minidom::Element;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::EventBusError;

/// Kind of a PubSub notification, used to pick channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ItemPublished,
    LastPublishedItem,
    ItemDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ItemPublished => "item-published",
            EventKind::LastPublishedItem => "last-published-item",
            EventKind::ItemDeleted => "item-deleted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified PubSub push notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubEvent {
    /// An item was newly published on `node`. `entry` is `None` when the
    /// service sent the notification without a payload.
    ItemPublished {
        node: String,
        id: String,
        entry: Option<Element>,
    },
    /// Replay of the last item published on `node`, marked with a delay stamp.
    LastPublishedItem {
        node: String,
        id: String,
        entry: Option<Element>,
        timestamp: String,
    },
    /// An item was retracted from `node`.
    ItemDeleted { node: String, id: String },
}

impl PubSubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PubSubEvent::ItemPublished { .. } => EventKind::ItemPublished,
            PubSubEvent::LastPublishedItem { .. } => EventKind::LastPublishedItem,
            PubSubEvent::ItemDeleted { .. } => EventKind::ItemDeleted,
        }
    }

    pub fn node(&self) -> &str {
        match self {
            PubSubEvent::ItemPublished { node, .. }
            | PubSubEvent::LastPublishedItem { node, .. }
            | PubSubEvent::ItemDeleted { node, .. } => node,
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            PubSubEvent::ItemPublished { id, .. }
            | PubSubEvent::LastPublishedItem { id, .. }
            | PubSubEvent::ItemDeleted { id, .. } => id,
        }
    }

    /// The delay stamp of a last-published replay, if it is valid RFC 3339.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            PubSubEvent::LastPublishedItem { timestamp, .. } => DateTime::parse_from_rfc3339(timestamp)
                .ok()
                .map(|stamp| stamp.with_timezone(&Utc)),
            _ => None,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&PubSubEvent) + Send + Sync>;

/// Registration handle returned by [`EventDispatcher::on`] and
/// [`EventDispatcher::on_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    kind: EventKind,
    handler: EventHandler,
}

/// Fans PubSub notifications out to a global channel and per-node channels.
///
/// One dispatcher is shared by everything attached to a connection. Handlers
/// run synchronously in emission order; every event is also sent on a
/// broadcast tap for async consumers.
pub struct EventDispatcher {
    next_id: AtomicU64,
    global: RwLock<Vec<Registration>>,
    nodes: RwLock<HashMap<String, Vec<Registration>>>,
    tap: broadcast::Sender<PubSubEvent>,
}

impl EventDispatcher {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            next_id: AtomicU64::new(1),
            global: RwLock::new(Vec::new()),
            nodes: RwLock::new(HashMap::new()),
            tap,
        }
    }

    /// Register a handler on the global channel for `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&PubSubEvent) + Send + Sync + 'static,
    {
        let registration = self.registration(kind, Arc::new(handler));
        let id = registration.id;
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registration);
        id
    }

    /// Register a handler on the channel of `node` for `kind`.
    pub fn on_node<F>(&self, node: &str, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&PubSubEvent) + Send + Sync + 'static,
    {
        let registration = self.registration(kind, Arc::new(handler));
        let id = registration.id;
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node.to_string())
            .or_default()
            .push(registration);
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        {
            let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(pos) = global.iter().position(|r| r.id == id) {
                global.remove(pos);
                return true;
            }
        }

        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        nodes.retain(|_, registrations| {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                registrations.remove(pos);
                removed = true;
            }
            !registrations.is_empty()
        });
        removed
    }

    /// Emit an event on the global channel, then on its node's channel.
    pub fn emit(&self, event: &PubSubEvent) {
        let kind = event.kind();
        let global: Vec<EventHandler> = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.handler.clone())
            .collect();
        let scoped: Vec<EventHandler> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.node())
            .map(|registrations| {
                registrations
                    .iter()
                    .filter(|r| r.kind == kind)
                    .map(|r| r.handler.clone())
                    .collect()
            })
            .unwrap_or_default();

        trace!(
            kind = %kind,
            node = event.node(),
            global = global.len(),
            scoped = scoped.len(),
            "dispatching pubsub event"
        );

        for handler in global.iter().chain(scoped.iter()) {
            handler(event);
        }

        let _ = self.tap.send(event.clone());
    }

    /// Receive every emitted event asynchronously.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.tap.subscribe(),
        }
    }

    pub fn handler_count(&self) -> usize {
        let global = self.global.read().unwrap_or_else(PoisonError::into_inner).len();
        let scoped: usize = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();
        global + scoped
    }

    fn registration(&self, kind: EventKind, handler: EventHandler) -> Registration {
        Registration {
            id: HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            kind,
            handler,
        }
    }
}

/// An async view of every event a dispatcher emits.
pub struct EventSubscription {
    receiver: broadcast::Receiver<PubSubEvent>,
}

impl EventSubscription {
    /// The next event. A subscriber that fell behind gets
    /// [`EventBusError::Lagged`] once and then resumes with the oldest
    /// retained event.
    pub async fn recv(&mut self) -> Result<PubSubEvent, EventBusError> {
        self.receiver.recv().await.map_err(|error| match error {
            broadcast::error::RecvError::Closed => EventBusError::ChannelClosed,
            broadcast::error::RecvError::Lagged(count) => EventBusError::Lagged(count),
        })
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
