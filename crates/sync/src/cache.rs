//! An ordered local mirror of one node's items.
//!
//! A [`NodeCache`] is bound to one node at a time. While bound it listens for
//! that node's publish and retract notifications on the client's
//! [`EventDispatcher`], keeps its records ordered front-to-back by most
//! recent publish, and reports every mutation as a [`CacheEvent`].
//!
//! Record state sits behind a `std::sync::Mutex` that is never held across an
//! await. Notifications are applied strictly in delivery order through one
//! queue. While nothing is pending they are applied synchronously inside the
//! dispatcher callback. A notification without a payload hands the queue to a
//! task that fetches the item, applies it, and then works through whatever
//! arrived in the meantime.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use minidom::Element;
use roost_core::config::{Config, PayloadFormat};
use roost_core::event::{EventDispatcher, EventKind, HandlerId, PubSubEvent};
use roost_xmpp::{ItemQuery, PubSubClient};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::attributes::Attributes;
use crate::error::CacheError;
use crate::record::Record;
use crate::storage::NodeStorage;

/// A mutation of the cache's ordered record set.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// `record` was inserted at `index`.
    Added { record: Record, index: usize },
    /// `record` was updated in place and moved to the front. `changes` holds
    /// the attributes whose values changed; it may be empty.
    Changed { record: Record, changes: Attributes },
    /// `record` was removed from `index`.
    Removed { record: Record, index: usize },
}

impl CacheEvent {
    pub fn record(&self) -> &Record {
        match self {
            CacheEvent::Added { record, .. }
            | CacheEvent::Changed { record, .. }
            | CacheEvent::Removed { record, .. } => record,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Insert created records at the front without waiting for the echo.
    pub insert_on_create: bool,
    /// `notify` flag for retracts; `None` keeps the client default.
    pub retract_notify: Option<bool>,
    pub channel_capacity: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            insert_on_create: false,
            retract_notify: None,
            channel_capacity: EventDispatcher::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl CacheOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            insert_on_create: config.pubsub.insert_on_create,
            retract_notify: Some(config.pubsub.retract_notify),
            channel_capacity: config.event_bus.channel_capacity,
        }
    }
}

struct Binding {
    storage: NodeStorage,
    events: Arc<EventDispatcher>,
    handlers: [HandlerId; 2],
}

impl Binding {
    fn release(&self) {
        for id in self.handlers {
            self.events.off(id);
        }
    }
}

/// A push notification waiting to be applied.
enum Notification {
    Inline {
        node: String,
        id: String,
        entry: Element,
    },
    Fetch {
        node: String,
        id: String,
    },
    Deleted {
        node: String,
        id: String,
    },
}

#[derive(Default)]
struct NotificationQueue {
    pending: VecDeque<Notification>,
    /// Set while some caller or task is applying the queue.
    draining: bool,
}

struct CacheInner {
    records: Mutex<Vec<Record>>,
    binding: Mutex<Option<Binding>>,
    queue: Mutex<NotificationQueue>,
    signals: broadcast::Sender<CacheEvent>,
    options: CacheOptions,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let binding = self
            .binding
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(binding) = binding {
            binding.release();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered, change-notifying cache of a node's items.
///
/// Clones share the same records and binding.
#[derive(Clone)]
pub struct NodeCache {
    inner: Arc<CacheInner>,
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl NodeCache {
    pub fn new(options: CacheOptions) -> Self {
        let (signals, _) = broadcast::channel(options.channel_capacity.max(1));
        Self {
            inner: Arc::new(CacheInner {
                records: Mutex::new(Vec::new()),
                binding: Mutex::new(None),
                queue: Mutex::new(NotificationQueue::default()),
                signals,
                options,
            }),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Bind to `node`, replacing any previous binding.
    ///
    /// The previous node's handlers are removed before the new ones are
    /// registered. Records already in the cache are kept.
    pub fn attach_to_node(&self, node: &str, client: &PubSubClient, format: PayloadFormat) {
        if let Some(previous) = lock(&self.inner.binding).take() {
            debug!(node = previous.storage.node(), "releasing previous node binding");
            previous.release();
        }

        let storage = NodeStorage::new(node, client.clone(), format)
            .with_retract_notify(self.inner.options.retract_notify);
        let events = client.events().clone();

        let weak = Arc::downgrade(&self.inner);
        let published = events.on_node(node, EventKind::ItemPublished, {
            let weak = weak.clone();
            move |event| {
                if let Some(cache) = NodeCache::upgrade(&weak) {
                    cache.handle_published(event);
                }
            }
        });
        let deleted = events.on_node(node, EventKind::ItemDeleted, move |event| {
            if let Some(cache) = NodeCache::upgrade(&weak) {
                cache.handle_deleted(event);
            }
        });

        info!(node, service = client.service(), ?format, "cache bound to node");

        *lock(&self.inner.binding) = Some(Binding {
            storage,
            events,
            handlers: [published, deleted],
        });
    }

    /// Drop the current binding, if any. Records are kept.
    pub fn detach(&self) {
        if let Some(binding) = lock(&self.inner.binding).take() {
            info!(node = binding.storage.node(), "cache detached from node");
            binding.release();
        }
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.inner.binding).is_some()
    }

    pub fn node_id(&self) -> Option<String> {
        lock(&self.inner.binding)
            .as_ref()
            .map(|binding| binding.storage.node().to_string())
    }

    /// Publish `record` as a new item and set the assigned id on it.
    pub async fn create(&self, record: &mut Record) -> Result<String, CacheError> {
        let storage = self.storage()?;
        let id = storage.create(record).await?;

        if self.inner.options.insert_on_create {
            self.apply_published(&id, record.attributes.clone());
        }
        Ok(id)
    }

    pub async fn update(&self, record: &Record) -> Result<Record, CacheError> {
        self.storage()?.update(record).await?;
        Ok(record.clone())
    }

    /// The attributes of the stored item that differ from `record`'s.
    pub async fn fetch(&self, record: &Record) -> Result<Attributes, CacheError> {
        self.storage()?.get_item(record).await
    }

    /// Fetch items in server order without touching the cache.
    pub async fn fetch_all(&self, query: &ItemQuery) -> Result<Vec<Record>, CacheError> {
        self.storage()?.get_items(query).await
    }

    /// Retract `record`'s item. The local copy goes away with the retract
    /// notification.
    pub async fn delete(&self, record: &Record) -> Result<Record, CacheError> {
        self.storage()?.destroy(record).await?;
        Ok(record.clone())
    }

    /// Replace the record set with the node's items, in server order.
    ///
    /// Records the server no longer has are removed, new ones added and
    /// existing ones changed, each with exactly one signal.
    pub async fn refresh(&self, query: &ItemQuery) -> Result<Vec<Record>, CacheError> {
        let fetched = self.storage()?.get_items(query).await?;
        let wanted: HashSet<String> = fetched.iter().filter_map(|r| r.id.clone()).collect();

        let mut records = lock(&self.inner.records);

        let mut index = 0;
        while index < records.len() {
            let keep = records[index]
                .id()
                .is_some_and(|id| wanted.contains(id));
            if keep {
                index += 1;
            } else {
                let record = records.remove(index);
                self.signal(CacheEvent::Removed { record, index });
            }
        }

        let mut previous = std::mem::take(&mut *records);
        for incoming in fetched {
            if records.iter().any(|r| r.id == incoming.id) {
                continue;
            }
            match previous.iter().position(|r| r.id == incoming.id) {
                Some(pos) => {
                    let mut record = previous.remove(pos);
                    let changes = record.attributes.merge(incoming.attributes);
                    records.push(record.clone());
                    self.signal(CacheEvent::Changed { record, changes });
                }
                None => {
                    let index = records.len();
                    records.push(incoming.clone());
                    self.signal(CacheEvent::Added {
                        record: incoming,
                        index,
                    });
                }
            }
        }

        debug!(count = records.len(), "cache refreshed");
        Ok(records.clone())
    }

    /// Apply a publish notification for item `id`.
    ///
    /// Without an inline `entry` the item is fetched first.
    pub async fn on_item_published(
        &self,
        id: &str,
        entry: Option<&Element>,
    ) -> Result<CacheEvent, CacheError> {
        let storage = self.storage()?;
        let attributes = match entry {
            Some(entry) => storage.decode_payload(entry)?,
            None => storage.fetch_record(id).await?.attributes,
        };
        Ok(self.apply_published(id, attributes))
    }

    /// Apply a retract notification. Returns the removed record, or `None`
    /// if `id` was not cached.
    pub fn on_item_deleted(&self, id: &str) -> Option<Record> {
        let mut records = lock(&self.inner.records);
        let index = records.iter().position(|r| r.id() == Some(id))?;
        let record = records.remove(index);
        self.signal(CacheEvent::Removed {
            record: record.clone(),
            index,
        });
        Some(record)
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        lock(&self.inner.records)
            .iter()
            .find(|r| r.id() == Some(id))
            .cloned()
    }

    /// A snapshot of the records, front first.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.inner.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.records).is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        lock(&self.inner.records)
            .iter()
            .position(|r| r.id() == Some(id))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.signals.subscribe()
    }

    fn upgrade(weak: &Weak<CacheInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn storage(&self) -> Result<NodeStorage, CacheError> {
        lock(&self.inner.binding)
            .as_ref()
            .map(|binding| binding.storage.clone())
            .ok_or(CacheError::NoNodeBound)
    }

    fn signal(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.inner.signals.send(event);
    }

    fn apply_published(&self, id: &str, attributes: Attributes) -> CacheEvent {
        let mut records = lock(&self.inner.records);
        let event = match records.iter().position(|r| r.id() == Some(id)) {
            Some(pos) => {
                let mut record = records.remove(pos);
                let changes = record.attributes.merge(attributes);
                records.insert(0, record.clone());
                CacheEvent::Changed { record, changes }
            }
            None => {
                let record = Record::with_id(id, attributes);
                records.insert(0, record.clone());
                CacheEvent::Added { record, index: 0 }
            }
        };
        self.signal(event.clone());
        event
    }

    fn handle_published(&self, event: &PubSubEvent) {
        let PubSubEvent::ItemPublished { node, id, entry } = event else {
            return;
        };
        debug!(node, item = %id, inline = entry.is_some(), "item published");
        let (node, id) = (node.clone(), id.clone());
        self.enqueue(match entry {
            Some(entry) => Notification::Inline {
                node,
                id,
                entry: entry.clone(),
            },
            None => Notification::Fetch { node, id },
        });
    }

    fn handle_deleted(&self, event: &PubSubEvent) {
        let PubSubEvent::ItemDeleted { node, id } = event else {
            return;
        };
        self.enqueue(Notification::Deleted {
            node: node.clone(),
            id: id.clone(),
        });
    }

    /// Queue a notification behind any still being applied.
    fn enqueue(&self, notification: Notification) {
        {
            let mut queue = lock(&self.inner.queue);
            queue.pending.push_back(notification);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        self.drain_inline();
    }

    fn next_queued(&self) -> Option<Notification> {
        let mut queue = lock(&self.inner.queue);
        let next = queue.pending.pop_front();
        if next.is_none() {
            queue.draining = false;
        }
        next
    }

    /// Apply queued notifications in order until one needs a fetch, then
    /// hand the rest of the queue to a task.
    fn drain_inline(&self) {
        while let Some(next) = self.next_queued() {
            let Some(Notification::Fetch { node, id }) = self.apply_now(next) else {
                continue;
            };
            match Handle::try_current() {
                Ok(runtime) => {
                    lock(&self.inner.queue)
                        .pending
                        .push_front(Notification::Fetch { node, id });
                    let cache = self.clone();
                    runtime.spawn(async move { cache.drain().await });
                    return;
                }
                Err(_) => {
                    warn!(node, item = %id, "no runtime to fetch item payload, dropping notification");
                }
            }
        }
    }

    /// Apply every queued notification, awaiting payload fetches in turn.
    async fn drain(&self) {
        while let Some(next) = self.next_queued() {
            if let Some(Notification::Fetch { node, id }) = self.apply_now(next) {
                if let Err(error) = self.on_item_published(&id, None).await {
                    warn!(node, item = %id, %error, "dropping item notification");
                }
            }
        }
    }

    /// Apply `notification` if it needs no network round trip; otherwise
    /// hand it back.
    fn apply_now(&self, notification: Notification) -> Option<Notification> {
        match notification {
            Notification::Inline { node, id, entry } => {
                if let Err(error) = self
                    .storage()
                    .and_then(|storage| storage.decode_payload(&entry))
                    .map(|attributes| self.apply_published(&id, attributes))
                {
                    warn!(node, item = %id, %error, "dropping item notification");
                }
                None
            }
            Notification::Deleted { node, id } => {
                if self.on_item_deleted(&id).is_none() {
                    debug!(node, item = %id, "retract for uncached item");
                }
                None
            }
            fetch @ Notification::Fetch { .. } => Some(fetch),
        }
    }
}

impl fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCache")
            .field("node", &self.node_id())
            .field("len", &self.len())
            .field("options", &self.inner.options)
            .finish()
    }
}
