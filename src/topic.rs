//! Typed topics and the routing tables behind them.
//!
//! A [`Topic<E>`] pairs a compile-time event type with a runtime id minted
//! from a process-wide counter. Topics are identity-by-id: two calls to
//! [`Topic::new`] mint distinct topics even for the same name, and the name
//! is advisory, kept only in a diagnostics map.
//!
//! Routing is type-indexed. Each event type `E` gets one process-wide
//! routing table mapping topic id to the enqueue functions of its
//! subscribers. A cross-type directory records which tables each subscriber
//! has touched, so tearing a subscriber down visits exactly those tables and
//! nothing else.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

/// Runtime identity of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId(u64);

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic#{}", self.0)
    }
}

/// Unique identifier for a subscriber, allocated monotonically across all
/// topics and event types.
pub type SubscriberId = u64;

static NEXT_TOPIC_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);
static TOPIC_NAMES: LazyLock<Mutex<HashMap<TopicId, String>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub(crate) fn next_subscriber_id() -> SubscriberId {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A typed handle routing events of type `E`.
///
/// Copyable; all copies denote the same topic.
pub struct Topic<E> {
    id: TopicId,
    _event: PhantomData<fn(E)>,
}

impl<E> Clone for Topic<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Topic<E> {}

impl<E> fmt::Debug for Topic<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic").field("id", &self.id).finish()
    }
}

impl<E> Topic<E> {
    /// Mint a new topic. `name` is advisory and kept only for diagnostics;
    /// distinct calls mint distinct topics even for equal names.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let id = TopicId(NEXT_TOPIC_ID.fetch_add(1, Ordering::Relaxed));
        TOPIC_NAMES.lock().insert(id, name.into());
        Self {
            id,
            _event: PhantomData,
        }
    }

    /// The topic's runtime identity.
    #[must_use]
    pub fn id(&self) -> TopicId {
        self.id
    }

    /// The advisory name the topic was minted with.
    #[must_use]
    pub fn name(&self) -> String {
        TOPIC_NAMES
            .lock()
            .get(&self.id)
            .cloned()
            .unwrap_or_default()
    }
}

pub(crate) type EnqueueFn<E> = Box<dyn Fn(Arc<E>) + Send + Sync>;

struct TableState<E> {
    topics_per_subscriber: HashMap<SubscriberId, HashSet<TopicId>>,
    routes: HashMap<TopicId, HashMap<SubscriberId, EnqueueFn<E>>>,
}

/// Process-wide routing table for one event type.
pub(crate) struct TopicTable<E> {
    state: Mutex<TableState<E>>,
}

impl<E: Send + Sync + 'static> TopicTable<E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                topics_per_subscriber: HashMap::new(),
                routes: HashMap::new(),
            }),
        }
    }

    pub(crate) fn add_route(&self, subscriber: SubscriberId, topic: TopicId, enqueue: EnqueueFn<E>) {
        let mut state = self.state.lock();
        state
            .topics_per_subscriber
            .entry(subscriber)
            .or_default()
            .insert(topic);
        state.routes.entry(topic).or_default().insert(subscriber, enqueue);
    }

    /// Enqueue `event` to every subscriber routed on `topic`. The lock is
    /// held across the whole fan-out, which serializes concurrent emits to
    /// one topic and keeps per-subscriber delivery in emission order;
    /// enqueue itself is O(1) and non-blocking.
    pub(crate) fn publish(&self, topic: TopicId, event: &Arc<E>) {
        let state = self.state.lock();
        if let Some(routes) = state.routes.get(&topic) {
            for enqueue in routes.values() {
                enqueue(Arc::clone(event));
            }
        }
    }

    #[cfg(test)]
    fn route_count(&self, topic: TopicId) -> usize {
        self.state
            .lock()
            .routes
            .get(&topic)
            .map_or(0, |routes| routes.len())
    }

    #[cfg(test)]
    fn is_vacant(&self) -> bool {
        let state = self.state.lock();
        state.routes.is_empty() && state.topics_per_subscriber.is_empty()
    }
}

/// Cleanup interface every per-type table exposes to the directory.
pub(crate) trait ErasedTable: Send + Sync {
    fn cleanup_subscriber(&self, subscriber: SubscriberId);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Send + Sync + 'static> ErasedTable for TopicTable<E> {
    fn cleanup_subscriber(&self, subscriber: SubscriberId) {
        let mut state = self.state.lock();
        let Some(topics) = state.topics_per_subscriber.remove(&subscriber) else {
            return;
        };
        for topic in topics {
            let vacated = match state.routes.get_mut(&topic) {
                Some(routes) => {
                    routes.remove(&subscriber);
                    routes.is_empty()
                }
                None => false,
            };
            if vacated {
                state.routes.remove(&topic);
            }
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct DirectoryState {
    tables: HashMap<TypeId, Arc<dyn ErasedTable>>,
    tables_per_subscriber: HashMap<SubscriberId, HashSet<TypeId>>,
}

/// Cross-type directory: per-type tables plus, per subscriber, the set of
/// tables that hold its entries.
pub(crate) struct SubscriberDirectory {
    state: Mutex<DirectoryState>,
}

static DIRECTORY: LazyLock<SubscriberDirectory> = LazyLock::new(|| SubscriberDirectory {
    state: Mutex::new(DirectoryState {
        tables: HashMap::new(),
        tables_per_subscriber: HashMap::new(),
    }),
});

pub(crate) fn directory() -> &'static SubscriberDirectory {
    &DIRECTORY
}

impl SubscriberDirectory {
    /// The routing table for `E`, created on first use.
    pub(crate) fn table<E: Send + Sync + 'static>(&self) -> Arc<TopicTable<E>> {
        let erased = {
            let mut state = self.state.lock();
            Arc::clone(
                state
                    .tables
                    .entry(TypeId::of::<E>())
                    .or_insert_with(|| Arc::new(TopicTable::<E>::new()) as Arc<dyn ErasedTable>),
            )
        };
        erased
            .as_any()
            .downcast()
            .expect("routing table registered under a foreign type")
    }

    /// The routing table for `E`, if any subscriber ever created it.
    pub(crate) fn table_if_exists<E: Send + Sync + 'static>(&self) -> Option<Arc<TopicTable<E>>> {
        let erased = {
            let state = self.state.lock();
            state.tables.get(&TypeId::of::<E>()).cloned()
        }?;
        erased.as_any().downcast().ok()
    }

    /// Record that `subscriber` has entries in the table for `E`.
    pub(crate) fn link<E: Send + Sync + 'static>(&self, subscriber: SubscriberId) {
        self.state
            .lock()
            .tables_per_subscriber
            .entry(subscriber)
            .or_default()
            .insert(TypeId::of::<E>());
    }

    /// Remove `subscriber` from every table it ever touched. The per-type
    /// cleanups run outside the directory lock.
    pub(crate) fn cleanup(&self, subscriber: SubscriberId) {
        let touched: Vec<Arc<dyn ErasedTable>> = {
            let mut state = self.state.lock();
            match state.tables_per_subscriber.remove(&subscriber) {
                Some(type_ids) => type_ids
                    .iter()
                    .filter_map(|type_id| state.tables.get(type_id).cloned())
                    .collect(),
                None => Vec::new(),
            }
        };
        for table in touched {
            table.cleanup_subscriber(subscriber);
        }
    }
}

/// Emit an event to `topic`, allocating the shared payload once and
/// forwarding it to every routed subscriber. Emitting to a topic with no
/// subscribers is a no-op.
pub fn emit<E: Send + Sync + 'static>(topic: Topic<E>, event: E) {
    emit_shared(topic, Arc::new(event));
}

/// Emit an already-shared payload to `topic`. See [`emit`].
pub fn emit_shared<E: Send + Sync + 'static>(topic: Topic<E>, event: Arc<E>) {
    if let Some(table) = directory().table_if_exists::<E>() {
        table.publish(topic.id(), &event);
    }
}
