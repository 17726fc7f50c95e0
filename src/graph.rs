use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use parking_lot::{RwLock, RwLockWriteGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use slab::Slab;

use crate::error::EvalError;
use crate::key::{Key, Value};

/// Identifies an entry in the graph.
pub(crate) type NodeId = usize;

/// The externally observable state of an entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    /// Requested, but never computed in the current epoch.
    NotStarted,
    /// A worker is currently running the entry's computation.
    Evaluating,
    /// The entry is suspended until some of its dependencies are done.
    Waiting,
    /// The entry holds an up-to-date value.
    Done,
    /// The entry failed in the current epoch.
    Error,
    /// The entry's value is stale and must be recomputed or verified.
    Dirty,
    /// The evaluation was stopped before the entry finished.
    Cancelled,
}

/// The internal state of an entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    NotStarted,
    /// `changed` entries were invalidated directly and must rerun. Others
    /// were only reached through reverse dependencies and may be verified.
    Dirty { changed: bool },
    Evaluating,
    Waiting,
    Done,
    Error,
    Cancelled,
}

impl Status {
    /// Whether a demand for the entry must schedule work.
    pub fn needs_work(self) -> bool {
        matches!(self, Self::NotStarted | Self::Dirty { .. } | Self::Cancelled)
    }

    /// Whether the entry reached a terminal state for this epoch.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// The public view of the status.
    pub fn state(self) -> State {
        match self {
            Self::NotStarted => State::NotStarted,
            Self::Dirty { .. } => State::Dirty,
            Self::Evaluating => State::Evaluating,
            Self::Waiting => State::Waiting,
            Self::Done => State::Done,
            Self::Error => State::Error,
            Self::Cancelled => State::Cancelled,
        }
    }
}

/// A stored value and its fingerprint.
#[derive(Debug)]
pub(crate) struct Stored<V> {
    pub value: Arc<V>,
    pub fingerprint: u128,
}

/// Bookkeeping that only lives for the duration of one evaluation.
#[derive(Debug, Default)]
pub(crate) struct Transient {
    /// Whether a task for the entry was spawned and has not started yet.
    pub scheduled: bool,
    /// Entries to wake up once this one is finished.
    pub waiters: Vec<NodeId>,
    /// The unfinished dependencies this entry is suspended on.
    pub waiting_on: Vec<NodeId>,
    /// The dependencies recorded by the latest, not yet committed invocation.
    pub provisional: Vec<NodeId>,
    /// The index of the next previous dependency to check while verifying a
    /// dirty entry.
    pub verify: Option<usize>,
    /// How often the computation was invoked in this evaluation.
    pub attempts: usize,
}

/// The graph's record for one key.
#[derive(Debug)]
pub(crate) struct Entry<K: Key, V: Value> {
    pub status: Status,
    /// Present for done entries and retained while dirty.
    pub value: Option<Stored<V>>,
    pub error: Option<EvalError<K>>,
    /// The dependencies read by the last committed invocation, in order.
    pub deps: Vec<NodeId>,
    pub rdeps: FxHashSet<NodeId>,
    /// The version at which the value last changed.
    pub changed_at: u64,
    /// The version at which the value was last confirmed up to date.
    pub verified_at: u64,
    pub transient: Transient,
}

impl<K: Key, V: Value> Entry<K, V> {
    fn new() -> Self {
        Self {
            status: Status::NotStarted,
            value: None,
            error: None,
            deps: Vec::new(),
            rdeps: FxHashSet::default(),
            changed_at: 0,
            verified_at: 0,
            transient: Transient::default(),
        }
    }
}

/// A key together with its entry.
#[derive(Debug)]
pub(crate) struct Node<K: Key, V: Value> {
    pub key: K,
    /// Outstanding dependencies of a waiting entry, plus one while the
    /// waiter registration is still in progress.
    pub pending: AtomicUsize,
    pub entry: RwLock<Entry<K, V>>,
}

/// The persistent store of entries.
///
/// Nodes are shared behind `Arc`s so that a worker can hold on to a node
/// without keeping the store locked. Each entry is guarded by its own lock;
/// no code path holds two entry locks at the same time.
pub(crate) struct Graph<K: Key, V: Value> {
    store: RwLock<Store<K, V>>,
}

struct Store<K: Key, V: Value> {
    index: FxHashMap<K, NodeId>,
    nodes: Slab<Arc<Node<K, V>>>,
}

impl<K: Key, V: Value> Graph<K, V> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store { index: FxHashMap::default(), nodes: Slab::new() }),
        }
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.store.read().nodes.len()
    }

    /// Look up the entry for a key.
    pub fn find(&self, key: &K) -> Option<(NodeId, Arc<Node<K, V>>)> {
        let store = self.store.read();
        let id = *store.index.get(key)?;
        Some((id, store.nodes[id].clone()))
    }

    /// Look up the entry for a key, creating it if necessary.
    pub fn get_or_insert(&self, key: &K) -> (NodeId, Arc<Node<K, V>>) {
        if let Some(found) = self.find(key) {
            return found;
        }

        let mut store = self.store.write();
        // Another thread may have inserted the key in the meantime.
        if let Some(&id) = store.index.get(key) {
            return (id, store.nodes[id].clone());
        }

        let node = Arc::new(Node {
            key: key.clone(),
            pending: AtomicUsize::new(0),
            entry: RwLock::new(Entry::new()),
        });
        let id = store.nodes.insert(node.clone());
        store.index.insert(key.clone(), id);
        (id, node)
    }

    /// The node with the given id.
    ///
    /// Ids handed out by the graph stay valid until the next call to
    /// [`Graph::retain_reachable`], which requires exclusive access.
    pub fn node(&self, id: NodeId) -> Arc<Node<K, V>> {
        self.store.read().nodes[id].clone()
    }

    /// Look up a node's id while having exclusive access.
    pub fn id_mut(&mut self, key: &K) -> Option<NodeId> {
        self.store.get_mut().index.get(key).copied()
    }

    /// Access an entry while having exclusive access to the graph.
    pub fn entry_mut(&mut self, id: NodeId) -> RwLockWriteGuard<'_, Entry<K, V>> {
        self.store.get_mut().nodes[id].entry.write()
    }

    /// Remove every entry that is not reachable from `roots` through
    /// dependency edges. Returns the number of removed entries.
    pub fn retain_reachable(&mut self, roots: &[K]) -> usize {
        let store = self.store.get_mut();

        let mut reachable = FxHashSet::default();
        let mut queue: VecDeque<NodeId> =
            roots.iter().filter_map(|key| store.index.get(key).copied()).collect();
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            queue.extend(store.nodes[id].entry.read().deps.iter().copied());
        }

        let before = store.nodes.len();
        store.nodes.retain(|id, _| reachable.contains(&id));
        store.index.retain(|_, id| reachable.contains(id));
        for (_, node) in store.nodes.iter_mut() {
            node.entry.write().rdeps.retain(|id| reachable.contains(id));
        }

        before - store.nodes.len()
    }
}

impl<K: Key, V: Value> Default for Graph<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
