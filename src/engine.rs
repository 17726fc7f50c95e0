use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::EvalError;
use crate::graph::{Graph, State, Status};
use crate::key::{Key, Value};
use crate::options::Options;
use crate::registry::Registry;
use crate::scheduler::{self, Run, Statistics};

/// An incremental evaluation engine.
///
/// The engine owns the graph of all entries ever requested. Evaluations bring
/// requested root keys up to date, reusing every value whose inputs did not
/// change since it was computed. Invalidation requires exclusive access, so
/// it can never interleave with an evaluation in progress.
pub struct Engine<K: Key, V: Value> {
    graph: Graph<K, V>,
    registry: Registry<K, V>,
    version: u64,
    /// The worker pool of the last evaluation. Holding the lock serializes
    /// evaluations sharing the engine.
    workers: Mutex<Option<rayon::ThreadPool>>,
}

impl<K: Key, V: Value> Engine<K, V> {
    /// Create an engine with an empty graph.
    pub fn new(registry: Registry<K, V>) -> Self {
        Self {
            graph: Graph::new(),
            registry,
            version: 0,
            workers: Mutex::new(None),
        }
    }

    /// The registered computations.
    pub fn registry(&self) -> &Registry<K, V> {
        &self.registry
    }

    /// Bring the given root keys up to date.
    ///
    /// Concurrent calls on the same engine are serialized.
    #[tracing::instrument(skip_all, fields(roots = roots.len(), version = self.version))]
    pub fn evaluate(&self, roots: &[K], options: &Options) -> EvaluationResult<K, V> {
        let mut workers = self.workers.lock();
        let threads = options.thread_count();
        if workers.as_ref().is_none_or(|pool| pool.current_num_threads() != threads) {
            *workers = match scheduler::pool(threads) {
                Ok(pool) => Some(pool),
                Err(err) => {
                    tracing::warn!(%err, "falling back to the global thread pool");
                    None
                }
            };
        }

        let ids: Vec<_> = roots.iter().map(|key| self.graph.get_or_insert(key).0).collect();
        let run = Run::new(&self.graph, &self.registry, options, self.version);
        run.execute(workers.as_ref(), &ids);

        let mut seen = FxHashSet::default();
        let mut results = Vec::with_capacity(roots.len());
        for (key, id) in roots.iter().zip(ids) {
            if !seen.insert(id) {
                continue;
            }

            let node = self.graph.node(id);
            let entry = node.entry.read();
            let result = match (&entry.status, &entry.value, &entry.error) {
                (Status::Done, Some(stored), _) => Ok(stored.value.clone()),
                (Status::Error, _, Some(err)) => Err(err.clone()),
                _ => Err(EvalError::Cancelled { key: key.clone() }),
            };
            results.push((key.clone(), result));
        }

        let mut errors = run.take_errors();
        for (_, result) in &results {
            if let Err(err) = result {
                if !errors.contains(err) {
                    errors.push(err.clone());
                }
            }
        }

        let statistics = run.statistics();
        tracing::debug!(?statistics, errors = errors.len(), "evaluation finished");
        EvaluationResult { results, errors, statistics }
    }

    /// Mark the given keys as changed.
    ///
    /// Their entries and all entries that transitively depend on them are
    /// recomputed or verified on their next evaluation. Keys that were never
    /// evaluated are ignored. Returns the number of entries that became dirty.
    #[tracing::instrument(skip_all, fields(changed = changed.len()))]
    pub fn invalidate(&mut self, changed: &[K]) -> usize {
        let dirtied = self.graph.invalidate(changed);
        if dirtied > 0 {
            self.version += 1;
        }
        dirtied
    }

    /// Remove all entries that are not reachable from `roots` through
    /// dependency edges. Returns the number of removed entries.
    pub fn evict_unreachable(&mut self, roots: &[K]) -> usize {
        let evicted = self.graph.retain_reachable(roots);
        tracing::debug!(evicted, "evicted unreachable entries");
        evicted
    }

    /// The state of a key's entry, if it has one.
    pub fn state(&self, key: &K) -> Option<State> {
        let (_, node) = self.graph.find(key)?;
        let status = node.entry.read().status;
        Some(status.state())
    }

    /// The value of a key, if its entry is done.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let (_, node) = self.graph.find(key)?;
        let entry = node.entry.read();
        match entry.status {
            Status::Done => entry.value.as_ref().map(|stored| stored.value.clone()),
            _ => None,
        }
    }

    /// The error of a key, if its entry failed.
    pub fn error(&self, key: &K) -> Option<EvalError<K>> {
        let (_, node) = self.graph.find(key)?;
        let entry = node.entry.read();
        match entry.status {
            Status::Error => entry.error.clone(),
            _ => None,
        }
    }

    /// The direct dependencies of a key, in the order its computation first
    /// requested them.
    pub fn deps(&self, key: &K) -> Option<Vec<K>> {
        let (_, node) = self.graph.find(key)?;
        let deps = node.entry.read().deps.clone();
        Some(deps.into_iter().map(|id| self.graph.node(id).key.clone()).collect())
    }

    /// The keys that directly depend on a key, in no particular order.
    pub fn reverse_deps(&self, key: &K) -> Option<Vec<K>> {
        let (_, node) = self.graph.find(key)?;
        let rdeps: Vec<_> = node.entry.read().rdeps.iter().copied().collect();
        Some(rdeps.into_iter().map(|id| self.graph.node(id).key.clone()).collect())
    }

    /// The number of entries in the graph.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Whether the graph has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current version, bumped by every invalidation that dirtied
    /// something.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl<K: Key, V: Value> Debug for Engine<K, V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Engine")
            .field("entries", &self.len())
            .field("version", &self.version)
            .field("registry", &self.registry)
            .finish()
    }
}

/// The outcome of an evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationResult<K: Key, V: Value> {
    results: Vec<(K, Result<Arc<V>, EvalError<K>>)>,
    errors: Vec<EvalError<K>>,
    statistics: Statistics,
}

impl<K: Key, V: Value> EvaluationResult<K, V> {
    /// Whether every root was computed successfully.
    pub fn success(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    /// The result for a root key.
    pub fn get(&self, key: &K) -> Option<&Result<Arc<V>, EvalError<K>>> {
        self.results.iter().find(|(k, _)| k == key).map(|(_, result)| result)
    }

    /// The value of a root key, if it was computed successfully.
    pub fn value(&self, key: &K) -> Option<&Arc<V>> {
        self.get(key)?.as_ref().ok()
    }

    /// The error of a root key, if it failed.
    pub fn error(&self, key: &K) -> Option<&EvalError<K>> {
        self.get(key)?.as_ref().err()
    }

    /// The results of all distinct roots, in request order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Result<Arc<V>, EvalError<K>>)> {
        self.results.iter().map(|(key, result)| (key, result))
    }

    /// Every distinct error encountered, starting with those raised during
    /// this evaluation.
    pub fn errors(&self) -> &[EvalError<K>] {
        &self.errors
    }

    /// What the evaluation did.
    pub fn statistics(&self) -> Statistics {
        self.statistics
    }
}
