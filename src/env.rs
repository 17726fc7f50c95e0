use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::EvalError;
use crate::graph::{NodeId, Status};
use crate::key::{Key, Value};
use crate::scheduler::Run;

/// The handle a computation uses to request the values of other keys.
///
/// A fresh environment is created for every invocation of a computation.
/// Every request records the requested key as a dependency of the key being
/// computed, regardless of whether its value is available. The dependencies
/// recorded by the final invocation become the entry's dependency edges.
///
/// An invocation that was told about a cancellation or requested its own key
/// can never succeed: it is discarded or failed whatever the computation
/// returns.
pub struct Environment<'a, K: Key, V: Value> {
    run: &'a Run<'a, K, V>,
    key: &'a K,
    deps: Vec<NodeId>,
    seen: FxHashSet<NodeId>,
    missing: Vec<NodeId>,
    error: Option<EvalError<K>>,
    cycle: Option<EvalError<K>>,
    cancelled: bool,
}

impl<'a, K: Key, V: Value> Environment<'a, K, V> {
    pub(crate) fn new(run: &'a Run<'a, K, V>, key: &'a K) -> Self {
        Self {
            run,
            key,
            deps: Vec::new(),
            seen: FxHashSet::default(),
            missing: Vec::new(),
            error: None,
            cycle: None,
            cancelled: false,
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &K {
        self.key
    }

    /// Request the value of `key`.
    ///
    /// Returns `Ok(None)` if the value is not available yet. In that case the
    /// invocation is not final: the computation should return `Ok(None)` and
    /// will be invoked again once the value is available. Returns an error if
    /// the dependency failed or the evaluation is being cancelled; the error
    /// is meant to be propagated with `?`.
    pub fn get(&mut self, key: &K) -> Result<Option<Arc<V>>, EvalError<K>> {
        if key == self.key {
            let err = EvalError::Cycle { cycle: vec![key.clone()] };
            self.cycle.get_or_insert_with(|| err.clone());
            return Err(err);
        }

        let (id, node) = self.run.graph().get_or_insert(key);
        let first = self.seen.insert(id);
        if first {
            self.deps.push(id);
        }

        if self.run.is_interrupted() {
            return Err(self.cancel());
        }

        let entry = node.entry.read();
        match entry.status {
            Status::Done => match &entry.value {
                Some(stored) => Ok(Some(stored.value.clone())),
                None => unreachable!("done entry without value"),
            },
            Status::Error => {
                let err = match &entry.error {
                    Some(err) => err.clone(),
                    None => unreachable!("failed entry without error"),
                };
                self.error.get_or_insert_with(|| err.clone());
                Err(err)
            }
            // Nothing new is computed once the evaluation stopped, so the
            // value would never become available.
            _ if self.run.is_stopped() => Err(self.cancel()),
            _ => {
                if first {
                    self.missing.push(id);
                }
                Ok(None)
            }
        }
    }

    /// Mark the invocation as cancelled. It is discarded whatever the
    /// computation returns.
    fn cancel(&mut self) -> EvalError<K> {
        self.cancelled = true;
        EvalError::Cancelled { key: self.key.clone() }
    }

    /// Request the values of several keys at once.
    ///
    /// All keys are recorded as dependencies, even if one of them failed. The
    /// first failure in request order is returned.
    pub fn get_many<'k>(
        &mut self,
        keys: impl IntoIterator<Item = &'k K>,
    ) -> Result<FxHashMap<K, Option<Arc<V>>>, EvalError<K>> {
        let mut values = FxHashMap::default();
        let mut first_error = None;
        for key in keys {
            match self.get(key) {
                Ok(value) => {
                    values.insert(key.clone(), value);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    /// Whether any value requested so far was not available.
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty()
    }

    /// The number of distinct dependencies requested so far.
    pub fn dep_count(&self) -> usize {
        self.deps.len()
    }

    /// Dismantle the environment after the invocation returned.
    pub(crate) fn finish(self) -> Recorded<K> {
        Recorded {
            deps: self.deps,
            missing: self.missing,
            error: self.error,
            cycle: self.cycle,
            cancelled: self.cancelled,
        }
    }
}

/// What an environment observed during one invocation.
pub(crate) struct Recorded<K: Key> {
    /// Every requested dependency, in first-request order.
    pub deps: Vec<NodeId>,
    /// The requested dependencies that were not finished.
    pub missing: Vec<NodeId>,
    /// The first error read from a dependency.
    pub error: Option<EvalError<K>>,
    /// Set if the computation requested its own key.
    pub cycle: Option<EvalError<K>>,
    /// Whether a request observed that the evaluation is stopping.
    pub cancelled: bool,
}
