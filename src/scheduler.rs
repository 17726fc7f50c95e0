//! Drives the evaluation of root keys to a fixed point.
//!
//! Every entry that needs work becomes a task on the worker pool. An
//! invocation that finds some of its dependencies missing does not block:
//! the entry registers itself as a waiter on each missing dependency, the
//! dependencies are scheduled, and the entry is spawned again once all of
//! them are finished, at which point its computation reruns from the start.
//!
//! Waiter registration happens under the dependency's lock, and a finished
//! dependency drains its waiters under the same lock, so a dependency that
//! finishes concurrently with the registration is never missed. The pending
//! counter on the waiting entry starts with one extra unit that is released
//! only after all registrations went through, which ensures the entry is
//! spawned exactly once.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::{ScopeFifo, ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::env::{Environment, Recorded};
use crate::error::EvalError;
use crate::graph::{Entry, Graph, Node, NodeId, Status, Stored};
use crate::hash::fingerprint;
use crate::key::{Key, Value};
use crate::options::Options;
use crate::registry::Registry;

/// Build a pool with the given number of workers.
pub(crate) fn pool(threads: usize) -> Result<ThreadPool, ThreadPoolBuildError> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("evalgraph-worker-{i}"))
        .build()
}

/// The state of one evaluation.
pub(crate) struct Run<'a, K: Key, V: Value> {
    graph: &'a Graph<K, V>,
    registry: &'a Registry<K, V>,
    options: &'a Options,
    /// The engine version this evaluation brings entries up to.
    version: u64,
    /// The span of the evaluation, entered by every task.
    span: tracing::Span,
    /// Set in fail-fast mode once the first error was stored.
    abort: AtomicBool,
    /// Every entry this evaluation scheduled, for the final cleanup.
    touched: Mutex<Vec<NodeId>>,
    /// Errors that originated in this evaluation.
    errors: Mutex<Vec<EvalError<K>>>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    invocations: AtomicUsize,
    restarts: AtomicUsize,
    verified: AtomicUsize,
    pruned: AtomicUsize,
}

/// Counts what an evaluation did.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Statistics {
    /// How often computations were invoked.
    pub invocations: usize,
    /// How many of those invocations were restarts after missing
    /// dependencies.
    pub restarts: usize,
    /// Dirty entries confirmed up to date without invoking their computation.
    pub verified: usize,
    /// Recomputed entries whose value turned out unchanged.
    pub pruned: usize,
}

impl<'a, K: Key, V: Value> Run<'a, K, V> {
    pub fn new(
        graph: &'a Graph<K, V>,
        registry: &'a Registry<K, V>,
        options: &'a Options,
        version: u64,
    ) -> Self {
        Self {
            graph,
            registry,
            options,
            version,
            span: tracing::Span::current(),
            abort: AtomicBool::new(false),
            touched: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn graph(&self) -> &'a Graph<K, V> {
        self.graph
    }

    /// Whether no new work may be started.
    pub fn is_stopped(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.is_interrupted()
    }

    /// Whether cancellation was requested from the outside.
    pub fn is_interrupted(&self) -> bool {
        self.options.interrupt_handle().is_triggered()
    }

    /// Bring the given entries to a finished state, as far as possible.
    ///
    /// Runs on `pool`, or on the global pool if there is none.
    pub fn execute(&self, pool: Option<&ThreadPool>, roots: &[NodeId]) {
        self.scope(pool, |scope| {
            for &id in roots {
                let node = self.graph.node(id);
                self.schedule(scope, id, &node);
            }
        });

        // Once a scope returned, nothing is running anymore and every entry
        // that is still waiting is part of or blocked by a cycle.
        while !self.is_stopped() {
            let Some(waiters) = self.break_cycles() else { break };
            self.scope(pool, |scope| self.wake(scope, waiters));
        }

        if !self.is_interrupted() {
            self.bubble_errors();
        }
        self.cleanup();
    }

    /// Run `op` and all tasks spawned from it to completion.
    fn scope<'s, F>(&'s self, pool: Option<&ThreadPool>, op: F)
    where
        F: FnOnce(&ScopeFifo<'s>) + Send,
    {
        match pool {
            Some(pool) => pool.scope_fifo(op),
            None => rayon::scope_fifo(op),
        }
    }

    /// Spawn a task that advances the entry.
    fn spawn<'s>(&'s self, scope: &ScopeFifo<'s>, id: NodeId) {
        scope.spawn_fifo(move |scope| {
            let _guard = self.span.enter();
            self.process(scope, id);
        });
    }

    /// Spawn an entry if it needs work and is not spawned yet.
    fn schedule<'s>(&'s self, scope: &ScopeFifo<'s>, id: NodeId, node: &Node<K, V>) {
        let mut entry = node.entry.write();
        if entry.status.needs_work() && !entry.transient.scheduled {
            entry.transient.scheduled = true;
            drop(entry);
            self.touched.lock().push(id);
            self.spawn(scope, id);
        }
    }

    /// Register `waiter` to be woken once `id` is finished, scheduling `id`
    /// if necessary. Returns false if `id` is already finished.
    fn add_waiter<'s>(&'s self, scope: &ScopeFifo<'s>, id: NodeId, waiter: NodeId) -> bool {
        let node = self.graph.node(id);
        let mut entry = node.entry.write();
        if entry.status.is_finished() {
            return false;
        }

        entry.transient.waiters.push(waiter);
        if entry.status.needs_work() && !entry.transient.scheduled {
            entry.transient.scheduled = true;
            drop(entry);
            self.touched.lock().push(id);
            self.spawn(scope, id);
        }
        true
    }

    /// Wake the given waiters of a finished entry.
    fn wake<'s>(&'s self, scope: &ScopeFifo<'s>, waiters: Vec<NodeId>) {
        for waiter in waiters {
            let node = self.graph.node(waiter);
            if node.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.spawn(scope, waiter);
            }
        }
    }

    /// Suspend an entry until all of `deps` are finished.
    fn suspend<'s>(
        &'s self,
        scope: &ScopeFifo<'s>,
        id: NodeId,
        node: &Node<K, V>,
        deps: Vec<NodeId>,
    ) {
        node.pending.store(deps.len() + 1, Ordering::Release);
        {
            let mut entry = node.entry.write();
            entry.status = Status::Waiting;
            entry.transient.waiting_on = deps.clone();
        }

        let mut released = 1;
        for dep in deps {
            if !self.add_waiter(scope, dep, id) {
                released += 1;
            }
        }

        if node.pending.fetch_sub(released, Ordering::AcqRel) == released {
            self.spawn(scope, id);
        }
    }

    /// Advance a spawned entry.
    fn process<'s>(&'s self, scope: &ScopeFifo<'s>, id: NodeId) {
        // Entries left behind by a stop are settled by the cleanup.
        if self.is_stopped() {
            return;
        }

        let node = self.graph.node(id);
        let (previous, waiting_on, verifying) = {
            let mut entry = node.entry.write();
            entry.transient.scheduled = false;
            let previous = entry.status;
            if !matches!(
                previous,
                Status::NotStarted | Status::Dirty { .. } | Status::Cancelled | Status::Waiting
            ) {
                return;
            }
            entry.status = Status::Evaluating;
            (
                previous,
                mem::take(&mut entry.transient.waiting_on),
                entry.transient.verify.is_some(),
            )
        };

        if previous == Status::Waiting && !verifying {
            if let Some(err) = self.first_error(&waiting_on) {
                // A dependency this entry waited for failed, so the entry can
                // never be done in this epoch.
                tracing::trace!(key = ?node.key, "propagating dependency error");
                let waiters = self.propagate(id, &node, err);
                self.wake(scope, waiters);
                return;
            }
        }

        let verify = {
            let mut entry = node.entry.write();
            if let Status::Dirty { changed: false } = previous {
                if self.options.is_change_pruning() && entry.value.is_some() {
                    entry.transient.verify = Some(0);
                }
            }
            entry.transient.verify
        };

        if let Some(cursor) = verify {
            match self.verify(scope, id, &node, cursor) {
                Verification::Finished | Verification::Suspended => return,
                Verification::Changed => {}
            }
        }

        self.compute(scope, id, &node);
    }

    /// The error of the first failed entry among `ids`.
    fn first_error(&self, ids: &[NodeId]) -> Option<EvalError<K>> {
        ids.iter().find_map(|&id| {
            let node = self.graph.node(id);
            let entry = node.entry.read();
            match entry.status {
                Status::Error => entry.error.clone(),
                _ => None,
            }
        })
    }

    /// Check whether any of a dirty entry's previous dependencies changed,
    /// starting at `cursor`.
    ///
    /// Dependencies are checked one at a time in the order they were first
    /// requested, because the computation may only have requested a later
    /// dependency based on the value of an earlier one.
    fn verify<'s>(
        &'s self,
        scope: &ScopeFifo<'s>,
        id: NodeId,
        node: &Node<K, V>,
        mut cursor: usize,
    ) -> Verification {
        let (deps, verified_at) = {
            let entry = node.entry.read();
            (entry.deps.clone(), entry.verified_at)
        };

        while let Some(&dep) = deps.get(cursor) {
            let dep_node = self.graph.node(dep);
            let (status, changed_at, error) = {
                let entry = dep_node.entry.read();
                (entry.status, entry.changed_at, entry.error.clone())
            };

            match (status, error) {
                (Status::Done, _) if changed_at <= verified_at => cursor += 1,
                // The first dependency the computation would read fails, so
                // the entry fails with it.
                (Status::Error, Some(err)) => {
                    tracing::trace!(key = ?node.key, "propagating dependency error");
                    let waiters = self.propagate(id, node, err);
                    self.wake(scope, waiters);
                    return Verification::Finished;
                }
                (Status::Done | Status::Error, _) => {
                    node.entry.write().transient.verify = None;
                    return Verification::Changed;
                }
                _ => {
                    node.entry.write().transient.verify = Some(cursor);
                    self.suspend(scope, id, node, vec![dep]);
                    return Verification::Suspended;
                }
            }
        }

        let waiters = {
            let mut entry = node.entry.write();
            entry.transient.verify = None;
            entry.verified_at = self.version;
            entry.status = Status::Done;
            mem::take(&mut entry.transient.waiters)
        };

        tracing::trace!(key = ?node.key, "verified without recomputation");
        self.counters.verified.fetch_add(1, Ordering::Relaxed);
        self.wake(scope, waiters);
        Verification::Finished
    }

    /// Invoke the entry's computation once and interpret the outcome.
    fn compute<'s>(&'s self, scope: &ScopeFifo<'s>, id: NodeId, node: &Node<K, V>) {
        if self.is_stopped() {
            return;
        }

        let attempt = {
            let mut entry = node.entry.write();
            entry.transient.attempts += 1;
            entry.transient.attempts
        };

        self.counters.invocations.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.counters.restarts.fetch_add(1, Ordering::Relaxed);
        }

        let kind = node.key.kind();
        let mut env = Environment::new(self, &node.key);
        let outcome = match self.registry.get(kind) {
            Some(computation) => computation.compute(&node.key, &mut env),
            None => Err(EvalError::computation(
                node.key.clone(),
                format!("no computation registered for {kind:?}"),
            )),
        };
        let Recorded { deps, missing, error, cycle, cancelled } = env.finish();

        if cancelled || outcome.as_ref().is_err_and(|err| err.is_cancelled()) {
            // Nothing is committed. The cleanup marks the entry as cancelled.
            tracing::debug!(key = ?node.key, "computation observed cancellation");
            return;
        }

        // A missing dependency makes the invocation provisional, whatever it
        // returned. Rerunning it once everything is available makes the
        // outcome independent of scheduling.
        if !missing.is_empty() {
            tracing::trace!(
                key = ?node.key,
                attempt,
                missing = missing.len(),
                "restarting once dependencies are done",
            );
            node.entry.write().transient.provisional = deps;
            self.suspend(scope, id, node, missing);
            return;
        }

        let waiters = match (outcome, error, cycle) {
            // A key that requested itself can never be done.
            (_, _, Some(err)) => self.fail(id, node, deps, err, true),
            (Err(err), read, None) => {
                let origin = read.as_ref() != Some(&err);
                self.fail(id, node, deps, err, origin)
            }
            // The computation swallowed a dependency error. It still read a
            // failed entry, so it cannot be done.
            (Ok(_), Some(err), None) => self.fail(id, node, deps, err, false),
            (Ok(Some(value)), None, None) => self.complete(id, node, deps, value),
            (Ok(None), None, None) => {
                let err = EvalError::computation(
                    node.key.clone(),
                    "computation returned no value without missing dependencies",
                );
                self.fail(id, node, deps, err, true)
            }
        };
        self.wake(scope, waiters);
    }

    /// Fail an entry that waited for a failed dependency with the error of
    /// that dependency. Returns the entry's waiters.
    fn propagate(&self, id: NodeId, node: &Node<K, V>, err: EvalError<K>) -> Vec<NodeId> {
        let deps = abandon(&mut node.entry.write());
        self.fail(id, node, deps, err, false)
    }

    /// Replace the reverse edges of `id` from `old` to `new` dependencies.
    fn relink(&self, id: NodeId, old: &[NodeId], new: &[NodeId]) {
        let new_set: FxHashSet<_> = new.iter().copied().collect();
        for &dep in old.iter().filter(|dep| !new_set.contains(dep)) {
            self.graph.node(dep).entry.write().rdeps.remove(&id);
        }
        for &dep in new {
            self.graph.node(dep).entry.write().rdeps.insert(id);
        }
    }

    /// Commit a computed value together with its dependency edges. Returns
    /// the entry's waiters.
    fn complete(
        &self,
        id: NodeId,
        node: &Node<K, V>,
        deps: Vec<NodeId>,
        value: V,
    ) -> Vec<NodeId> {
        debug_assert!(deps.iter().all(|&dep| {
            self.graph.node(dep).entry.read().status == Status::Done
        }));

        let old = node.entry.read().deps.clone();
        self.relink(id, &old, &deps);

        let fingerprint = fingerprint(&value);
        let waiters = {
            let mut entry = node.entry.write();
            let unchanged = entry
                .value
                .as_ref()
                .is_some_and(|stored| stored.fingerprint == fingerprint);

            if unchanged && self.options.is_change_pruning() {
                // Keep the old value and its version, so that dependents can
                // be verified instead of recomputed.
                self.counters.pruned.fetch_add(1, Ordering::Relaxed);
            } else {
                entry.value = Some(Stored { value: Arc::new(value), fingerprint });
                entry.changed_at = self.version;
            }

            entry.deps = deps;
            entry.error = None;
            entry.verified_at = self.version;
            entry.status = Status::Done;
            entry.transient.provisional.clear();
            mem::take(&mut entry.transient.waiters)
        };

        tracing::trace!(key = ?node.key, "committed value");
        waiters
    }

    /// Commit an error together with the dependency edges that led to it.
    /// Returns the entry's waiters.
    ///
    /// `origin` marks errors that were raised by this entry rather than
    /// propagated from a dependency.
    fn fail(
        &self,
        id: NodeId,
        node: &Node<K, V>,
        deps: Vec<NodeId>,
        err: EvalError<K>,
        origin: bool,
    ) -> Vec<NodeId> {
        let old = node.entry.read().deps.clone();
        self.relink(id, &old, &deps);

        let waiters = {
            let mut entry = node.entry.write();
            entry.value = None;
            entry.deps = deps;
            entry.error = Some(err.clone());
            entry.changed_at = self.version;
            entry.verified_at = self.version;
            entry.status = Status::Error;
            entry.transient.provisional.clear();
            mem::take(&mut entry.transient.waiters)
        };

        if origin {
            tracing::debug!(key = ?node.key, error = %err, "computation failed");
            self.record_error(err);
        }
        waiters
    }

    /// Remember an error and stop the evaluation unless keeping going.
    fn record_error(&self, err: EvalError<K>) {
        self.errors.lock().push(err);
        if !self.options.is_keep_going() && !self.abort.swap(true, Ordering::SeqCst) {
            tracing::debug!("stopping evaluation after the first error");
        }
    }

    /// Fail every cycle among the entries that are still waiting after all
    /// tasks finished. Returns the waiters of the failed entries, or `None`
    /// if there was no cycle.
    ///
    /// Once nothing is running, every waiting entry waits on another waiting
    /// entry, so following those edges always closes a cycle.
    fn break_cycles(&self) -> Option<Vec<NodeId>> {
        let touched = self.touched.lock().clone();
        let mut waiters = None;

        for start in touched {
            if self.graph.node(start).entry.read().status != Status::Waiting {
                continue;
            }

            let mut path = vec![start];
            let mut position = FxHashMap::default();
            position.insert(start, 0);
            let mut current = start;

            loop {
                let next = {
                    let node = self.graph.node(current);
                    let entry = node.entry.read();
                    entry.transient.waiting_on.iter().copied().find(|&dep| {
                        self.graph.node(dep).entry.read().status == Status::Waiting
                    })
                };

                let Some(next) = next else { break };
                if let Some(&at) = position.get(&next) {
                    let failed = self.fail_cycle(path.split_off(at));
                    waiters.get_or_insert_with(Vec::new).extend(failed);
                    break;
                }

                position.insert(next, path.len());
                path.push(next);
                current = next;
            }
        }

        waiters
    }

    /// Fail all members of a cycle with the same error. Returns their
    /// waiters.
    fn fail_cycle(&self, mut members: Vec<NodeId>) -> Vec<NodeId> {
        // Start the reported cycle at a fixed member, so that the error does
        // not depend on where the search happened to enter the cycle.
        let nodes: Vec<_> = members.iter().map(|&id| self.graph.node(id)).collect();
        let first = (0..nodes.len())
            .min_by_key(|&i| fingerprint(&nodes[i].key))
            .unwrap_or(0);
        members.rotate_left(first);

        let cycle: Vec<K> = members.iter().map(|&id| self.graph.node(id).key.clone()).collect();
        let err = EvalError::Cycle { cycle };
        tracing::debug!(error = %err, "detected dependency cycle");

        let mut waiters = Vec::new();
        for &id in &members {
            let node = self.graph.node(id);
            let deps = {
                let mut entry = node.entry.write();
                entry.transient.waiting_on.clear();
                abandon(&mut entry)
            };
            let old = node.entry.read().deps.clone();
            self.relink(id, &old, &deps);

            let mut entry = node.entry.write();
            entry.value = None;
            entry.deps = deps;
            entry.error = Some(err.clone());
            entry.changed_at = self.version;
            entry.verified_at = self.version;
            entry.status = Status::Error;
            waiters.append(&mut entry.transient.waiters);
        }

        self.record_error(err);
        waiters
    }

    /// Fail every waiting entry that waits on a failed entry, transitively.
    ///
    /// After a fail-fast stop, the entries between the failure and the roots
    /// are still waiting, whether they were recomputing or checking their
    /// previous dependencies. Failing them surfaces the error at the roots
    /// instead of reporting them as cancelled.
    fn bubble_errors(&self) {
        let touched = self.touched.lock().clone();
        loop {
            let mut progress = false;
            for &id in &touched {
                let node = self.graph.node(id);
                let waiting_on = {
                    let entry = node.entry.read();
                    if entry.status != Status::Waiting {
                        continue;
                    }
                    entry.transient.waiting_on.clone()
                };

                if let Some(err) = self.first_error(&waiting_on) {
                    // Nothing runs anymore, so the waiters are settled by
                    // this loop and the cleanup.
                    self.propagate(id, &node, err);
                    progress = true;
                }
            }

            if !progress {
                break;
            }
        }
    }

    /// Settle every entry that was left unfinished and reset the per-run
    /// bookkeeping.
    fn cleanup(&self) {
        let mut touched = mem::take(&mut *self.touched.lock());
        touched.sort_unstable();
        touched.dedup();

        let mut cancelled = 0;
        for id in touched {
            let node = self.graph.node(id);
            let mut entry = node.entry.write();
            let unfinished = match entry.status {
                Status::Evaluating | Status::Waiting => true,
                status => status.needs_work() && entry.transient.scheduled,
            };
            if unfinished {
                // The committed edges and any stale value are left untouched:
                // an aborted invocation never commits.
                entry.status = Status::Cancelled;
                cancelled += 1;
            }
            entry.transient = Default::default();
            node.pending.store(0, Ordering::Relaxed);
        }

        if cancelled > 0 {
            tracing::debug!(cancelled, "evaluation stopped before finishing");
        }
    }

    /// Errors that originated in this evaluation.
    pub fn take_errors(&self) -> Vec<EvalError<K>> {
        mem::take(&mut *self.errors.lock())
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            invocations: self.counters.invocations.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            verified: self.counters.verified.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
        }
    }
}

/// The dependencies an unfinished entry is left with when it fails: the
/// previous ones while it was checking them, otherwise those its latest
/// invocation requested.
fn abandon<K: Key, V: Value>(entry: &mut Entry<K, V>) -> Vec<NodeId> {
    match entry.transient.verify.take() {
        Some(_) => entry.deps.clone(),
        None => mem::take(&mut entry.transient.provisional),
    }
}

/// The outcome of checking a dirty entry's previous dependencies.
enum Verification {
    /// The entry is settled, either confirmed up to date or failed.
    Finished,
    /// Some dependency changed; the entry must be recomputed.
    Changed,
    /// The entry waits for a dependency to be brought up to date.
    Suspended,
}
