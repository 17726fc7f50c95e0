use rustc_hash::FxHashSet;

use crate::graph::{Graph, NodeId, Status};
use crate::key::{Key, Value};

impl<K: Key, V: Value> Graph<K, V> {
    /// Mark the given entries and everything that transitively depends on
    /// them as dirty. Returns the number of entries whose state changed.
    ///
    /// Directly changed entries are always recomputed on their next demand.
    /// Entries that are only reached through reverse dependencies keep their
    /// stale value and dependencies, so that the scheduler can confirm them
    /// without recomputation if none of their dependencies changed.
    pub(crate) fn invalidate(&mut self, changed: &[K]) -> usize {
        let mut dirtied = 0;
        let mut visited = FxHashSet::default();
        let mut stack: Vec<NodeId> = Vec::new();

        for key in changed {
            let Some(id) = self.id_mut(key) else { continue };
            let mut entry = self.entry_mut(id);
            let (status, propagate) = match entry.status {
                Status::Done => (Status::Dirty { changed: true }, true),
                // Errors are not kept across invalidations.
                Status::Error => (Status::NotStarted, true),
                // Already dirty through a dependency: its dependents were
                // dirtied back then.
                Status::Dirty { .. } => (Status::Dirty { changed: true }, false),
                // Recomputed on demand anyway.
                status => (status, true),
            };

            if entry.status != status {
                entry.status = status;
                dirtied += 1;
            }
            if propagate && visited.insert(id) {
                stack.extend(entry.rdeps.iter().copied());
            }
        }

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }

            let mut entry = self.entry_mut(id);
            entry.status = match entry.status {
                Status::Done => Status::Dirty { changed: false },
                Status::Error => Status::NotStarted,
                // Stop at entries that are already dirty.
                _ => continue,
            };
            dirtied += 1;
            stack.extend(entry.rdeps.iter().copied());
        }

        tracing::debug!(changed = changed.len(), dirtied, "invalidated");
        dirtied
    }
}
