//! Dependency-ordered registration of fragment factories.
//!
//! Unlike the per-key dependencies that computations discover while they run,
//! the requirements between fragment factories are declared upfront and
//! resolved once, at startup, into a deterministic creation order. Any problem
//! with the declarations is fatal.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::BootstrapError;

/// The static declaration of a fragment factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorySpec<T> {
    /// The fragment kind the factory produces.
    pub produces: T,
    /// The fragment kinds that must be created before this one.
    pub requires: Vec<T>,
}

impl<T> FactorySpec<T> {
    /// Declare a factory.
    pub fn new(produces: T, requires: impl IntoIterator<Item = T>) -> Self {
        Self { produces, requires: requires.into_iter().collect() }
    }
}

/// Compute the order in which the factories must be created.
///
/// Every required kind comes before the kinds requiring it. Factories that do
/// not constrain each other keep their declaration order, so the result only
/// depends on the input.
pub fn creation_order<T>(factories: &[FactorySpec<T>]) -> Result<Vec<T>, BootstrapError<T>>
where
    T: Debug + Copy + Eq + Hash,
{
    let mut index = FxHashMap::default();
    for (i, factory) in factories.iter().enumerate() {
        if index.insert(factory.produces, i).is_some() {
            return Err(BootstrapError::Duplicate { kind: factory.produces });
        }
    }

    // Edges point from a required factory to the factories requiring it.
    let mut successors = vec![Vec::new(); factories.len()];
    let mut requirements = vec![Vec::new(); factories.len()];
    let mut in_degree = vec![0usize; factories.len()];
    for (i, factory) in factories.iter().enumerate() {
        let mut seen = FxHashSet::default();
        for required in &factory.requires {
            let Some(&j) = index.get(required) else {
                return Err(BootstrapError::MissingProducer {
                    kind: *required,
                    required_by: factory.produces,
                });
            };
            if seen.insert(j) {
                successors[j].push(i);
                requirements[i].push(j);
                in_degree[i] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..factories.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(factories.len());
    while let Some(i) = ready.pop_first() {
        order.push(factories[i].produces);
        for &succ in &successors[i] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    if order.len() < factories.len() {
        let cycle = find_cycle(&in_degree, &requirements);
        return Err(BootstrapError::Cycle {
            kinds: cycle.into_iter().map(|i| factories[i].produces).collect(),
        });
    }

    Ok(order)
}

/// Extract one cycle from the factories left over by the topological sort.
///
/// Every leftover factory still has an unsatisfied requirement on another
/// leftover factory, so following those requirements must revisit a factory.
fn find_cycle(in_degree: &[usize], requirements: &[Vec<usize>]) -> Vec<usize> {
    let Some(start) = (0..in_degree.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position = FxHashMap::default();
    position.insert(start, 0);

    let mut current = start;
    loop {
        let next = requirements[current]
            .iter()
            .copied()
            .find(|&j| in_degree[j] > 0)
            .unwrap_or_else(|| unreachable!("leftover factory without leftover requirement"));

        if let Some(&at) = position.get(&next) {
            return path.split_off(at);
        }

        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
