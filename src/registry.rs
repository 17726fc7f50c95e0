use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::bootstrap::{self, FactorySpec};
use crate::env::Environment;
use crate::error::{BootstrapError, EvalError};
use crate::key::{Key, Value};

/// The outcome of one invocation of a computation.
///
/// `Ok(Some(value))` is a final value, `Ok(None)` means that some requested
/// dependency was missing and the computation should be restarted once it is
/// available.
pub type Outcome<K, V> = Result<Option<V>, EvalError<K>>;

/// Derives the value of keys of one kind.
///
/// A computation must be a pure function of its key and the dependency values
/// it reads through the environment. It may be invoked several times for the
/// same key, each time from the start, until all of its dependencies are
/// available, so it must not have externally visible side effects before it
/// returns a final value.
pub trait Computation<K: Key, V: Value>: Send + Sync + 'static {
    /// Compute the value for `key`.
    fn compute(&self, key: &K, env: &mut Environment<'_, K, V>) -> Outcome<K, V>;
}

/// Adapts a closure to the [`Computation`] trait.
struct FnComputation<F>(F);

impl<K, V, F> Computation<K, V> for FnComputation<F>
where
    K: Key,
    V: Value,
    F: Fn(&K, &mut Environment<'_, K, V>) -> Outcome<K, V> + Send + Sync + 'static,
{
    fn compute(&self, key: &K, env: &mut Environment<'_, K, V>) -> Outcome<K, V> {
        (self.0)(key, env)
    }
}

/// Maps each key kind to the computation that derives its values.
pub struct Registry<K: Key, V: Value> {
    computations: FxHashMap<K::Kind, Arc<dyn Computation<K, V>>>,
    creation_order: Vec<K::Kind>,
}

impl<K: Key, V: Value> Registry<K, V> {
    /// Start registering computations.
    pub fn builder() -> RegistryBuilder<K, V> {
        RegistryBuilder::new()
    }

    /// The computation registered for `kind`.
    pub fn get(&self, kind: K::Kind) -> Option<&Arc<dyn Computation<K, V>>> {
        self.computations.get(&kind)
    }

    /// Whether a computation is registered for `kind`.
    pub fn contains(&self, kind: K::Kind) -> bool {
        self.computations.contains_key(&kind)
    }

    /// The kinds of all registered fragment factories, each one after every
    /// factory it requires.
    pub fn creation_order(&self) -> &[K::Kind] {
        &self.creation_order
    }
}

impl<K: Key, V: Value> Debug for Registry<K, V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.computations.keys().collect::<Vec<_>>())
            .field("creation_order", &self.creation_order)
            .finish()
    }
}

/// Collects computations and resolves the bootstrap order of factories.
pub struct RegistryBuilder<K: Key, V: Value> {
    computations: Vec<(K::Kind, Arc<dyn Computation<K, V>>)>,
    factories: Vec<(K::Kind, FactorySpec<K::Kind>)>,
}

impl<K: Key, V: Value> RegistryBuilder<K, V> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self { computations: Vec::new(), factories: Vec::new() }
    }

    /// Register a computation for `kind`.
    pub fn register(mut self, kind: K::Kind, computation: impl Computation<K, V>) -> Self {
        self.computations.push((kind, Arc::new(computation)));
        self
    }

    /// Register a closure as the computation for `kind`.
    pub fn register_fn<F>(self, kind: K::Kind, f: F) -> Self
    where
        F: Fn(&K, &mut Environment<'_, K, V>) -> Outcome<K, V> + Send + Sync + 'static,
    {
        self.register(kind, FnComputation(f))
    }

    /// Register a fragment factory.
    ///
    /// Like [`register`](Self::register), but the factory also declares the
    /// fragment kind it produces and the fragment kinds it requires. These
    /// declarations determine [`Registry::creation_order`].
    pub fn register_factory(
        mut self,
        kind: K::Kind,
        computation: impl Computation<K, V>,
        requires: impl IntoIterator<Item = K::Kind>,
        produces: K::Kind,
    ) -> Self {
        self.factories.push((kind, FactorySpec::new(produces, requires)));
        self.register(kind, computation)
    }

    /// Validate the registrations and order the factories.
    ///
    /// Fails if a kind is registered twice, if the factories' requirements
    /// form a cycle, or if a required kind has no producer.
    pub fn build(self) -> Result<Registry<K, V>, BootstrapError<K::Kind>> {
        let mut computations = FxHashMap::default();
        for (kind, computation) in self.computations {
            if computations.insert(kind, computation).is_some() {
                return Err(BootstrapError::Duplicate { kind });
            }
        }

        let declared: Vec<_> = self.factories.iter().map(|(_, factory)| factory.clone()).collect();
        let producers: FxHashMap<_, _> = self
            .factories
            .iter()
            .map(|(kind, factory)| (factory.produces, *kind))
            .collect();
        let creation_order = bootstrap::creation_order(&declared)?
            .into_iter()
            .map(|produced| producers[&produced])
            .collect();

        tracing::debug!(?creation_order, kinds = computations.len(), "registry built");
        Ok(Registry { computations, creation_order })
    }
}

impl<K: Key, V: Value> Default for RegistryBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
