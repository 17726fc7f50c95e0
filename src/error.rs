use std::fmt::{Debug, Write};
use std::sync::Arc;

/// An error stored on an entry and reported for a root key.
///
/// Missing dependencies are not errors: they are resolved by the scheduler
/// and never escape the engine. Everything else is reported through this
/// type, which is propagated unchanged from a failing key to every key that
/// depends on it. The key in the error is therefore always the one that
/// actually failed, not the root that was requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError<K: Debug> {
    /// A computation reported a derivation failure.
    #[error("failed to compute {key:?}: {message}")]
    Computation { key: K, message: Arc<str> },
    /// A key depends on itself, directly or transitively. The cycle lists the
    /// participating keys in dependency order.
    #[error("dependency cycle: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<K> },
    /// The evaluation was stopped before the key could be computed.
    #[error("evaluation of {key:?} was cancelled")]
    Cancelled { key: K },
}

impl<K: Debug> EvalError<K> {
    /// Create a computation error for `key`.
    pub fn computation(key: K, message: impl Into<Arc<str>>) -> Self {
        Self::Computation { key, message: message.into() }
    }

    /// The key this error originated at. For cycles, this is the first key
    /// of the cycle. Cycles reported by the engine are never empty.
    pub fn key(&self) -> Option<&K> {
        match self {
            Self::Computation { key, .. } | Self::Cancelled { key } => Some(key),
            Self::Cycle { cycle } => cycle.first(),
        }
    }

    /// Whether the evaluation was stopped rather than the build being invalid.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this is a dependency cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle { .. })
    }
}

/// An error that rejects a registry at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError<T: Debug> {
    /// The factories' requirements form a cycle.
    #[error("fragment factories form a cycle: {}", format_cycle(.kinds))]
    Cycle { kinds: Vec<T> },
    /// A factory requires a kind that no factory produces.
    #[error("there is no factory for {kind:?}, which is required by {required_by:?}")]
    MissingProducer { kind: T, required_by: T },
    /// The same kind was registered twice.
    #[error("{kind:?} is registered more than once")]
    Duplicate { kind: T },
}

/// Render a cycle as `a -> b -> a`.
fn format_cycle<T: Debug>(items: &[T]) -> String {
    let mut out = String::new();
    for item in items.iter().chain(items.first()) {
        if !out.is_empty() {
            out.push_str(" -> ");
        }
        let _ = write!(out, "{item:?}");
    }
    out
}
