//! Incremental evaluation of dynamically discovered dependency graphs.
//!
//! Facts are addressed by [keys](Key) and derived by registered
//! [computations](Computation). A computation requests the values of other
//! keys through its [`Environment`]; if a requested value is not available
//! yet, the computation returns early and is invoked again, from the start,
//! once it is. The [`Engine`] caches every value together with the
//! dependencies its computation actually read, so that after
//! [invalidating](Engine::invalidate) some keys, the next evaluation only
//! recomputes what transitively depends on them.
//!
//! ```
//! use evalgraph::{Engine, EvalError, Key, Options, Registry};
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! enum Node {
//!     Number(u32),
//!     Sum(u32),
//! }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Kind {
//!     Number,
//!     Sum,
//! }
//!
//! impl Key for Node {
//!     type Kind = Kind;
//!
//!     fn kind(&self) -> Kind {
//!         match self {
//!             Node::Number(_) => Kind::Number,
//!             Node::Sum(_) => Kind::Sum,
//!         }
//!     }
//! }
//!
//! let registry = Registry::builder()
//!     .register_fn(Kind::Number, |key: &Node, _env| match key {
//!         Node::Number(n) => Ok(Some(*n as u64)),
//!         _ => Err(EvalError::computation(key.clone(), "not a number")),
//!     })
//!     .register_fn(Kind::Sum, |key: &Node, env| {
//!         let Node::Sum(n) = key else { unreachable!() };
//!         let mut sum = 0;
//!         for i in 0..=*n {
//!             if let Some(value) = env.get(&Node::Number(i))? {
//!                 sum += *value;
//!             }
//!         }
//!         Ok((!env.values_missing()).then_some(sum))
//!     })
//!     .build()
//!     .unwrap();
//!
//! let engine = Engine::new(registry);
//! let result = engine.evaluate(&[Node::Sum(4)], &Options::new());
//! assert_eq!(**result.value(&Node::Sum(4)).unwrap(), 10);
//! ```

pub mod bootstrap;
mod engine;
mod env;
mod error;
mod graph;
mod hash;
mod invalidate;
mod key;
mod options;
mod registry;
mod scheduler;

pub use crate::engine::{Engine, EvaluationResult};
pub use crate::env::Environment;
pub use crate::error::{BootstrapError, EvalError};
pub use crate::graph::State;
pub use crate::hash::fingerprint;
pub use crate::key::{Key, Value};
pub use crate::options::{Interrupt, Options};
pub use crate::registry::{Computation, Outcome, Registry, RegistryBuilder};
pub use crate::scheduler::Statistics;
#[cfg(feature = "macros")]
pub use evalgraph_macros::Key;
