use std::fmt::Debug;
use std::hash::Hash;

/// The identity of a computable fact.
///
/// A key is a kind tag plus a kind-specific argument. The kind selects the
/// computation that derives the key's value; the argument is what that
/// computation is about. Two equal keys always denote the same computation
/// and, once resolved, the same value.
///
/// For enums, this trait can be derived with
/// [`#[derive(Key)]`](macro@crate::Key), which also generates the fieldless
/// kind enum.
pub trait Key: Debug + Clone + Eq + Hash + Send + Sync + 'static {
    /// The tag that selects a registered computation.
    type Kind: Debug + Copy + Eq + Hash + Send + Sync + 'static;

    /// The kind of this key.
    fn kind(&self) -> Self::Kind;
}

/// An immutable result of a computation.
///
/// Values are shared behind an `Arc` once stored. The `Hash` implementation
/// feeds the fingerprint used to detect recomputations that produced an
/// unchanged value.
pub trait Value: Debug + Eq + Hash + Send + Sync + 'static {}

impl<T> Value for T where T: Debug + Eq + Hash + Send + Sync + 'static {}

/// Plain numbers as keys of a single kind, for testing the graph in isolation.
#[cfg(test)]
impl Key for u32 {
    type Kind = ();

    fn kind(&self) -> Self::Kind {}
}
