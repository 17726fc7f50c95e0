extern crate proc_macro;

macro_rules! bail {
    ($item:expr, $fmt:literal $($tts:tt)*) => {
        return Err(Error::new_spanned(
            &$item,
            format!(concat!("evalgraph: ", $fmt) $($tts)*)
        ))
    }
}

mod key;
mod utils;

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Error, Result};

/// Make an enum usable as the key type of an evaluation engine.
///
/// Generates a fieldless `<Name>Kind` enum with one variant per key variant
/// and implements `evalgraph::Key` so that every key reports its kind. The
/// name of the generated enum can be chosen with `#[key(kind = Name)]`.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq, Hash, Key)]
/// enum Node {
///     PackageLookup(PathBuf),
///     ContainingPackage(PathBuf),
/// }
///
/// assert_eq!(Node::PackageLookup("a".into()).kind(), NodeKind::PackageLookup);
/// ```
#[proc_macro_derive(Key, attributes(key))]
pub fn derive_key(stream: TokenStream) -> TokenStream {
    let item = syn::parse_macro_input!(stream as syn::DeriveInput);
    key::expand(&item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}
