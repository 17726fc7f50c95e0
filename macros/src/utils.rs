use syn::parse::ParseStream;

use super::*;

mod kw {
    syn::custom_keyword!(kind);
}

/// Find the `#[key(kind = Name)]` attribute and return the chosen name.
pub fn kind_override(attrs: &[syn::Attribute]) -> Result<Option<syn::Ident>> {
    let mut found = None;
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("key")) {
        if found.is_some() {
            bail!(attr, "duplicate `key` attribute")
        }
        found = attr.parse_args_with(parse_kind)?;
    }
    Ok(found)
}

/// Parse the `kind = Name` metadata pair.
fn parse_kind(input: ParseStream) -> Result<Option<syn::Ident>> {
    if !input.peek(kw::kind) {
        return Err(input.error("evalgraph: expected `kind = Name`"));
    }

    let _: kw::kind = input.parse()?;
    let _: syn::Token![=] = input.parse()?;
    let value: syn::Ident = input.parse()?;
    eat_comma(input);
    Ok(Some(value))
}

/// Parse a comma if there is one.
fn eat_comma(input: ParseStream) {
    if input.peek(syn::Token![,]) {
        let _: Result<syn::Token![,]> = input.parse();
    }
}
