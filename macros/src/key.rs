use super::*;

/// Derive the `Key` implementation and the kind enum.
pub fn expand(item: &syn::DeriveInput) -> Result<proc_macro2::TokenStream> {
    let syn::Data::Enum(data) = &item.data else {
        bail!(item.ident, "`Key` can only be derived for enums")
    };

    if let Some(param) = item.generics.params.first() {
        bail!(param, "keys cannot be generic")
    }

    if data.variants.is_empty() {
        bail!(item.ident, "a key enum needs at least one variant")
    }

    let name = &item.ident;
    let vis = &item.vis;
    let kind = match utils::kind_override(&item.attrs)? {
        Some(ident) => ident,
        None => format_ident!("{}Kind", name),
    };

    let variants: Vec<_> = data.variants.iter().map(|variant| &variant.ident).collect();
    let doc = format!("The kinds of [`{name}`].");

    Ok(quote! {
        #[doc = #doc]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #vis enum #kind {
            #(#variants,)*
        }

        impl ::evalgraph::Key for #name {
            type Kind = #kind;

            #[inline]
            fn kind(&self) -> Self::Kind {
                match self {
                    #(Self::#variants { .. } => #kind::#variants,)*
                }
            }
        }
    })
}
