//! Helper macros for `ftp-privsep`

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Fields, ItemEnum};

/// Derive the one-byte wire encoding of a fieldless enum.
///
/// Generates `TryFrom<u8>` (unknown values are returned as the error),
/// `From<Enum> for u8` and a kebab-case `AsRef<str>` name that is used
/// in log messages.
#[proc_macro_derive(Tag)]
pub fn derive_tag(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(item as ItemEnum);

    derive_tag_enum(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn derive_tag_enum(item: ItemEnum) -> syn::Result<TokenStream> {
    let ident = item.ident.clone();
    let mut as_ref_str = vec![];
    let mut from_id = vec![];

    for variant in item.variants.iter() {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new(
                variant.span(),
                "wire tags must be fieldless variants",
            ));
        }
        let ident = &variant.ident;
        let name = ident.to_string().to_case(Case::Kebab);

        as_ref_str.push(quote! {
            Self::#ident => #name,
        });

        from_id.push(quote! {
            id if id == Self::#ident as u8 => Ok(Self::#ident),
        });
    }

    Ok(quote! {
        impl AsRef<str> for #ident {
            fn as_ref(&self) -> &str {
                match self {
                    #(#as_ref_str)*
                }
            }
        }

        impl std::convert::TryFrom<u8> for #ident {
            type Error = u8;

            fn try_from(id: u8) -> Result<Self, Self::Error> {
                match id {
                    #(#from_id)*
                    id => Err(id),
                }
            }
        }

        impl From<#ident> for u8 {
            fn from(tag: #ident) -> u8 {
                tag as u8
            }
        }
    })
}
