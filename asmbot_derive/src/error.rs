//! Derive macro for error types.
//!
//! ```ignore
//! use asmbot_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum RunError {
//!     #[error("fault at {pc:#010x}")]
//!     Fault { pc: u32 },
//!
//!     #[error("assembly failed: {0}")]
//!     Asm(#[from] AsmError),
//!
//!     #[error("cancelled")]
//!     Cancelled,
//! }
//! ```
//!
//! Struct variants interpolate fields by name, tuple variants by position
//! (`{0}`, `{1}`). Positional arguments are rewritten to `{f0}`, `{f1}` so the
//! generated `write!` can bind them as named arguments.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, Lit, Meta, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (display_body, from_impls) = match &input.data {
        Data::Enum(data) => {
            let mut arms = Vec::with_capacity(data.variants.len());
            let mut froms = Vec::new();
            for variant in &data.variants {
                let ident = &variant.ident;
                let message = message_from_attrs(&variant.attrs, ident, "variant")?;
                arms.push(display_arm(quote!(Self::#ident), &variant.fields, &message));
                if let Some(from) = from_impl(name, ident, &variant.fields)? {
                    froms.push(from);
                }
            }
            (quote! { match self { #(#arms)* } }, froms)
        }
        Data::Struct(data) => {
            let message = message_from_attrs(&input.attrs, name, "type")?;
            let body = match &data.fields {
                Fields::Unit => quote! { write!(f, #message) },
                Fields::Named(fields) => {
                    let names: Vec<_> = fields
                        .named
                        .iter()
                        .filter_map(|f| f.ident.as_ref())
                        .filter(|ident| mentions(&message, &ident.to_string()))
                        .collect();
                    quote! { write!(f, #message, #(#names = self.#names),*) }
                }
                Fields::Unnamed(fields) => {
                    let message = positional_to_named(&message, fields.unnamed.len());
                    let (idents, indices): (Vec<_>, Vec<_>) = positional_idents(fields.unnamed.len())
                        .into_iter()
                        .zip((0..fields.unnamed.len()).map(syn::Index::from))
                        .filter(|(ident, _)| mentions(&message, &ident.to_string()))
                        .unzip();
                    quote! { write!(f, #message, #(#idents = self.#indices),*) }
                }
            };
            (body, Vec::new())
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #display_body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}

        #(#from_impls)*
    })
}

fn display_arm(path: TokenStream2, fields: &Fields, message: &str) -> TokenStream2 {
    match fields {
        Fields::Unit => quote! { #path => write!(f, #message), },
        Fields::Named(named) => {
            let names: Vec<_> = named
                .named
                .iter()
                .filter_map(|f| f.ident.as_ref())
                .filter(|ident| mentions(message, &ident.to_string()))
                .collect();
            quote! {
                #path { #(#names,)* .. } => write!(f, #message, #(#names = #names),*),
            }
        }
        Fields::Unnamed(unnamed) => {
            let message = positional_to_named(message, unnamed.unnamed.len());
            let idents = positional_idents(unnamed.unnamed.len());
            let used: Vec<_> = idents
                .iter()
                .filter(|ident| mentions(&message, &ident.to_string()))
                .collect();
            let patterns = idents.iter().map(|ident| {
                if mentions(&message, &ident.to_string()) {
                    quote!(#ident)
                } else {
                    quote!(_)
                }
            });
            quote! {
                #path(#(#patterns),*) => write!(f, #message, #(#used = #used),*),
            }
        }
    }
}

/// Emits `impl From<Inner> for Outer` for `Variant(#[from] Inner)`.
fn from_impl(
    name: &syn::Ident,
    variant: &syn::Ident,
    fields: &Fields,
) -> syn::Result<Option<TokenStream2>> {
    let Fields::Unnamed(unnamed) = fields else {
        return Ok(None);
    };
    let marked: Vec<_> = unnamed
        .unnamed
        .iter()
        .filter(|field| field.attrs.iter().any(|a| a.path().is_ident("from")))
        .collect();
    match (marked.as_slice(), unnamed.unnamed.len()) {
        ([], _) => Ok(None),
        ([field], 1) => {
            let ty = &field.ty;
            Ok(Some(quote! {
                impl ::std::convert::From<#ty> for #name {
                    fn from(value: #ty) -> Self {
                        Self::#variant(value)
                    }
                }
            }))
        }
        _ => Err(syn::Error::new_spanned(
            variant,
            "#[from] is only supported on a variant with exactly one field",
        )),
    }
}

fn message_from_attrs<T: ToTokens>(
    attrs: &[Attribute],
    target: &T,
    what: &str,
) -> syn::Result<String> {
    let Some(attr) = attrs.iter().find(|a| a.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            target,
            format!("missing #[error(\"...\")] attribute on {what}"),
        ));
    };
    let Meta::List(list) = &attr.meta else {
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "expected #[error(\"message\")]",
        ));
    };
    match syn::parse2::<Lit>(list.tokens.clone()) {
        Ok(Lit::Str(lit)) => Ok(lit.value()),
        _ => Err(syn::Error::new_spanned(
            &attr.meta,
            "#[error] message must be a string literal",
        )),
    }
}

/// True when `message` interpolates `name` as `{name}` or `{name:spec}`.
fn mentions(message: &str, name: &str) -> bool {
    message.contains(&format!("{{{name}}}")) || message.contains(&format!("{{{name}:"))
}

fn positional_idents(count: usize) -> Vec<syn::Ident> {
    (0..count).map(|i| format_ident!("f{}", i)).collect()
}

fn positional_to_named(message: &str, count: usize) -> String {
    let mut out = message.to_string();
    for i in (0..count).rev() {
        out = out.replace(&format!("{{{i}}}"), &format!("{{f{i}}}"));
        out = out.replace(&format!("{{{i}:"), &format!("{{f{i}:"));
    }
    out
}
