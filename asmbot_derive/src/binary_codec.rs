//! Derive macro for binary serialization.
//!
//! Generates `Encode` and `Decode` for structs and enums against the
//! `crate::types::encoding` traits of the deriving crate.
//!
//! # Binary Format
//!
//! - Struct fields are written in declaration order with no framing.
//! - Enums write a `u8` discriminant followed by the variant's fields.
//!   Explicit discriminants (`Variant = 5`) are honored, later variants
//!   count up from the last explicit value.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DeriveInput, Fields, parse_macro_input};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => {
            let (pattern, writes) = bind_fields(quote!(Self), &data.fields);
            let construct = construct(quote!(Self), &data.fields);
            (
                quote! {
                    let #pattern = self;
                    #(#writes)*
                },
                quote! { Ok(#construct) },
            )
        }
        Data::Enum(data) => expand_enum(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

fn expand_enum(data: &DataEnum) -> syn::Result<(TokenStream2, TokenStream2)> {
    let tags = discriminants(data)?;
    let mut encode_arms = Vec::with_capacity(data.variants.len());
    let mut decode_arms = Vec::with_capacity(data.variants.len());

    for (variant, tag) in data.variants.iter().zip(tags) {
        let ident = &variant.ident;
        let (pattern, writes) = bind_fields(quote!(Self::#ident), &variant.fields);
        let construct = construct(quote!(Self::#ident), &variant.fields);
        encode_arms.push(quote! {
            #pattern => {
                crate::types::encoding::Encode::encode(&#tag, out);
                #(#writes)*
            }
        });
        decode_arms.push(quote! { #tag => Ok(#construct), });
    }

    Ok((
        quote! { match self { #(#encode_arms)* } },
        quote! {
            let tag: u8 = crate::types::encoding::Decode::decode(input)?;
            match tag {
                #(#decode_arms)*
                _ => Err(crate::types::encoding::DecodeError::InvalidValue),
            }
        },
    ))
}

/// Returns a destructuring pattern for `path` and one encode call per field.
fn bind_fields(path: TokenStream2, fields: &Fields) -> (TokenStream2, Vec<TokenStream2>) {
    let encode = |binding: &syn::Ident| {
        quote! { crate::types::encoding::Encode::encode(#binding, out); }
    };
    match fields {
        Fields::Unit => (path, Vec::new()),
        Fields::Named(named) => {
            let names: Vec<_> = named.named.iter().filter_map(|f| f.ident.clone()).collect();
            let writes = names.iter().map(encode).collect();
            (quote! { #path { #(#names),* } }, writes)
        }
        Fields::Unnamed(unnamed) => {
            let names: Vec<_> = (0..unnamed.unnamed.len())
                .map(|i| format_ident!("f{}", i))
                .collect();
            let writes = names.iter().map(encode).collect();
            (quote! { #path(#(#names),*) }, writes)
        }
    }
}

/// Builds `path` by decoding each field in declaration order.
fn construct(path: TokenStream2, fields: &Fields) -> TokenStream2 {
    let decode = quote! { crate::types::encoding::Decode::decode(input)? };
    match fields {
        Fields::Unit => path,
        Fields::Named(named) => {
            let names = named.named.iter().map(|f| &f.ident);
            quote! { #path { #(#names: #decode),* } }
        }
        Fields::Unnamed(unnamed) => {
            let values = (0..unnamed.unnamed.len()).map(|_| &decode);
            quote! { #path(#(#values),*) }
        }
    }
}

fn discriminants(data: &DataEnum) -> syn::Result<Vec<u8>> {
    let mut tags = Vec::with_capacity(data.variants.len());
    let mut next: u16 = 0;
    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, syn::Expr::Lit(syn::ExprLit {
                lit: syn::Lit::Int(int),
                ..
            }))) => int.base10_parse::<u8>()?,
            Some((_, expr)) => {
                return Err(syn::Error::new_spanned(
                    expr,
                    "discriminant must be an integer literal",
                ));
            }
            None => u8::try_from(next).map_err(|_| {
                syn::Error::new_spanned(&variant.ident, "more than 256 variants")
            })?,
        };
        tags.push(tag);
        next = u16::from(tag) + 1;
    }
    Ok(tags)
}
