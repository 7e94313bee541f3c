//! # Spec Builder Derive
//!
//! This crate provides a derive macro for building test-case templates
//! in code with chained, converting setters.

use proc_macro::TokenStream;
use quote::{ToTokens, format_ident, quote};
use syn::{Data, DeriveInput, Field, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate `.set_<field>(&mut self, value: impl Into<Ty>) -> &mut Self`
/// and `.with_<field>(mut self, value: impl Into<Ty>) -> Self` for each **named** field.
///
/// The `Into` bound lets a spec field of type `Choice<u64>` take a bare `u64`,
/// or an `Option<T>` field take a bare `T`.
///
/// - Skipping a field: `#[spec(skip)]`
///
/// # Example
///
/// ```
/// use utils_spec_derive::SpecBuilder;
///
/// #[derive(Default, SpecBuilder)]
/// struct Request {
///     repeats: u32,
///     va: Option<u64>,
///     #[spec(skip)]
///     ordinal: usize,
/// }
///
/// let mut r = Request::default().with_va(0x1000_u64);
/// r.set_repeats(4_u32).set_repeats(5_u8);
/// assert_eq!(r.va, Some(0x1000));
/// assert_eq!(r.repeats, 5);
/// assert_eq!(r.ordinal, 0);
/// ```
#[proc_macro_derive(SpecBuilder, attributes(spec))]
pub fn derive_spec_builder(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let ident = &input.ident;

    let fields = match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => &named.named,
            other => {
                return syn::Error::new(
                    other.span(),
                    "SpecBuilder needs named fields to derive setters from",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "SpecBuilder can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let mut methods = Vec::with_capacity(fields.len());
    for field in fields {
        match is_skipped(field) {
            Ok(true) => {}
            Ok(false) => methods.extend(setters(field)),
            Err(e) => return e.to_compile_error().into(),
        }
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    }
    .into()
}

/// The `set_` and `with_` pair of one field.
fn setters(field: &Field) -> Option<impl ToTokens> {
    let name = field.ident.as_ref()?;
    let ty = &field.ty;
    let set_name = format_ident!("set_{}", name);
    let with_name = format_ident!("with_{}", name);
    let set_doc = format!("Set `{name}` in place.");
    let with_doc = format!("Return `self` with `{name}` replaced.");

    Some(quote! {
        #[doc = #set_doc]
        #[inline]
        pub fn #set_name(&mut self, value: impl ::core::convert::Into<#ty>) -> &mut Self {
            self.#name = value.into();
            self
        }

        #[doc = #with_doc]
        #[inline]
        #[must_use]
        pub fn #with_name(mut self, value: impl ::core::convert::Into<#ty>) -> Self {
            self.#name = value.into();
            self
        }
    })
}

/// `#[spec(skip)]` or `#[spec(skip = true)]`.
fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("spec")) {
        attr.parse_nested_meta(|meta| {
            if !meta.path.is_ident("skip") {
                return Err(meta.error("unknown spec attribute"));
            }
            skip |= meta.input.is_empty() || meta.value()?.parse::<LitBool>()?.value;
            Ok(())
        })?;
    }
    Ok(skip)
}
