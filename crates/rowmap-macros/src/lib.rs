//! Procedural macros for rowmap.
//!
//! `#[derive(Record)]` generates the `rowmap::Record` implementation for a
//! struct with named fields:
//!
//! - every `pub` field becomes a column whose name is the field name in
//!   snake_case;
//! - `#[rowmap(tags = "noupd,secret")]` attaches tags;
//! - `#[rowmap(skip)]` leaves a field out entirely;
//! - `#[rowmap(embed)]` flattens a nested record (`S`, `Box<S>`, `Option<S>`
//!   or `Option<Box<S>>`) into the parent.
//!
//! Non-`pub` fields are not mapped.

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod record_derive;

#[proc_macro_derive(Record, attributes(rowmap))]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match record_derive::parse_record(&input) {
        Ok(def) => record_derive::generate_record_impl(&def).into(),
        Err(err) => err.to_compile_error().into(),
    }
}
