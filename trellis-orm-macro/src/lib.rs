//! # Trellis ORM Macros
//!
//! Procedural macros for `trellis-orm`.
//!
//! `#[derive(Model)]` implements `trellis_orm::Model` for a struct with named fields.
//!
//! Struct attributes:
//! - `#[orm(table = "orders")]`: table name (defaults to the snake_case struct name).
//! - `#[orm(has_one(..))]`, `has_many(..)`, `belongs_to(..)`, `many_to_many(..)`: relations,
//!   with `name`, `target` (a model type or a registered model name), `foreign_key`,
//!   `local_key`, `through`, `through_foreign_key`, `through_other_key`,
//!   `cascade = "create,update,delete"` or `"all"`, and `lazy = false` / `eager`.
//!
//! Field attributes: `primary_key`, `auto_increment`, `not_null`, `create_time`,
//! `update_time`, `column = "..."`, `storage = "integer" | "real" | "text" | "blob"`, `skip`
//! and `base` (embeds another model whose columns come first).

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod derive_model;
mod types;

#[proc_macro_derive(Model, attributes(orm))]
pub fn model_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    derive_model::expand(ast).unwrap_or_else(syn::Error::into_compile_error).into()
}
