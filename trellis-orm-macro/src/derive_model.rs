use heck::ToSnakeCase;
use proc_macro2::{Span, TokenStream};
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::meta::ParseNestedMeta;
use syn::spanned::Spanned;
use syn::{Data, DeriveInput, Fields, LitBool, LitStr, Path};

use crate::types::rust_type_to_storage;

/// Expands the `#[derive(Model)]` macro.
///
/// This function parses the struct and its `#[orm(...)]` attributes to generate:
/// 1. `definition()`: the `ModelDef` with columns, relations and the base model.
/// 2. `to_record()` / `from_record()`: conversion between the struct and a `Record`.
pub fn expand(ast: DeriveInput) -> syn::Result<TokenStream> {
    let struct_name = &ast.ident;
    let model_name = struct_name.unraw().to_string();

    let fields = match &ast.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => return Err(syn::Error::new_spanned(struct_name, "Model must have named fields")),
        },
        _ => return Err(syn::Error::new_spanned(struct_name, "Model must be a struct")),
    };

    // Struct attributes: #[orm(table = "...", has_many(...), ...)]
    let mut table = None;
    let mut relations = Vec::new();
    for attr in ast.attrs.iter().filter(|a| a.path().is_ident("orm")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                table = Some(meta.value()?.parse::<LitStr>()?.value());
                return Ok(());
            }
            let kind = ["has_one", "has_many", "belongs_to", "many_to_many"]
                .into_iter()
                .find(|kind| meta.path.is_ident(kind))
                .ok_or_else(|| meta.error("expected `table`, `has_one`, `has_many`, `belongs_to` or `many_to_many`"))?;
            let mut relation = RelationAttr::new(kind, meta.path.span());
            meta.parse_nested_meta(|inner| relation.parse(inner))?;
            relations.push(relation.to_tokens()?);
            Ok(())
        })?;
    }

    let mut columns = Vec::new();
    let mut base = None;
    let mut to_record = Vec::new();
    let mut from_record = Vec::new();

    for field in fields {
        let ident = field.ident.as_ref().ok_or_else(|| syn::Error::new_spanned(field, "unnamed field"))?;
        let ty = &field.ty;
        let name = ident.unraw().to_string();

        let mut attrs = FieldAttr::default();
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("orm")) {
            attr.parse_nested_meta(|meta| attrs.parse(meta))?;
        }

        if attrs.skip {
            from_record.push(quote! { #ident: ::core::default::Default::default() });
            continue;
        }

        if attrs.base {
            if base.is_some() {
                return Err(syn::Error::new_spanned(ident, "a model can have only one `base` field"));
            }
            base = Some(quote! { .extends(<#ty as ::trellis_orm::Model>::definition) });
            to_record.push(quote! {
                record.extend(::trellis_orm::Model::to_record(&self.#ident));
            });
            from_record.push(quote! {
                #ident: <#ty as ::trellis_orm::Model>::from_record(record)?
            });
            continue;
        }

        let (storage, nullable) = rust_type_to_storage(ty);
        let storage = format_ident!("{}", attrs.storage.as_deref().unwrap_or(storage));
        let column_name = attrs.column.clone().unwrap_or_else(|| name.to_snake_case());

        let mut column = quote! { ::trellis_orm::ColumnInfo::new(#name, ::trellis_orm::FieldType::#storage) };
        if let Some(explicit) = &attrs.column {
            column = quote! { #column.column(#explicit) };
        }
        if attrs.primary_key {
            column = quote! { #column.primary_key() };
        }
        if attrs.auto_increment {
            column = quote! { #column.auto_increment() };
        }
        if attrs.not_null || (!nullable && !attrs.primary_key) {
            column = quote! { #column.not_null() };
        }
        if attrs.create_time {
            column = quote! { #column.create_time() };
        }
        if attrs.update_time {
            column = quote! { #column.update_time() };
        }
        columns.push(column);

        to_record.push(quote! {
            record.insert(#name.to_string(), ::trellis_orm::ToValue::to_value(&self.#ident));
        });
        from_record.push(quote! {
            #ident: {
                let value = record.get(#name).or_else(|| record.get(#column_name)).cloned().unwrap_or_default();
                <#ty as ::trellis_orm::FromValue>::from_value(value)
                    .map_err(|message| ::trellis_orm::Error::Decode { field: #name.to_string(), message })?
            }
        });
    }

    let table = table.map(|table| quote! { .table(#table) });
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::trellis_orm::Model for #struct_name #ty_generics #where_clause {
            fn definition() -> ::trellis_orm::ModelDef {
                ::trellis_orm::ModelDef::new(#model_name)
                    #table
                    #base
                    #(.column(#columns))*
                    #(.relation(#relations))*
            }

            fn to_record(&self) -> ::trellis_orm::Record {
                let mut record = ::trellis_orm::Record::new();
                #(#to_record)*
                record
            }

            fn from_record(record: &::trellis_orm::Record) -> ::trellis_orm::Result<Self> {
                Ok(Self {
                    #(#from_record),*
                })
            }
        }
    })
}

/// Field attributes: `#[orm(primary_key, auto_increment, column = "...", ...)]`.
#[derive(Default)]
struct FieldAttr {
    primary_key: bool,
    auto_increment: bool,
    not_null: bool,
    create_time: bool,
    update_time: bool,
    column: Option<String>,
    storage: Option<String>,
    skip: bool,
    base: bool,
}

impl FieldAttr {
    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("primary_key") {
            self.primary_key = true;
        } else if meta.path.is_ident("auto_increment") {
            self.auto_increment = true;
        } else if meta.path.is_ident("not_null") {
            self.not_null = true;
        } else if meta.path.is_ident("create_time") {
            self.create_time = true;
        } else if meta.path.is_ident("update_time") {
            self.update_time = true;
        } else if meta.path.is_ident("column") {
            self.column = Some(meta.value()?.parse::<LitStr>()?.value());
        } else if meta.path.is_ident("storage") {
            let value: LitStr = meta.value()?.parse()?;
            let storage = match value.value().to_ascii_lowercase().as_str() {
                "integer" => "Integer",
                "real" => "Real",
                "text" => "Text",
                "blob" => "Blob",
                _ => return Err(syn::Error::new_spanned(value, "expected `integer`, `real`, `text` or `blob`")),
            };
            self.storage = Some(storage.to_string());
        } else if meta.path.is_ident("skip") {
            self.skip = true;
        } else if meta.path.is_ident("base") {
            self.base = true;
        } else {
            return Err(meta.error("unsupported orm field attribute"));
        }
        Ok(())
    }
}

/// One relation declared on the struct, e.g.
/// `#[orm(has_many(name = "items", target = OrderItem, foreign_key = "order_id", cascade = "all"))]`.
struct RelationAttr {
    kind: &'static str,
    span: Span,
    name: Option<String>,
    target: Option<Path>,
    target_name: Option<String>,
    foreign_key: Option<String>,
    local_key: Option<String>,
    through: Option<String>,
    through_foreign_key: Option<String>,
    through_other_key: Option<String>,
    cascade: Vec<String>,
    eager: bool,
}

impl RelationAttr {
    fn new(kind: &'static str, span: Span) -> Self {
        Self {
            kind,
            span,
            name: None,
            target: None,
            target_name: None,
            foreign_key: None,
            local_key: None,
            through: None,
            through_foreign_key: None,
            through_other_key: None,
            cascade: Vec::new(),
            eager: false,
        }
    }

    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("name") {
            self.name = Some(lit_string(&meta)?);
        } else if meta.path.is_ident("target") {
            let value = meta.value()?;
            if value.peek(LitStr) {
                self.target_name = Some(value.parse::<LitStr>()?.value());
            } else {
                self.target = Some(value.parse::<Path>()?);
            }
        } else if meta.path.is_ident("foreign_key") {
            self.foreign_key = Some(lit_string(&meta)?);
        } else if meta.path.is_ident("local_key") {
            self.local_key = Some(lit_string(&meta)?);
        } else if meta.path.is_ident("through") {
            self.through = Some(lit_string(&meta)?);
        } else if meta.path.is_ident("through_foreign_key") {
            self.through_foreign_key = Some(lit_string(&meta)?);
        } else if meta.path.is_ident("through_other_key") {
            self.through_other_key = Some(lit_string(&meta)?);
        } else if meta.path.is_ident("cascade") {
            let value: LitStr = meta.value()?.parse()?;
            for part in value.value().split(',').map(str::trim).filter(|p| !p.is_empty()) {
                if !matches!(part, "create" | "update" | "delete" | "all") {
                    return Err(syn::Error::new_spanned(&value, format!("unknown cascade type `{part}`")));
                }
                self.cascade.push(part.to_string());
            }
        } else if meta.path.is_ident("lazy") {
            self.eager = !meta.value()?.parse::<LitBool>()?.value;
        } else if meta.path.is_ident("eager") {
            self.eager = true;
        } else {
            return Err(meta.error("unsupported relation attribute"));
        }
        Ok(())
    }

    fn to_tokens(&self) -> syn::Result<TokenStream> {
        let (target, default_name) = match (&self.target, &self.target_name) {
            (Some(path), _) => {
                let last = path.segments.last().map(|s| s.ident.unraw().to_string()).unwrap_or_default();
                (quote! { ::trellis_orm::TargetRef::of::<#path>() }, last.to_snake_case())
            }
            (None, Some(name)) => (quote! { ::trellis_orm::TargetRef::from(#name) }, name.to_snake_case()),
            (None, None) => return Err(syn::Error::new(self.span, "relation needs a `target`")),
        };
        let name = self.name.clone().unwrap_or_else(|| match self.kind {
            "has_many" | "many_to_many" => format!("{default_name}s"),
            _ => default_name,
        });

        let constructor = format_ident!("{}", self.kind);
        let mut tokens = quote! { ::trellis_orm::RelationDecl::#constructor(#name, #target) };
        if let Some(key) = &self.foreign_key {
            tokens = quote! { #tokens.foreign_key(#key) };
        }
        if let Some(key) = &self.local_key {
            tokens = quote! { #tokens.local_key(#key) };
        }
        if let Some(table) = &self.through {
            tokens = quote! { #tokens.through(#table) };
        }
        match (&self.through_foreign_key, &self.through_other_key) {
            (Some(fk), Some(ok)) => tokens = quote! { #tokens.through_keys(#fk, #ok) },
            (None, None) => {}
            _ => {
                return Err(syn::Error::new(
                    self.span,
                    "`through_foreign_key` and `through_other_key` must be given together",
                ));
            }
        }
        if !self.cascade.is_empty() {
            let types = self.cascade.iter().map(|part| {
                let variant = match part.as_str() {
                    "create" => format_ident!("Create"),
                    "update" => format_ident!("Update"),
                    "delete" => format_ident!("Delete"),
                    _ => format_ident!("All"),
                };
                quote! { ::trellis_orm::CascadeType::#variant }
            });
            tokens = quote! { #tokens.cascade([#(#types),*]) };
        }
        if self.eager {
            tokens = quote! { #tokens.eager() };
        }
        Ok(tokens)
    }
}

fn lit_string(meta: &ParseNestedMeta) -> syn::Result<String> {
    Ok(meta.value()?.parse::<LitStr>()?.value())
}
