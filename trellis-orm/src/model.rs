//! # Model Module
//!
//! Declarative description of persisted types: columns, relations and inheritance.
//! A [`ModelDef`] is either written by hand with the builder methods below or generated
//! by `#[derive(Model)]`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{naming, Record, Result};

// ============================================================================
// Columns
// ============================================================================

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Blob,
}

impl FieldType {
    /// The SQL type emitted in DDL.
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text => "TEXT",
            FieldType::Blob => "BLOB",
        }
    }

    /// Maps a declared SQLite type back onto a storage type using SQLite's affinity rules.
    pub fn from_declared(declared: &str) -> Self {
        let declared = declared.to_ascii_uppercase();
        if declared.contains("INT") {
            FieldType::Integer
        } else if declared.contains("CHAR") || declared.contains("CLOB") || declared.contains("TEXT") {
            FieldType::Text
        } else if declared.is_empty() || declared.contains("BLOB") {
            FieldType::Blob
        } else if declared.contains("REAL") || declared.contains("FLOA") || declared.contains("DOUB") {
            FieldType::Real
        } else if declared.contains("NUM") || declared.contains("DEC") {
            FieldType::Real
        } else {
            // Remaining NUMERIC affinity types, such as BOOLEAN or DATETIME, store integers.
            FieldType::Integer
        }
    }

    /// Zero value used as the `DEFAULT` when a `NOT NULL` column is added to a populated table.
    pub(crate) fn zero_literal(self) -> &'static str {
        match self {
            FieldType::Integer => "0",
            FieldType::Real => "0.0",
            FieldType::Text => "''",
            FieldType::Blob => "X''",
        }
    }
}

/// Metadata information about a persisted field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Logical (field) name.
    pub field: String,
    /// Physical column name in the database.
    pub name: String,
    pub field_type: FieldType,
    pub primary_key: bool,
    pub not_null: bool,
    pub auto_increment: bool,
    /// Stamped with the local time when the row is created.
    pub auto_create_time: bool,
    /// Stamped with the local time whenever the row is updated.
    pub auto_update_time: bool,
}

impl ColumnInfo {
    /// Declares a column whose physical name is the snake_case spelling of `field`.
    pub fn new(field: impl Into<String>, field_type: FieldType) -> Self {
        let field = field.into();
        Self {
            name: naming::snake_case(&field),
            field,
            field_type,
            primary_key: false,
            not_null: false,
            auto_increment: false,
            auto_create_time: false,
            auto_update_time: false,
        }
    }

    pub fn integer(field: impl Into<String>) -> Self {
        Self::new(field, FieldType::Integer)
    }

    pub fn real(field: impl Into<String>) -> Self {
        Self::new(field, FieldType::Real)
    }

    pub fn text(field: impl Into<String>) -> Self {
        Self::new(field, FieldType::Text)
    }

    pub fn blob(field: impl Into<String>) -> Self {
        Self::new(field, FieldType::Blob)
    }

    /// Overrides the physical column name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn create_time(mut self) -> Self {
        self.auto_create_time = true;
        self
    }

    pub fn update_time(mut self) -> Self {
        self.auto_update_time = true;
        self
    }

    pub fn is_timestamp(&self) -> bool {
        self.auto_create_time || self.auto_update_time
    }

    /// Whether the store assigns this column (`INTEGER PRIMARY KEY AUTOINCREMENT`).
    pub fn is_generated(&self) -> bool {
        self.auto_increment && self.primary_key && self.field_type == FieldType::Integer
    }
}

// ============================================================================
// Relations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
    ManyToMany,
}

/// Which write operations propagate along a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeType {
    Create,
    Update,
    Delete,
    All,
}

impl CascadeType {
    /// Parses `create`, `update`, `delete` or `all` (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "create" => Some(CascadeType::Create),
            "update" => Some(CascadeType::Update),
            "delete" => Some(CascadeType::Delete),
            "all" => Some(CascadeType::All),
            _ => None,
        }
    }
}

/// The target side of a relation.
///
/// `Deferred` resolves the target lazily, which lets two types refer to each other.
#[derive(Clone)]
pub enum TargetRef {
    Named(String),
    Deferred(Arc<dyn Fn() -> ModelDef + Send + Sync>),
}

impl TargetRef {
    /// Targets a typed model through its generated definition.
    pub fn of<T: Model + 'static>() -> Self {
        TargetRef::Deferred(Arc::new(T::definition))
    }

    pub fn deferred(resolve: impl Fn() -> ModelDef + Send + Sync + 'static) -> Self {
        TargetRef::Deferred(Arc::new(resolve))
    }
}

impl fmt::Debug for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Named(name) => f.debug_tuple("Named").field(name).finish(),
            TargetRef::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<&str> for TargetRef {
    fn from(name: &str) -> Self {
        TargetRef::Named(name.to_string())
    }
}

impl From<String> for TargetRef {
    fn from(name: String) -> Self {
        TargetRef::Named(name)
    }
}

/// An author-declared relation, before default keys are resolved.
#[derive(Debug, Clone)]
pub struct RelationDecl {
    /// Property name on the owning type.
    pub name: String,
    pub kind: RelationKind,
    pub target: TargetRef,
    pub foreign_key: Option<String>,
    pub local_key: Option<String>,
    pub through: Option<String>,
    pub through_foreign_key: Option<String>,
    pub through_other_key: Option<String>,
    pub cascade: Vec<CascadeType>,
    pub lazy: bool,
}

impl RelationDecl {
    pub fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<TargetRef>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            foreign_key: None,
            local_key: None,
            through: None,
            through_foreign_key: None,
            through_other_key: None,
            cascade: Vec::new(),
            lazy: true,
        }
    }

    pub fn has_one(name: impl Into<String>, target: impl Into<TargetRef>) -> Self {
        Self::new(name, RelationKind::HasOne, target)
    }

    pub fn has_many(name: impl Into<String>, target: impl Into<TargetRef>) -> Self {
        Self::new(name, RelationKind::HasMany, target)
    }

    pub fn belongs_to(name: impl Into<String>, target: impl Into<TargetRef>) -> Self {
        Self::new(name, RelationKind::BelongsTo, target)
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<TargetRef>) -> Self {
        Self::new(name, RelationKind::ManyToMany, target)
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    pub fn local_key(mut self, column: impl Into<String>) -> Self {
        self.local_key = Some(column.into());
        self
    }

    /// Names the join table of a many-to-many relation.
    pub fn through(mut self, table: impl Into<String>) -> Self {
        self.through = Some(table.into());
        self
    }

    /// Names both join-table key columns: the one pointing at this type and the one
    /// pointing at the target.
    pub fn through_keys(mut self, foreign_key: impl Into<String>, other_key: impl Into<String>) -> Self {
        self.through_foreign_key = Some(foreign_key.into());
        self.through_other_key = Some(other_key.into());
        self
    }

    pub fn cascade(mut self, types: impl IntoIterator<Item = CascadeType>) -> Self {
        self.cascade = types.into_iter().collect();
        self
    }

    /// Marks the relation for loading as soon as lazy loading is enabled on an entity.
    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }
}

// ============================================================================
// Model definitions
// ============================================================================

/// Everything the ORM knows about one persisted type.
#[derive(Debug, Clone)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub relations: Vec<RelationDecl>,
    /// Parent definition whose columns and relations are inherited.
    pub extends: Option<fn() -> ModelDef>,
}

impl ModelDef {
    /// Starts a definition; the table defaults to the snake_case type name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { table: naming::snake_case(&name), name, columns: Vec::new(), relations: Vec::new(), extends: None }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, relation: RelationDecl) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn extends(mut self, parent: fn() -> ModelDef) -> Self {
        self.extends = Some(parent);
        self
    }

    /// The inheritance chain, root ancestor first and `self` last.
    fn lineage(&self) -> Vec<ModelDef> {
        let mut chain = vec![self.clone()];
        let mut parent = self.extends;
        while let Some(resolve) = parent {
            let def = resolve();
            // A definition that names itself as parent would loop forever.
            if chain.iter().any(|seen| seen.name == def.name) {
                break;
            }
            parent = def.extends;
            chain.push(def);
        }
        chain.reverse();
        chain
    }

    /// Declared columns merged across the inheritance chain, ancestors first.
    pub fn resolved_columns(&self) -> Vec<ColumnInfo> {
        self.lineage().into_iter().flat_map(|def| def.columns).collect()
    }

    /// Declared relations merged across the inheritance chain, ancestors first.
    pub fn resolved_relations(&self) -> Vec<RelationDecl> {
        self.lineage().into_iter().flat_map(|def| def.relations).collect()
    }
}

// ============================================================================
// Typed models
// ============================================================================

/// A Rust type persisted through the ORM.
///
/// This trait is typically implemented automatically via the `#[derive(Model)]` macro.
///
/// # Example
///
/// ```rust,ignore
/// use trellis_orm::Model;
///
/// #[derive(Model)]
/// #[orm(table = "orders")]
/// #[orm(has_many(name = "items", target = OrderItem, foreign_key = "order_id", cascade = "all"))]
/// struct Order {
///     #[orm(primary_key, auto_increment)]
///     id: Option<i64>,
///     customer: String,
/// }
/// ```
pub trait Model: Sized {
    fn definition() -> ModelDef;

    /// Converts the instance into a map keyed by logical field names.
    fn to_record(&self) -> Record;

    /// Builds an instance from a map keyed by logical field names.
    fn from_record(record: &Record) -> Result<Self>;

    fn model_name() -> String {
        Self::definition().name
    }

    fn table_name() -> String {
        Self::definition().table
    }

    fn columns() -> Vec<ColumnInfo> {
        Self::definition().resolved_columns()
    }
}
