//! # Trellis ORM
//!
//! An embedded, relation-aware ORM for SQLite built on top of `sqlx`.
//!
//! Models are declared with [`ModelDef`] builders or `#[derive(Model)]`, registered in a
//! [`MetadataRegistry`] and provisioned by the [`SchemaMigrator`]. Rows are read and
//! written through chainable [`Session`]s, graphs of [`EntityRef`]s are persisted with the
//! [`CascadeEngine`], and relations are loaded on demand ([`LazyLoadManager`]) or in
//! batches ([`Session::with`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_orm::{Database, Orm, Model};
//!
//! #[derive(Model, Debug, Clone, Default)]
//! #[orm(table = "orders", has_many(name = "items", target = OrderItem, foreign_key = "order_id", cascade = "all"))]
//! struct Order {
//!     #[orm(primary_key, auto_increment)]
//!     id: Option<i64>,
//!     customer: String,
//! }
//!
//! let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
//! let orm = Orm::new(db);
//! orm.migrator().register::<Order>().register::<OrderItem>().run().await?;
//! ```

pub mod cascade;
pub mod database;
pub mod entity;
pub mod error;
pub mod lazy;
pub mod metadata;
pub mod migration;
pub mod model;
pub mod naming;
pub mod orm;
pub mod pagination;
pub mod predicate;
pub mod preload;
pub mod query_builder;
pub mod relation;
pub mod transaction;
pub mod value;

pub use trellis_orm_macro::Model;

pub use cascade::{
    CascadeConfig, CascadeContext, CascadeEngine, CascadeError, CascadeOperation, CascadeResult, CascadeStats,
};
pub use database::{Connection, Database, DatabaseBuilder, ExecOutcome, RawQuery, TableColumn};
pub use entity::{Entity, EntityRef, Related};
pub use error::{Error, Result};
pub use lazy::{LazyLoadManager, LazyLoadProxy, RelationValue};
pub use metadata::{MetadataRegistry, ModelMeta, RegistryStats};
pub use migration::{Migrator, SchemaMigrator};
pub use model::{CascadeType, ColumnInfo, FieldType, Model, ModelDef, RelationDecl, RelationKind, TargetRef};
pub use orm::{Orm, SaveOutcome};
pub use pagination::{Paginated, Pagination};
pub use predicate::{Keys, Operand};
pub use query_builder::Session;
pub use relation::{JoinTable, RelationMapping, RelationRegistry};
pub use value::{FromValue, Record, ToValue, Value};
