//! # Migration Module
//!
//! Schema provisioning for registered models.
//!
//! [`SchemaMigrator`] creates and evolves one table at a time: missing tables are created,
//! missing columns added, and columns whose declared type changed are rebuilt through a
//! temporary table. Many-to-many join tables are created the first time a relation needs
//! them. [`Migrator`] queues several models and migrates them in dependency-safe order.

use std::sync::PoisonError;

use futures::future::BoxFuture;

use crate::database::{Connection, TableColumn};
use crate::metadata::ModelMeta;
use crate::model::{ColumnInfo, FieldType, Model, ModelDef, RelationKind, TargetRef};
use crate::naming::quote;
use crate::relation::JoinTable;
use crate::value::local_timestamp;
use crate::{Orm, Result, Value};

const LOCAL_NOW_DEFAULT: &str = "DEFAULT (DATETIME('now','localtime'))";

// ============================================================================
// SchemaMigrator
// ============================================================================

/// Creates and evolves the tables of registered models.
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    orm: Orm,
}

impl SchemaMigrator {
    pub fn new(orm: Orm) -> Self {
        Self { orm }
    }

    /// Brings the table of `def` in line with its declaration.
    ///
    /// A missing table is created; an existing one gets its missing columns added and
    /// retyped columns rebuilt. Columns are never dropped here. Each table is migrated once
    /// per [`Orm`]; later calls issue no statement unless `force` is set.
    pub async fn auto_migrate(&self, def: &ModelDef, force: bool) -> Result<()> {
        let meta = self.orm.register(def);
        if !force && self.is_migrated(&meta.table) {
            return Ok(());
        }

        if self.has_table(&meta.table).await? {
            self.add_column(def).await?;
            self.alter_column(def).await?;
            self.ensure_join_tables(&meta).await?;
        } else {
            self.create_table(def).await?;
        }

        self.orm.migrated.lock().unwrap_or_else(PoisonError::into_inner).insert(meta.table.clone());
        Ok(())
    }

    fn is_migrated(&self, table: &str) -> bool {
        self.orm.migrated.lock().unwrap_or_else(PoisonError::into_inner).contains(table)
    }

    /// Creates the table of `def` and its join tables. Returns `false` when the table
    /// already existed, in which case nothing is changed.
    pub async fn create_table(&self, def: &ModelDef) -> Result<bool> {
        let meta = self.orm.register(def);
        if self.has_table(&meta.table).await? {
            return Ok(false);
        }

        let columns = meta.columns.iter().map(column_sql).collect::<Vec<_>>().join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({columns})", quote(&meta.table));
        self.orm.database().execute(&sql, &[]).await?;
        log::info!("created table `{}` for model `{}`", meta.table, meta.name);

        self.ensure_join_tables(&meta).await?;
        Ok(true)
    }

    /// Adds every declared column missing from the physical table. Returns the names of
    /// the columns added.
    ///
    /// Primary keys cannot be added after the fact and are skipped. `NOT NULL` columns get
    /// a zero default so existing rows stay valid. Timestamp columns are added without a
    /// default and backfilled with the current local time.
    pub async fn add_column(&self, def: &ModelDef) -> Result<Vec<String>> {
        let meta = self.orm.register(def);
        let existing = self.table_info(&meta.table).await?;
        let db = self.orm.database();
        let mut added = Vec::new();

        for column in &meta.columns {
            if column.primary_key || existing.iter().any(|c| c.name == column.name) {
                continue;
            }
            let mut sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote(&meta.table),
                quote(&column.name),
                column.field_type.sql_type()
            );
            if column.is_timestamp() {
                db.execute(&sql, &[]).await?;
                let backfill = format!(
                    "UPDATE {} SET {col} = ? WHERE {col} IS NULL",
                    quote(&meta.table),
                    col = quote(&column.name)
                );
                db.execute(&backfill, &[Value::from(local_timestamp())]).await?;
            } else {
                if column.not_null {
                    sql.push_str(" NOT NULL DEFAULT ");
                    sql.push_str(column.field_type.zero_literal());
                }
                db.execute(&sql, &[]).await?;
            }
            log::info!("added column `{}.{}`", meta.table, column.name);
            added.push(column.name.clone());
        }
        Ok(added)
    }

    /// Drops physical columns that are no longer declared. Returns the names dropped.
    pub async fn drop_column(&self, def: &ModelDef) -> Result<Vec<String>> {
        let meta = self.orm.register(def);
        let mut dropped = Vec::new();
        for column in self.table_info(&meta.table).await? {
            if meta.has_column(&column.name) {
                continue;
            }
            let sql = format!("ALTER TABLE {} DROP COLUMN {}", quote(&meta.table), quote(&column.name));
            self.orm.database().execute(&sql, &[]).await?;
            log::info!("dropped column `{}.{}`", meta.table, column.name);
            dropped.push(column.name);
        }
        Ok(dropped)
    }

    /// Rebuilds the table when a declared column type differs from the physical one.
    ///
    /// Rows are copied into `temp_<table>` casting each declared column to its new type,
    /// then the original is dropped and the copy renamed into place. Undeclared physical
    /// columns are carried over unchanged. Returns whether a rebuild happened.
    pub async fn alter_column(&self, def: &ModelDef) -> Result<bool> {
        let meta = self.orm.register(def);
        let physical = self.table_info(&meta.table).await?;

        let changed: Vec<&ColumnInfo> = meta
            .columns
            .iter()
            .filter(|column| {
                physical
                    .iter()
                    .find(|p| p.name == column.name)
                    .is_some_and(|p| FieldType::from_declared(&p.declared_type) != column.field_type)
            })
            .collect();
        if changed.is_empty() {
            return Ok(false);
        }
        for column in &changed {
            log::info!("column `{}.{}` changes type to {}", meta.table, column.name, column.field_type.sql_type());
        }

        let db = self.orm.database();
        let opened = db.begin_if_idle().await?;
        let outcome = self.rebuild(&meta, &physical).await;
        db.finish(opened, outcome).await?;
        Ok(true)
    }

    async fn rebuild(&self, meta: &ModelMeta, physical: &[TableColumn]) -> Result<()> {
        let db = self.orm.database();
        let temp = format!("temp_{}", meta.table);

        let mut definitions = Vec::new();
        let mut targets = Vec::new();
        let mut sources = Vec::new();
        for column in &meta.columns {
            definitions.push(column_sql(column));
            if physical.iter().any(|p| p.name == column.name) {
                targets.push(quote(&column.name));
                sources.push(format!("CAST({} AS {})", quote(&column.name), column.field_type.sql_type()));
            }
        }
        for extra in physical.iter().filter(|p| !meta.has_column(&p.name)) {
            definitions.push(format!("{} {}", quote(&extra.name), extra.declared_type).trim_end().to_string());
            targets.push(quote(&extra.name));
            sources.push(quote(&extra.name));
        }

        db.execute(&format!("DROP TABLE IF EXISTS {}", quote(&temp)), &[]).await?;
        db.execute(&format!("CREATE TABLE {} ({})", quote(&temp), definitions.join(", ")), &[]).await?;
        let copy = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote(&temp),
            targets.join(", "),
            sources.join(", "),
            quote(&meta.table)
        );
        let copied = db.execute(&copy, &[]).await?.rows_affected;
        self.drop_table(&meta.table).await?;
        self.rename_table(&temp, &meta.table).await?;
        log::info!("rebuilt table `{}` ({copied} rows copied)", meta.table);
        Ok(())
    }

    /// Creates the join table of every many-to-many relation of `meta` whose target is
    /// known. Relations to models not yet registered are left for a later pass.
    async fn ensure_join_tables(&self, meta: &ModelMeta) -> Result<()> {
        for relation in meta.relations.iter().filter(|r| r.kind == RelationKind::ManyToMany) {
            if let TargetRef::Named(target) = &relation.target {
                if !self.orm.metadata().contains(target) {
                    log::debug!("join table of `{}.{}` waits for `{target}`", meta.name, relation.name);
                    continue;
                }
            }
            let mapping = self.orm.relations().resolve(&meta.name, &relation.name)?;
            self.create_join_table(mapping.join_table()?).await?;
        }
        Ok(())
    }

    async fn create_join_table(&self, join: &JoinTable) -> Result<bool> {
        if self.has_table(&join.table).await? {
            return Ok(false);
        }
        let db = self.orm.database();
        let (table, fk, ok) = (quote(&join.table), quote(&join.foreign_key), quote(&join.other_key));
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, {fk} INTEGER NOT NULL, \
             {ok} INTEGER NOT NULL, \"created_at\" DATETIME DEFAULT CURRENT_TIMESTAMP, UNIQUE({fk}, {ok}))"
        );
        db.execute(&sql, &[]).await?;
        for key in [&join.foreign_key, &join.other_key] {
            let index = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {table} ({})",
                quote(&format!("idx_{}_{key}", join.table)),
                quote(key)
            );
            db.execute(&index, &[]).await?;
        }
        log::info!("created join table `{}`", join.table);
        Ok(true)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub async fn has_table(&self, table: &str) -> Result<bool> {
        self.orm.database().table_exists(table).await
    }

    pub async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self.table_info(table).await?.iter().any(|c| c.name == column))
    }

    /// Physical columns of `table`; empty when the table does not exist.
    pub async fn table_info(&self, table: &str) -> Result<Vec<TableColumn>> {
        self.orm.database().table_columns(table).await
    }

    pub async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let sql = format!("ALTER TABLE {} RENAME TO {}", quote(from), quote(to));
        self.orm.database().execute(&sql, &[]).await?;
        self.forget(from);
        Ok(())
    }

    pub async fn drop_table(&self, table: &str) -> Result<()> {
        self.orm.database().execute(&format!("DROP TABLE IF EXISTS {}", quote(table)), &[]).await?;
        self.forget(table);
        Ok(())
    }

    fn forget(&self, table: &str) {
        self.orm.migrated.lock().unwrap_or_else(PoisonError::into_inner).remove(table);
    }
}

/// Column definition used in `CREATE TABLE`.
fn column_sql(column: &ColumnInfo) -> String {
    let mut sql = format!("{} {}", quote(&column.name), column.field_type.sql_type());
    if column.primary_key {
        sql.push_str(" PRIMARY KEY");
        if column.is_generated() {
            sql.push_str(" AUTOINCREMENT");
        }
    } else if column.not_null {
        sql.push_str(" NOT NULL");
    }
    if column.is_timestamp() && column.field_type == FieldType::Text {
        sql.push(' ');
        sql.push_str(LOCAL_NOW_DEFAULT);
    }
    sql
}

// ============================================================================
// Migrator
// ============================================================================

/// Type alias for migration tasks (table creation or join table provisioning).
pub type MigrationTask = Box<dyn Fn(SchemaMigrator) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Queue of models to migrate together.
///
/// Every queued model is registered before anything runs, so relations between queued
/// models resolve regardless of order. Tables are migrated first, join tables last.
pub struct Migrator {
    schema: SchemaMigrator,
    tasks: Vec<MigrationTask>,
    join_tasks: Vec<MigrationTask>,
}

impl Migrator {
    pub fn new(orm: Orm) -> Self {
        Self { schema: SchemaMigrator::new(orm), tasks: Vec::new(), join_tasks: Vec::new() }
    }

    /// Queues a typed model.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// orm.migrator()
    ///     .register::<Order>()
    ///     .register::<OrderItem>()
    ///     .run()
    ///     .await?;
    /// ```
    pub fn register<T: Model + 'static>(self) -> Self {
        self.register_def(T::definition)
    }

    /// Queues a model given by its definition function.
    pub fn register_def(mut self, definition: fn() -> ModelDef) -> Self {
        self.schema.orm.register(&definition());

        let task: MigrationTask = Box::new(move |schema: SchemaMigrator| -> BoxFuture<'static, Result<()>> {
            Box::pin(async move { schema.auto_migrate(&definition(), false).await })
        });
        let join_task: MigrationTask = Box::new(move |schema: SchemaMigrator| -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                let meta = schema.orm.register(&definition());
                schema.ensure_join_tables(&meta).await
            })
        });
        self.tasks.push(task);
        self.join_tasks.push(join_task);
        self
    }

    /// Runs every queued task: all tables first, then all join tables.
    pub async fn run(self) -> Result<()> {
        let queued = self.tasks.len();
        for task in &self.tasks {
            (task)(self.schema.clone()).await?;
        }
        for task in &self.join_tasks {
            (task)(self.schema.clone()).await?;
        }
        log::info!("migrated {queued} models");
        Ok(())
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator").field("queued", &self.tasks.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_definitions() {
        let id = ColumnInfo::integer("id").primary_key().auto_increment();
        assert_eq!(column_sql(&id), "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT");

        let name = ColumnInfo::text("name").not_null();
        assert_eq!(column_sql(&name), "\"name\" TEXT NOT NULL");

        let created = ColumnInfo::text("createdAt").create_time();
        assert_eq!(column_sql(&created), "\"created_at\" TEXT DEFAULT (DATETIME('now','localtime'))");
    }

    #[test]
    fn text_primary_key_is_not_autoincrement() {
        let code = ColumnInfo::text("code").primary_key().auto_increment();
        assert_eq!(column_sql(&code), "\"code\" TEXT PRIMARY KEY");
    }
}
