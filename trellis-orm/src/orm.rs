//! # Orm Module
//!
//! The owned context every other component works through: the database handle, the
//! metadata and relation registries and the migration cache.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::cascade::{CascadeConfig, CascadeEngine, CascadeOperation, CascadeResult};
use crate::database::{Connection, RawQuery};
use crate::entity::EntityRef;
use crate::lazy::{LazyLoadManager, LazyLoadProxy, RelationValue};
use crate::metadata::{MetadataRegistry, ModelMeta};
use crate::migration::{Migrator, SchemaMigrator};
use crate::model::{Model, ModelDef};
use crate::naming::quote;
use crate::query_builder::Session;
use crate::relation::RelationRegistry;
use crate::value::local_timestamp;
use crate::{preload, Database, Error, Record, Result, Value};

/// Result of [`Orm::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A row was inserted with this id.
    Inserted(i64),
    /// An existing row was updated; the number of rows affected.
    Updated(u64),
}

/// Entry point of Trellis ORM.
///
/// `Orm` is cheap to clone and every clone shares the same registries, migration
/// cache and database handle.
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
/// let orm = Orm::new(db);
/// orm.migrator().register::<Order>().register::<OrderItem>().run().await?;
///
/// let order = EntityRef::new("Order").with("customer", "ada");
/// order.push("items", EntityRef::new("OrderItem").with("sku", "A-1"));
/// let result = orm.cascade_create(&order).await;
/// assert!(result.success);
/// ```
#[derive(Debug, Clone)]
pub struct Orm {
    db: Database,
    metadata: Arc<MetadataRegistry>,
    relations: Arc<RelationRegistry>,
    pub(crate) migrated: Arc<Mutex<HashSet<String>>>,
}

impl Orm {
    pub fn new(db: Database) -> Self {
        let metadata = Arc::new(MetadataRegistry::new());
        Self {
            db,
            relations: Arc::new(RelationRegistry::new(metadata.clone())),
            metadata,
            migrated: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(Database::connect(url).await?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn relations(&self) -> &Arc<RelationRegistry> {
        &self.relations
    }

    pub fn register(&self, def: &ModelDef) -> Arc<ModelMeta> {
        self.metadata.register(def)
    }

    pub fn register_model<T: Model>(&self) -> Arc<ModelMeta> {
        self.metadata.register(&T::definition())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// An unbound session.
    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }

    pub fn table(&self, table: &str) -> Session {
        let mut session = self.session();
        session.table(table);
        session
    }

    pub fn model<T: Model>(&self) -> Session {
        let mut session = self.session();
        session.model::<T>();
        session
    }

    /// A session bound to a registered model by name.
    pub fn session_of(&self, model: &str) -> Session {
        let mut session = self.session();
        session.model_named(model);
        session
    }

    pub fn raw(&self, sql: impl Into<String>) -> RawQuery<'_, Database> {
        self.db.raw(sql)
    }

    // ========================================================================
    // Entity persistence
    // ========================================================================

    fn key_of(&self, entity: &EntityRef) -> Result<(Arc<ModelMeta>, Value)> {
        let meta = self.metadata.get(&entity.model())?;
        let key = entity.get(meta.primary_field());
        Ok((meta, key))
    }

    fn require_key(meta: &ModelMeta, key: Value) -> Result<Value> {
        if key.is_present() {
            Ok(key)
        } else {
            Err(Error::state(format!("`{}` entity has no primary key", meta.name)))
        }
    }

    pub(crate) async fn row_exists(&self, meta: &ModelMeta, key: &Value) -> Result<bool> {
        let sql = format!("SELECT 1 AS found FROM {} WHERE {} = ? LIMIT 1", quote(&meta.table), quote(&meta.primary_key));
        Ok(self.db.fetch_optional(&sql, std::slice::from_ref(key)).await?.is_some())
    }

    /// Inserts the entity, assigns its primary key and reloads the stored row into it.
    pub async fn create(&self, entity: &EntityRef) -> Result<i64> {
        let meta = self.metadata.get(&entity.model())?;
        let id = self.table(&meta.table).insert_entity(entity).await?;
        self.refresh(entity).await?;
        Ok(id)
    }

    /// Reloads the stored row of an entity. Returns `false` when the entity has no key
    /// or the row is gone.
    pub async fn refresh(&self, entity: &EntityRef) -> Result<bool> {
        let (meta, key) = self.key_of(entity)?;
        if !key.is_present() {
            return Ok(false);
        }
        let sql = format!("SELECT * FROM {} WHERE {} = ? LIMIT 1", quote(&meta.table), quote(&meta.primary_key));
        match self.db.fetch_optional(&sql, &[key]).await? {
            Some(row) => {
                entity.merge(meta.to_fields(row));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes every column of the entity to its existing row.
    ///
    /// Fails with a state error when the entity has no primary key and with
    /// [`Error::NotFound`] when no row has it. Update-time columns are stamped.
    pub async fn update_entity(&self, entity: &EntityRef) -> Result<u64> {
        let (meta, key) = self.key_of(entity)?;
        let key = Self::require_key(&meta, key)?;
        if !self.row_exists(&meta, &key).await? {
            return Err(Error::NotFound(format!("`{}` row with key {key}", meta.name)));
        }

        let now = local_timestamp();
        for column in meta.columns.iter().filter(|c| c.auto_update_time) {
            entity.set(column.field.clone(), now.as_str());
        }
        let mut payload = meta.to_columns(&entity.fields());
        payload.remove(&meta.primary_key);
        for column in meta.columns.iter().filter(|c| c.is_generated()) {
            payload.remove(&column.name);
        }
        if payload.is_empty() {
            return Ok(0);
        }

        let assignments = payload.keys().map(|c| format!("{} = ?", quote(c))).collect::<Vec<_>>().join(", ");
        let sql = format!("UPDATE {} SET {assignments} WHERE {} = ?", quote(&meta.table), quote(&meta.primary_key));
        let params: Vec<Value> = payload.into_values().chain(std::iter::once(key)).collect();
        Ok(self.db.execute(&sql, &params).await?.rows_affected)
    }

    /// Upsert: updates the row when the entity's key exists, inserts otherwise.
    pub async fn save(&self, entity: &EntityRef) -> Result<SaveOutcome> {
        let (meta, key) = self.key_of(entity)?;
        if key.is_present() && self.row_exists(&meta, &key).await? {
            return Ok(SaveOutcome::Updated(self.update_entity(entity).await?));
        }
        Ok(SaveOutcome::Inserted(self.create(entity).await?))
    }

    /// Deletes the entity's row by primary key.
    pub async fn delete_entity(&self, entity: &EntityRef) -> Result<u64> {
        let (meta, key) = self.key_of(entity)?;
        let key = Self::require_key(&meta, key)?;
        let sql = format!("DELETE FROM {} WHERE {} = ?", quote(&meta.table), quote(&meta.primary_key));
        Ok(self.db.execute(&sql, &[key]).await?.rows_affected)
    }

    /// Deletes the rows of `model` matching every `field = value` pair of `keys`.
    pub async fn delete_by_key(&self, model: &str, keys: Record) -> Result<u64> {
        if keys.is_empty() {
            return Err(Error::state("delete_by_key needs at least one key"));
        }
        let (names, values): (Vec<String>, Vec<Value>) = keys.into_iter().unzip();
        self.session_of(model).filter(names, values).delete().await
    }

    /// Loads the entity of `model` whose primary key is `key`.
    pub async fn find_by_key(&self, model: &str, key: impl Into<Value>) -> Result<Option<EntityRef>> {
        let meta = self.metadata.get(model)?;
        let key: Value = key.into();
        let mut session = self.session_of(model);
        session.filter(meta.primary_key.as_str(), key).limit(1);
        Ok(session.find_entities(model).await?.into_iter().next())
    }

    // ========================================================================
    // Cascades
    // ========================================================================

    pub fn cascade(&self) -> CascadeEngine {
        CascadeEngine::new(self.clone())
    }

    pub async fn cascade_create(&self, entity: &EntityRef) -> CascadeResult {
        self.cascade().execute(entity, &CascadeConfig::new(CascadeOperation::Create)).await
    }

    pub async fn cascade_update(&self, entity: &EntityRef) -> CascadeResult {
        self.cascade().execute(entity, &CascadeConfig::new(CascadeOperation::Update)).await
    }

    pub async fn cascade_delete(&self, entity: &EntityRef) -> CascadeResult {
        self.cascade().execute(entity, &CascadeConfig::new(CascadeOperation::Delete)).await
    }

    pub async fn cascade_save(&self, entity: &EntityRef) -> CascadeResult {
        self.cascade().execute(entity, &CascadeConfig::new(CascadeOperation::Save)).await
    }

    /// Loads the first row matching `keys` together with every relation that cascades
    /// deletes, then deletes the whole graph.
    pub async fn delete_by_key_cascade(&self, model: &str, keys: Record) -> Result<CascadeResult> {
        let config = CascadeConfig::new(CascadeOperation::Delete);
        let (names, values): (Vec<String>, Vec<Value>) = keys.into_iter().unzip();
        let mut session = self.session_of(model);
        session.filter(names, values).limit(1);
        let entity = session
            .find_entities(model)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("`{model}` row for delete")))?;

        let engine = self.cascade();
        let paths = engine.cascading_paths(model, &config)?;
        preload::attach_paths(self, model, std::slice::from_ref(&entity), &paths).await?;
        Ok(engine.execute(&entity, &config).await)
    }

    // ========================================================================
    // Lazy loading
    // ========================================================================

    pub fn lazy_loader(&self) -> LazyLoadManager {
        LazyLoadManager::new(self.clone())
    }

    /// Wraps an entity for on-demand relation loading; eager relations are loaded now.
    pub async fn enable_lazy_loading(&self, entity: &EntityRef) -> Result<LazyLoadProxy> {
        self.lazy_loader().enable(entity).await
    }

    pub async fn load_relation(&self, proxy: &mut LazyLoadProxy, name: &str, force: bool) -> Result<RelationValue> {
        self.lazy_loader().load_relation(proxy, name, force).await
    }

    pub async fn preload_relation(&self, proxy: &mut LazyLoadProxy, names: &[&str]) -> Result<()> {
        self.lazy_loader().preload_relation(proxy, names).await
    }

    pub async fn reload_relation(&self, proxy: &mut LazyLoadProxy, name: &str) -> Result<RelationValue> {
        self.lazy_loader().reload_relation(proxy, name).await
    }

    // ========================================================================
    // Schema
    // ========================================================================

    pub fn schema(&self) -> SchemaMigrator {
        SchemaMigrator::new(self.clone())
    }

    /// Returns a new Migrator for queuing typed models.
    pub fn migrator(&self) -> Migrator {
        Migrator::new(self.clone())
    }

    /// Creates or evolves the table of `def`. Cached per table unless `force` is set.
    pub async fn auto_migrate(&self, def: &ModelDef, force: bool) -> Result<()> {
        self.schema().auto_migrate(def, force).await
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&self) -> Result<()> {
        self.db.begin().await
    }

    pub async fn commit(&self) -> Result<()> {
        self.db.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.db.rollback().await
    }
}
