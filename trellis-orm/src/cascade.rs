//! # Cascade Module
//!
//! Recursive create/update/delete/save across an entity graph.
//!
//! One call walks the graph from a root entity, bounded by `max_depth` and by an
//! identity-keyed visited set, inside a single transaction when enabled. Failures on a
//! related entity are collected into the result and the walk continues with its
//! siblings; a failure of the root entity itself aborts the call and rolls back.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Connection;
use crate::entity::EntityRef;
use crate::metadata::ModelMeta;
use crate::model::{CascadeType, RelationKind};
use crate::naming::quote;
use crate::relation::{JoinTable, RelationMapping};
use crate::{Error, Orm, Result, Value};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeOperation {
    Create,
    Update,
    Delete,
    /// Insert or update depending on whether the row exists.
    Save,
}

impl CascadeOperation {
    /// Relation cascade types that let this operation through.
    pub fn cascade_types(self) -> &'static [CascadeType] {
        match self {
            CascadeOperation::Create => &[CascadeType::Create],
            CascadeOperation::Update => &[CascadeType::Update],
            CascadeOperation::Delete => &[CascadeType::Delete],
            CascadeOperation::Save => &[CascadeType::Create, CascadeType::Update],
        }
    }
}

/// Settings of one cascade call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub operation: CascadeOperation,
    /// Cascade types this call is allowed to follow.
    pub cascade_types: Vec<CascadeType>,
    pub max_depth: usize,
    pub transaction_enabled: bool,
    pub rollback_on_error: bool,
    /// Number of related entities processed per logged batch.
    pub batch_size: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self::new(CascadeOperation::Save)
    }
}

impl CascadeConfig {
    pub fn new(operation: CascadeOperation) -> Self {
        Self {
            operation,
            cascade_types: vec![CascadeType::All],
            max_depth: 5,
            transaction_enabled: true,
            rollback_on_error: true,
            batch_size: 100,
        }
    }

    pub fn cascade_types(mut self, types: impl IntoIterator<Item = CascadeType>) -> Self {
        self.cascade_types = types.into_iter().collect();
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn transaction(mut self, enabled: bool) -> Self {
        self.transaction_enabled = enabled;
        self
    }

    pub fn rollback_on_error(mut self, enabled: bool) -> Self {
        self.rollback_on_error = enabled;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    fn permits(&self, types: &[CascadeType]) -> bool {
        self.cascade_types.contains(&CascadeType::All) || types.iter().any(|t| self.cascade_types.contains(t))
    }

    fn follows(&self, mapping: &RelationMapping) -> bool {
        let types = self.operation.cascade_types();
        mapping.cascades_any(types) && self.permits(types)
    }
}

// ============================================================================
// Context and results
// ============================================================================

/// Traversal state of one cascade call.
#[derive(Debug)]
pub struct CascadeContext {
    pub root: EntityRef,
    pub max_depth: usize,
    pub visited: HashSet<usize>,
    /// Table name -> entities written to it.
    pub affected: BTreeMap<String, Vec<EntityRef>>,
    pub errors: Vec<CascadeError>,
    pub transaction_id: Option<Uuid>,
    pub operation_count: usize,
}

impl CascadeContext {
    pub fn new(root: EntityRef, max_depth: usize) -> Self {
        Self {
            root,
            max_depth,
            visited: HashSet::new(),
            affected: BTreeMap::new(),
            errors: Vec::new(),
            transaction_id: None,
            operation_count: 0,
        }
    }
}

/// A failure on one entity of the graph.
#[derive(Debug)]
pub struct CascadeError {
    /// Model of the entity that failed.
    pub entity: String,
    /// Dotted relation path from the root, empty for the root itself.
    pub path: String,
    pub operation: CascadeOperation,
    pub error: Error,
    pub rollback_required: bool,
}

#[derive(Debug)]
pub struct CascadeResult {
    pub success: bool,
    pub affected_entities: BTreeMap<String, Vec<EntityRef>>,
    pub errors: Vec<CascadeError>,
    pub operation_count: usize,
    pub execution_time: Duration,
    pub transaction_id: Option<Uuid>,
}

impl CascadeResult {
    /// Number of entities written to `table`.
    pub fn affected(&self, table: &str) -> usize {
        self.affected_entities.get(table).map_or(0, Vec::len)
    }
}

/// Cascade shape of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CascadeStats {
    pub total_relations: usize,
    pub cascading_relations: usize,
    /// Longest chain of cascading relations reachable from the model.
    pub max_depth: usize,
}

fn child_path(path: &str, property: &str) -> String {
    if path.is_empty() { property.to_string() } else { format!("{path}.{property}") }
}

// ============================================================================
// Engine
// ============================================================================

pub struct CascadeEngine {
    orm: Orm,
}

impl CascadeEngine {
    pub fn new(orm: Orm) -> Self {
        Self { orm }
    }

    /// Runs one cascade call from `entity`.
    pub async fn execute(&self, entity: &EntityRef, config: &CascadeConfig) -> CascadeResult {
        let started = Instant::now();
        let db = self.orm.database();
        let mut ctx = CascadeContext::new(entity.clone(), config.max_depth);
        let model = entity.model();

        let opened = if config.transaction_enabled {
            match db.begin_if_idle().await {
                Ok(opened) => opened,
                Err(error) => {
                    ctx.errors.push(CascadeError {
                        entity: model,
                        path: String::new(),
                        operation: config.operation,
                        error,
                        rollback_required: false,
                    });
                    return Self::finish(ctx, started);
                }
            }
        } else {
            false
        };
        if opened {
            ctx.transaction_id = Some(Uuid::new_v4());
        }
        log::info!("cascade {:?} of `{model}` started (transaction {:?})", config.operation, ctx.transaction_id);

        let outcome = self.traverse(entity.clone(), config, &mut ctx, 0, String::new()).await;
        match outcome {
            Ok(()) => {
                if opened {
                    if let Err(error) = db.commit().await {
                        ctx.errors.push(CascadeError {
                            entity: model,
                            path: String::new(),
                            operation: config.operation,
                            error,
                            rollback_required: true,
                        });
                    }
                }
            }
            Err(error) => {
                let rollback = opened && config.rollback_on_error;
                if rollback {
                    if let Err(failure) = db.rollback().await {
                        log::error!("rollback of cascade {:?} failed: {failure}", ctx.transaction_id);
                    }
                    ctx.affected.clear();
                } else if opened {
                    if let Err(failure) = db.commit().await {
                        log::error!("commit of partial cascade {:?} failed: {failure}", ctx.transaction_id);
                    }
                }
                log::warn!("cascade {:?} of `{model}` failed: {error}", config.operation);
                ctx.errors.push(CascadeError {
                    entity: model,
                    path: String::new(),
                    operation: config.operation,
                    error,
                    rollback_required: rollback,
                });
            }
        }
        Self::finish(ctx, started)
    }

    fn finish(ctx: CascadeContext, started: Instant) -> CascadeResult {
        let root = ctx.root.model();
        let result = CascadeResult {
            success: ctx.errors.is_empty(),
            affected_entities: ctx.affected,
            errors: ctx.errors,
            operation_count: ctx.operation_count,
            execution_time: started.elapsed(),
            transaction_id: ctx.transaction_id,
        };
        log::info!(
            "cascade of `{}` finished: success={} operations={} errors={} in {:?}",
            root,
            result.success,
            result.operation_count,
            result.errors.len(),
            result.execution_time
        );
        result
    }

    fn traverse<'a>(
        &'a self,
        entity: EntityRef,
        config: &'a CascadeConfig,
        ctx: &'a mut CascadeContext,
        depth: usize,
        path: String,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth >= ctx.max_depth {
                log::debug!("cascade stopped at depth {depth} on `{path}`");
                return Ok(());
            }
            if !ctx.visited.insert(entity.id()) {
                return Ok(());
            }

            let model = entity.model();
            let meta = self.orm.metadata().get(&model)?;
            // An update cascade never inserts: new children reached through a relation
            // are left alone.
            let keyless = !entity.get(meta.primary_field()).is_present();
            if config.operation == CascadeOperation::Update && depth > 0 && keyless {
                log::warn!("`{model}` at `{path}` has no primary key, skipped by update cascade");
                return Ok(());
            }
            let mappings: Vec<_> =
                self.orm.relations().mappings(&model)?.into_iter().filter(|m| config.follows(m)).collect();
            let deleting = config.operation == CascadeOperation::Delete;

            // Parents referenced through belongs-to are written first so the foreign key
            // goes out with this entity's own row.
            if !deleting {
                for mapping in mappings.iter().filter(|m| m.kind == RelationKind::BelongsTo) {
                    let Some(parent) = entity.one(&mapping.property) else { continue };
                    let path = child_path(&path, &mapping.property);
                    self.descend(parent.clone(), config, ctx, depth + 1, path).await;
                    self.adopt_parent_key(&entity, &meta, &parent, mapping)?;
                }
            }

            self.apply(&entity, &meta, config.operation, ctx).await?;

            for mapping in &mappings {
                if mapping.kind == RelationKind::BelongsTo && !deleting {
                    continue;
                }
                let Some(related) = entity.related(&mapping.property) else { continue };
                let path = child_path(&path, &mapping.property);
                let outcome =
                    self.cascade_relation(&entity, &meta, mapping, related.entities(), config, ctx, depth, &path).await;
                if let Err(error) = outcome {
                    log::warn!("cascade {:?} through `{path}` failed: {error}", config.operation);
                    ctx.errors.push(CascadeError {
                        entity: model.clone(),
                        path: path.clone(),
                        operation: config.operation,
                        error: error.at(path),
                        rollback_required: false,
                    });
                }
            }
            Ok(())
        })
    }

    /// Traverses `child`, recording its failure instead of propagating it.
    async fn descend(
        &self,
        child: EntityRef,
        config: &CascadeConfig,
        ctx: &mut CascadeContext,
        depth: usize,
        path: String,
    ) -> bool {
        let model = child.model();
        match self.traverse(child, config, ctx, depth, path.clone()).await {
            Ok(()) => true,
            Err(error) => {
                log::warn!("cascade {:?} failed on `{model}` at `{path}`: {error}", config.operation);
                ctx.errors.push(CascadeError {
                    entity: model,
                    path: path.clone(),
                    operation: config.operation,
                    error: error.at(path),
                    rollback_required: false,
                });
                false
            }
        }
    }

    /// The entity's own write.
    async fn apply(
        &self,
        entity: &EntityRef,
        meta: &ModelMeta,
        operation: CascadeOperation,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        match operation {
            CascadeOperation::Create => {
                let key = entity.get(meta.primary_field());
                if key.is_present() && self.orm.row_exists(meta, &key).await? {
                    log::debug!("`{}` {key} already stored, not inserted again", meta.name);
                    return Ok(());
                }
                self.orm.create(entity).await?;
            }
            CascadeOperation::Update => {
                self.orm.update_entity(entity).await?;
            }
            CascadeOperation::Save => {
                self.orm.save(entity).await?;
            }
            CascadeOperation::Delete => {
                self.orm.delete_entity(entity).await?;
            }
        }
        ctx.operation_count += 1;
        ctx.affected.entry(meta.table.clone()).or_default().push(entity.clone());
        Ok(())
    }

    fn adopt_parent_key(
        &self,
        entity: &EntityRef,
        meta: &ModelMeta,
        parent: &EntityRef,
        mapping: &RelationMapping,
    ) -> Result<()> {
        let parent_meta = self.orm.metadata().get(&parent.model())?;
        let key = parent.get(parent_meta.field_for_column(&mapping.local_key));
        if key.is_present() {
            entity.set(meta.field_for_column(&mapping.foreign_key), key);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn cascade_relation(
        &self,
        entity: &EntityRef,
        meta: &ModelMeta,
        mapping: &RelationMapping,
        children: Vec<EntityRef>,
        config: &CascadeConfig,
        ctx: &mut CascadeContext,
        depth: usize,
        path: &str,
    ) -> Result<()> {
        let deleting = config.operation == CascadeOperation::Delete;
        match mapping.kind {
            RelationKind::HasOne | RelationKind::HasMany => {
                let parent_key = self.source_key(entity, meta, mapping)?;
                let target = self.orm.metadata().get(&mapping.target)?;
                let foreign_field = target.field_for_column(&mapping.foreign_key).to_string();
                for batch in children.chunks(config.batch_size.max(1)) {
                    log::debug!("cascading {:?} to {} entities through `{path}`", config.operation, batch.len());
                    for child in batch {
                        if !deleting {
                            child.set(foreign_field.clone(), parent_key.clone());
                        }
                        self.descend(child.clone(), config, ctx, depth + 1, path.to_string()).await;
                    }
                }
            }
            RelationKind::BelongsTo => {
                for parent in children {
                    self.descend(parent, config, ctx, depth + 1, path.to_string()).await;
                }
            }
            RelationKind::ManyToMany => {
                let join = mapping.join_table()?;
                let source_key = self.source_key(entity, meta, mapping)?;
                if deleting {
                    let sql = format!("DELETE FROM {} WHERE {} = ?", quote(&join.table), quote(&join.foreign_key));
                    self.orm.database().execute(&sql, &[source_key]).await?;
                    ctx.operation_count += 1;
                    for child in children {
                        self.descend(child, config, ctx, depth + 1, path.to_string()).await;
                    }
                    return Ok(());
                }

                let target = self.orm.metadata().get(&mapping.target)?;
                let target_field = target.field_for_column(&mapping.target_key).to_string();
                for batch in children.chunks(config.batch_size.max(1)) {
                    for child in batch {
                        self.descend(child.clone(), config, ctx, depth + 1, path.to_string()).await;
                        let target_key = child.get(&target_field);
                        if target_key.is_present() && self.link(join, &source_key, &target_key).await? {
                            ctx.operation_count += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn source_key(&self, entity: &EntityRef, meta: &ModelMeta, mapping: &RelationMapping) -> Result<Value> {
        let key = entity.get(meta.field_for_column(&mapping.local_key));
        if key.is_present() {
            Ok(key)
        } else {
            Err(Error::state(format!(
                "`{}` has no `{}` value to cascade through `{}`",
                meta.name, mapping.local_key, mapping.property
            )))
        }
    }

    /// Inserts the join row unless it already exists. Returns whether a row was added.
    async fn link(&self, join: &JoinTable, source_key: &Value, target_key: &Value) -> Result<bool> {
        let db = self.orm.database();
        let params = [source_key.clone(), target_key.clone()];
        let exists = format!(
            "SELECT 1 AS found FROM {} WHERE {} = ? AND {} = ? LIMIT 1",
            quote(&join.table),
            quote(&join.foreign_key),
            quote(&join.other_key)
        );
        if db.fetch_optional(&exists, &params).await?.is_some() {
            return Ok(false);
        }
        let insert = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            quote(&join.table),
            quote(&join.foreign_key),
            quote(&join.other_key)
        );
        db.execute(&insert, &params).await?;
        Ok(true)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn cascade_stats(&self, model: &str) -> Result<CascadeStats> {
        let mappings = self.orm.relations().mappings(model)?;
        let cascading = mappings.iter().filter(|m| !m.cascade.is_empty()).count();
        let mut on_path = HashSet::from([model.to_string()]);
        Ok(CascadeStats {
            total_relations: mappings.len(),
            cascading_relations: cascading,
            max_depth: self.chain_depth(model, &mut on_path)?,
        })
    }

    fn chain_depth(&self, model: &str, on_path: &mut HashSet<String>) -> Result<usize> {
        let mut deepest = 0;
        for mapping in self.orm.relations().mappings(model)? {
            if mapping.cascade.is_empty() || !on_path.insert(mapping.target.clone()) {
                continue;
            }
            deepest = deepest.max(1 + self.chain_depth(&mapping.target, on_path)?);
            on_path.remove(&mapping.target);
        }
        Ok(deepest)
    }

    pub fn validate_config(&self, config: &CascadeConfig) -> Result<()> {
        if config.max_depth == 0 {
            return Err(Error::config("cascade max_depth must be at least 1"));
        }
        if config.batch_size == 0 {
            return Err(Error::config("cascade batch_size must be at least 1"));
        }
        if config.cascade_types.is_empty() {
            return Err(Error::config("cascade needs at least one cascade type"));
        }
        Ok(())
    }

    /// Dotted paths of every relation a cascade of `config` would follow from `model`.
    pub(crate) fn cascading_paths(&self, model: &str, config: &CascadeConfig) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut on_path = HashSet::from([model.to_string()]);
        self.collect_paths(model, config, "", 1, &mut on_path, &mut paths)?;
        Ok(paths)
    }

    fn collect_paths(
        &self,
        model: &str,
        config: &CascadeConfig,
        prefix: &str,
        depth: usize,
        on_path: &mut HashSet<String>,
        paths: &mut Vec<String>,
    ) -> Result<()> {
        if depth >= config.max_depth {
            return Ok(());
        }
        for mapping in self.orm.relations().mappings(model)? {
            if !config.follows(&mapping) || !on_path.insert(mapping.target.clone()) {
                continue;
            }
            let path = child_path(prefix, &mapping.property);
            paths.push(path.clone());
            self.collect_paths(&mapping.target, config, &path, depth + 1, on_path, paths)?;
            on_path.remove(&mapping.target);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_follows_create_or_update() {
        assert_eq!(CascadeOperation::Save.cascade_types(), [CascadeType::Create, CascadeType::Update]);
        let config = CascadeConfig::new(CascadeOperation::Save).cascade_types([CascadeType::Update]);
        assert!(config.permits(CascadeOperation::Save.cascade_types()));
        assert!(!config.permits(CascadeOperation::Delete.cascade_types()));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: CascadeConfig = serde_json::from_str(r#"{"operation":"delete","max_depth":2}"#).unwrap();
        assert_eq!(config.operation, CascadeOperation::Delete);
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.cascade_types, [CascadeType::All]);
        assert_eq!(config.batch_size, 100);
        assert!(config.transaction_enabled && config.rollback_on_error);
    }

    #[test]
    fn child_paths_are_dotted() {
        assert_eq!(child_path("", "items"), "items");
        assert_eq!(child_path("items", "product"), "items.product");
    }
}
