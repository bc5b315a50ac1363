//! # Lazy Module
//!
//! On-demand relation loading for a single entity.

use std::collections::HashMap;

use futures::future::join_all;

use crate::database::Connection;
use crate::entity::EntityRef;
use crate::model::RelationKind;
use crate::naming::quote;
use crate::relation::RelationMapping;
use crate::{Orm, Record, Result};

/// Loaded value of one relation.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationValue {
    One(Option<Record>),
    Many(Vec<Record>),
}

impl RelationValue {
    fn is_empty_one(&self) -> bool {
        matches!(self, RelationValue::One(None))
    }

    /// Loaded rows, whatever the cardinality.
    pub fn records(&self) -> Vec<Record> {
        match self {
            RelationValue::One(record) => record.iter().cloned().collect(),
            RelationValue::Many(records) => records.clone(),
        }
    }
}

/// An entity with a per-relation cache of loaded values.
#[derive(Debug)]
pub struct LazyLoadProxy {
    target: EntityRef,
    model: String,
    loaded: HashMap<String, RelationValue>,
}

impl LazyLoadProxy {
    pub fn target(&self) -> &EntityRef {
        &self.target
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_relation_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    pub fn loaded_relation(&self, name: &str) -> Option<&RelationValue> {
        self.loaded.get(name)
    }

    /// Drops the cached value of `name`. Returns whether one was cached.
    pub fn clear_loaded_relation(&mut self, name: &str) -> bool {
        self.loaded.remove(name).is_some()
    }

    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.loaded.keys().cloned().collect();
        names.sort();
        names
    }

    fn cache(&mut self, name: &str, value: &RelationValue) {
        // A missing to-one row is not remembered, so the next access queries again.
        if !value.is_empty_one() {
            self.loaded.insert(name.to_string(), value.clone());
        }
    }
}

/// Loads relations of single entities through their resolved mappings.
pub struct LazyLoadManager {
    orm: Orm,
}

impl LazyLoadManager {
    pub fn new(orm: Orm) -> Self {
        Self { orm }
    }

    /// Wraps `entity` in a proxy and loads its eager (non-lazy) relations.
    pub async fn enable(&self, entity: &EntityRef) -> Result<LazyLoadProxy> {
        let model = entity.model();
        let mappings = self.orm.relations().mappings(&model)?;
        let mut proxy = LazyLoadProxy { target: entity.clone(), model, loaded: HashMap::new() };

        let eager: Vec<&str> = mappings.iter().filter(|m| !m.lazy).map(|m| m.property.as_str()).collect();
        if !eager.is_empty() {
            self.preload_relation(&mut proxy, &eager).await?;
        }
        Ok(proxy)
    }

    /// Returns the cached value of `name`, querying the store when it is not cached or
    /// when `force` is set.
    pub async fn load_relation(&self, proxy: &mut LazyLoadProxy, name: &str, force: bool) -> Result<RelationValue> {
        if !force {
            if let Some(value) = proxy.loaded_relation(name) {
                return Ok(value.clone());
            }
        }
        let value = self.fetch(&proxy.target, &proxy.model, name).await?;
        proxy.cache(name, &value);
        Ok(value)
    }

    /// Loads several relations concurrently. Individual failures are logged and skipped.
    pub async fn preload_relation(&self, proxy: &mut LazyLoadProxy, names: &[&str]) -> Result<()> {
        let pending: Vec<&str> = names.iter().copied().filter(|n| !proxy.is_relation_loaded(n)).collect();
        let target = proxy.target.clone();
        let model = proxy.model.clone();

        let loads = pending.iter().map(|name| self.fetch(&target, &model, name));
        let results = join_all(loads).await;

        for (name, result) in pending.into_iter().zip(results) {
            match result {
                Ok(value) => proxy.cache(name, &value),
                Err(error) => log::warn!("preloading `{model}.{name}` failed: {error}"),
            }
        }
        Ok(())
    }

    /// Drops the cached value of `name` and loads it again.
    pub async fn reload_relation(&self, proxy: &mut LazyLoadProxy, name: &str) -> Result<RelationValue> {
        proxy.clear_loaded_relation(name);
        self.load_relation(proxy, name, true).await
    }

    async fn fetch(&self, target: &EntityRef, model: &str, name: &str) -> Result<RelationValue> {
        let mapping = self.orm.relations().resolve(model, name)?;
        self.query(target, &mapping).await
    }

    /// Single-relation query for one entity.
    async fn query(&self, entity: &EntityRef, mapping: &RelationMapping) -> Result<RelationValue> {
        let source = self.orm.metadata().get(&mapping.source)?;
        let target = self.orm.metadata().get(&mapping.target)?;
        let db = self.orm.database();

        let (sql, key) = match mapping.kind {
            RelationKind::HasOne | RelationKind::HasMany => (
                format!("SELECT * FROM {} WHERE {} = ?", quote(&target.table), quote(&mapping.foreign_key)),
                entity.get(source.field_for_column(&mapping.local_key)),
            ),
            RelationKind::BelongsTo => (
                format!("SELECT * FROM {} WHERE {} = ?", quote(&target.table), quote(&mapping.local_key)),
                entity.get(source.field_for_column(&mapping.foreign_key)),
            ),
            RelationKind::ManyToMany => {
                let join = mapping.join_table()?;
                (
                    format!(
                        "SELECT t.* FROM {} AS t INNER JOIN {} AS j ON j.{} = t.{} WHERE j.{} = ?",
                        quote(&target.table),
                        quote(&join.table),
                        quote(&join.other_key),
                        quote(&mapping.target_key),
                        quote(&join.foreign_key)
                    ),
                    entity.get(source.field_for_column(&mapping.local_key)),
                )
            }
        };

        let collection = mapping.is_collection();
        if !key.is_present() {
            return Ok(if collection { RelationValue::Many(Vec::new()) } else { RelationValue::One(None) });
        }

        let rows = db.fetch_all(&sql, &[key]).await?;
        let mut records = rows.into_iter().map(|row| target.to_fields(row));
        Ok(if collection {
            RelationValue::Many(records.collect())
        } else {
            RelationValue::One(records.next())
        })
    }
}
