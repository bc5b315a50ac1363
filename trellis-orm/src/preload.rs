//! # Preload Module
//!
//! Batched relation loading. For a set of parent rows each relation costs exactly one
//! query: the distinct parent keys are collected, fetched with a single `IN` query and
//! the results grouped back onto their parents. Dotted paths (`"items.product"`) load
//! level by level, one query per level.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;

use crate::database::Connection;
use crate::entity::EntityRef;
use crate::model::RelationKind;
use crate::naming::quote;
use crate::query_builder::Session;
use crate::relation::RelationMapping;
use crate::{Error, Orm, Record, Result, Value};

/// Synthetic column carrying the owning key through a many-to-many join.
const PARENT_KEY: &str = "__parent_key__";

/// Relation paths merged into a tree so shared prefixes load once.
#[derive(Debug, Default)]
struct PathTree(BTreeMap<String, PathTree>);

impl PathTree {
    fn build(paths: &[String]) -> Self {
        let mut root = PathTree::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                node = node.0.entry(segment.to_string()).or_default();
            }
        }
        root
    }
}

impl Session {
    /// Queues a relation path to load alongside the rows of `find_with_relations`.
    pub fn with(&mut self, path: &str) -> &mut Self {
        if !self.bound() {
            return self;
        }
        if self.model.is_none() {
            self.fail(Error::config("relation preloading needs a session bound to a model"));
            return self;
        }
        self.preloads.push(path.to_string());
        self
    }

    /// Queues several relation paths.
    pub fn preload(&mut self, paths: &[&str]) -> &mut Self {
        for path in paths {
            self.with(path);
        }
        self
    }

    /// All matching rows as entities with the queued relations attached.
    pub async fn find_with_relations(&self) -> Result<Vec<EntityRef>> {
        self.ready()?;
        let meta = self.model.clone().ok_or_else(|| Error::config("session is not bound to a model"))?;
        let rows = self.fetch_rows().await?;
        let entities: Vec<EntityRef> =
            rows.into_iter().map(|row| EntityRef::from_record(meta.name.clone(), meta.to_fields(row))).collect();
        attach_paths(&self.orm, &meta.name, &entities, &self.preloads).await?;
        Ok(entities)
    }

    /// First matching row as an entity with the queued relations attached.
    pub async fn first_with_relations(&self) -> Result<Option<EntityRef>> {
        self.ready()?;
        let meta = self.model.clone().ok_or_else(|| Error::config("session is not bound to a model"))?;
        let mut predicates = self.predicates.clone();
        predicates.limit(1);
        let (where_sql, params) = predicates.where_sql();
        let sql = format!("SELECT * FROM {}{where_sql}{}", quote(&meta.table), predicates.tail_sql());
        let Some(row) = self.orm.database().fetch_optional(&sql, &params).await? else {
            return Ok(None);
        };
        let entity = EntityRef::from_record(meta.name.clone(), meta.to_fields(row));
        attach_paths(&self.orm, &meta.name, std::slice::from_ref(&entity), &self.preloads).await?;
        Ok(Some(entity))
    }
}

/// Loads `paths` onto `entities` (all instances of `model`).
pub(crate) async fn attach_paths(orm: &Orm, model: &str, entities: &[EntityRef], paths: &[String]) -> Result<()> {
    if paths.is_empty() || entities.is_empty() {
        return Ok(());
    }
    let tree = PathTree::build(paths);
    attach_tree(orm, model.to_string(), entities.to_vec(), &tree).await
}

fn attach_tree<'a>(orm: &'a Orm, model: String, entities: Vec<EntityRef>, tree: &'a PathTree) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for (property, subtree) in &tree.0 {
            let mapping = orm.relations().resolve(&model, property)?;
            let children = load_level(orm, &entities, &mapping).await?;
            if !subtree.0.is_empty() && !children.is_empty() {
                attach_tree(orm, mapping.target.clone(), children, subtree).await?;
            }
        }
        Ok(())
    })
}

/// One query for one relation of every entity in `parents`; returns all loaded children.
async fn load_level(orm: &Orm, parents: &[EntityRef], mapping: &RelationMapping) -> Result<Vec<EntityRef>> {
    let source = orm.metadata().get(&mapping.source)?;
    let target = orm.metadata().get(&mapping.target)?;

    // Column on the parent whose value identifies its children, and the column on the
    // fetched rows holding that same value.
    let (parent_column, child_column) = match mapping.kind {
        RelationKind::HasOne | RelationKind::HasMany => (mapping.local_key.as_str(), mapping.foreign_key.as_str()),
        RelationKind::BelongsTo => (mapping.foreign_key.as_str(), mapping.local_key.as_str()),
        RelationKind::ManyToMany => (mapping.local_key.as_str(), PARENT_KEY),
    };
    let parent_field = source.field_for_column(parent_column);

    let mut keys: Vec<Value> = Vec::new();
    for parent in parents {
        let key = parent.get(parent_field);
        if key.is_present() && !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut grouped: HashMap<Value, Vec<Record>> = HashMap::new();
    if !keys.is_empty() {
        let marks = vec!["?"; keys.len()].join(", ");
        let sql = match mapping.kind {
            RelationKind::ManyToMany => {
                let join = mapping.join_table()?;
                format!(
                    "SELECT t.*, j.{fk} AS {pk} FROM {target} AS t INNER JOIN {join} AS j ON j.{ok} = t.{tk} WHERE j.{fk} IN ({marks})",
                    fk = quote(&join.foreign_key),
                    pk = quote(PARENT_KEY),
                    target = quote(&target.table),
                    join = quote(&join.table),
                    ok = quote(&join.other_key),
                    tk = quote(&mapping.target_key),
                )
            }
            _ => format!("SELECT * FROM {} WHERE {} IN ({marks})", quote(&target.table), quote(child_column)),
        };
        for mut row in orm.database().fetch_all(&sql, &keys).await? {
            let owner = if mapping.kind == RelationKind::ManyToMany {
                row.remove(PARENT_KEY)
            } else {
                row.get(child_column).cloned()
            };
            if let Some(owner) = owner {
                grouped.entry(owner).or_default().push(row);
            }
        }
    }
    log::debug!(
        "preloaded `{}.{}` for {} parents ({} keys)",
        mapping.source,
        mapping.property,
        parents.len(),
        keys.len()
    );

    let mut children = Vec::new();
    for parent in parents {
        let rows = grouped.get(&parent.get(parent_field)).cloned().unwrap_or_default();
        let related: Vec<EntityRef> =
            rows.into_iter().map(|row| EntityRef::from_record(target.name.clone(), target.to_fields(row))).collect();
        if mapping.is_collection() {
            children.extend(related.iter().cloned());
            parent.set_many(mapping.property.clone(), related);
        } else if let Some(child) = related.into_iter().next() {
            children.push(child.clone());
            parent.set_one(mapping.property.clone(), child);
        } else {
            parent.clear_related(&mapping.property);
        }
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_prefixes_merge() {
        let tree = PathTree::build(&["items".into(), "items.product".into(), "customer".into()]);
        assert_eq!(tree.0.len(), 2);
        assert_eq!(tree.0["items"].0.len(), 1);
        assert!(tree.0["customer"].0.is_empty());
    }
}
