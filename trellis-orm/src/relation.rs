//! # Relation Module
//!
//! Turns declared relations into resolved mappings with concrete key and join-table
//! names. Mappings are computed once per (model, relation) and cached.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::metadata::{MetadataRegistry, ModelMeta};
use crate::model::{CascadeType, RelationDecl, RelationKind};
use crate::{naming, Error, Result};

/// Physical layout of a many-to-many join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Column referencing the source model's key.
    pub foreign_key: String,
    /// Column referencing the target model's key.
    pub other_key: String,
}

/// A relation with every key resolved.
///
/// Key semantics by kind:
/// - `HasOne`/`HasMany`: `foreign_key` lives on the target table and references the
///   source's `local_key`.
/// - `BelongsTo`: `foreign_key` lives on the source table and references the target's
///   `local_key`.
/// - `ManyToMany`: `local_key` is the source key, `target_key` the target key, and the
///   join table holds both.
#[derive(Debug, Clone)]
pub struct RelationMapping {
    pub source: String,
    pub target: String,
    pub property: String,
    pub kind: RelationKind,
    pub source_table: String,
    pub target_table: String,
    pub foreign_key: String,
    pub local_key: String,
    /// Primary key column of the target table.
    pub target_key: String,
    pub join: Option<JoinTable>,
    pub cascade: Vec<CascadeType>,
    pub lazy: bool,
}

impl RelationMapping {
    /// Whether writes of any of `types` propagate along this relation.
    pub fn cascades_any(&self, types: &[CascadeType]) -> bool {
        self.cascade.contains(&CascadeType::All) || types.iter().any(|t| self.cascade.contains(t))
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, RelationKind::HasMany | RelationKind::ManyToMany)
    }

    pub(crate) fn join_table(&self) -> Result<&JoinTable> {
        self.join.as_ref().ok_or_else(|| {
            Error::config(format!("relation `{}.{}` has no join table", self.source, self.property))
        })
    }
}

/// Computes the mapping of `decl` declared on `source` pointing at `target`.
pub fn resolve_mapping(source: &ModelMeta, decl: &RelationDecl, target: &ModelMeta) -> RelationMapping {
    let (foreign_key, local_key, join) = match decl.kind {
        RelationKind::HasOne | RelationKind::HasMany => (
            decl.foreign_key.clone().unwrap_or_else(|| naming::foreign_key_for(&source.table)),
            decl.local_key.clone().unwrap_or_else(|| source.primary_key.clone()),
            None,
        ),
        RelationKind::BelongsTo => (
            decl.foreign_key.clone().unwrap_or_else(|| naming::foreign_key_for(&target.table)),
            decl.local_key.clone().unwrap_or_else(|| target.primary_key.clone()),
            None,
        ),
        RelationKind::ManyToMany => {
            let join = JoinTable {
                table: decl.through.clone().unwrap_or_else(|| naming::join_table_for(&source.table, &target.table)),
                foreign_key: decl.through_foreign_key.clone().unwrap_or_else(|| naming::join_key_for(&source.table)),
                other_key: decl.through_other_key.clone().unwrap_or_else(|| naming::join_key_for(&target.table)),
            };
            (
                join.foreign_key.clone(),
                decl.local_key.clone().unwrap_or_else(|| source.primary_key.clone()),
                Some(join),
            )
        }
    };

    RelationMapping {
        source: source.name.clone(),
        target: target.name.clone(),
        property: decl.name.clone(),
        kind: decl.kind,
        source_table: source.table.clone(),
        target_table: target.table.clone(),
        foreign_key,
        local_key,
        target_key: target.primary_key.clone(),
        join,
        cascade: decl.cascade.clone(),
        lazy: decl.lazy,
    }
}

/// Memoizing resolver over a [`MetadataRegistry`].
#[derive(Debug)]
pub struct RelationRegistry {
    metadata: Arc<MetadataRegistry>,
    cache: RwLock<HashMap<(String, String), Arc<RelationMapping>>>,
}

impl RelationRegistry {
    pub fn new(metadata: Arc<MetadataRegistry>) -> Self {
        Self { metadata, cache: RwLock::new(HashMap::new()) }
    }

    /// Resolves relation `property` of model `source`.
    pub fn resolve(&self, source: &str, property: &str) -> Result<Arc<RelationMapping>> {
        let key = (source.to_string(), property.to_string());
        if let Some(mapping) = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return Ok(mapping.clone());
        }

        let source_meta = self.metadata.get(source)?;
        let decl = source_meta
            .relation(property)
            .ok_or_else(|| Error::config(format!("model `{source}` has no relation `{property}`")))?;
        let target_meta = self.metadata.target_of(decl)?;
        let mapping = Arc::new(resolve_mapping(&source_meta, decl, &target_meta));

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(key).or_insert(mapping).clone())
    }

    /// Every relation declared on `source`, resolved, in declaration order.
    pub fn mappings(&self, source: &str) -> Result<Vec<Arc<RelationMapping>>> {
        let meta = self.metadata.get(source)?;
        meta.relations.iter().map(|decl| self.resolve(source, &decl.name)).collect()
    }

    /// Resolves a dotted path (`"items.product"`) hop by hop.
    pub fn relation_path(&self, source: &str, path: &str) -> Result<Vec<Arc<RelationMapping>>> {
        let mut model = source.to_string();
        let mut hops = Vec::new();
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            let mapping = self.resolve(&model, segment)?;
            model = mapping.target.clone();
            hops.push(mapping);
        }
        if hops.is_empty() {
            return Err(Error::config(format!("empty relation path on `{source}`")));
        }
        Ok(hops)
    }

    pub fn cached(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnInfo, ModelDef, TargetRef};

    fn student() -> ModelDef {
        ModelDef::new("Student")
            .table("students")
            .column(ColumnInfo::integer("id").primary_key().auto_increment())
            .relation(RelationDecl::many_to_many("courses", TargetRef::deferred(course)))
            .relation(RelationDecl::belongs_to("school", TargetRef::deferred(school)))
    }

    fn course() -> ModelDef {
        ModelDef::new("Course").table("courses").column(ColumnInfo::integer("code").primary_key())
    }

    fn school() -> ModelDef {
        ModelDef::new("School")
            .table("schools")
            .column(ColumnInfo::integer("id").primary_key())
            .relation(RelationDecl::has_many("students", TargetRef::deferred(student)))
    }

    fn registry() -> RelationRegistry {
        let metadata = Arc::new(MetadataRegistry::new());
        metadata.register(&student());
        RelationRegistry::new(metadata)
    }

    #[test]
    fn many_to_many_defaults() {
        let mapping = registry().resolve("Student", "courses").unwrap();
        let join = mapping.join.clone().unwrap();
        assert_eq!(join.table, "course_students");
        assert_eq!(join.foreign_key, "student_id");
        assert_eq!(join.other_key, "course_id");
        assert_eq!(mapping.local_key, "id");
        assert_eq!(mapping.target_key, "code");
    }

    #[test]
    fn belongs_to_and_has_many_defaults() {
        let relations = registry();
        let school = relations.resolve("Student", "school").unwrap();
        assert_eq!(school.foreign_key, "schools_id");
        assert_eq!(school.local_key, "id");

        let students = relations.resolve("School", "students").unwrap();
        assert_eq!(students.foreign_key, "schools_id");
        assert_eq!(students.local_key, "id");
    }

    #[test]
    fn mappings_are_memoized() {
        let relations = registry();
        let first = relations.resolve("Student", "courses").unwrap();
        let second = relations.resolve("Student", "courses").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(relations.cached(), 1);
    }

    #[test]
    fn dotted_paths_walk_targets() {
        let hops = registry().relation_path("School", "students.courses").unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[1].target, "Course");
        assert!(registry().relation_path("School", "students.missing").is_err());
    }
}
