//! # Metadata Module
//!
//! Registration-time table of every known model: merged columns, primary key,
//! logical/physical name accessors and the reverse relation index.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::model::{ColumnInfo, ModelDef, RelationDecl, RelationKind, TargetRef};
use crate::{Error, Record, Result, Value};

/// Resolved metadata of one registered model.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub relations: Vec<RelationDecl>,
    /// Physical name of the primary key column.
    pub primary_key: String,
    field_to_column: HashMap<String, String>,
    column_to_field: HashMap<String, String>,
}

impl ModelMeta {
    fn build(def: &ModelDef) -> Self {
        let columns = def.resolved_columns();
        let primary_key = columns
            .iter()
            .find(|c| c.primary_key)
            .or_else(|| columns.iter().find(|c| c.name == "id"))
            .map_or_else(|| "id".to_string(), |c| c.name.clone());

        let field_to_column = columns.iter().map(|c| (c.field.clone(), c.name.clone())).collect();
        let column_to_field = columns.iter().map(|c| (c.name.clone(), c.field.clone())).collect();

        Self {
            name: def.name.clone(),
            table: def.table.clone(),
            relations: def.resolved_relations(),
            columns,
            primary_key,
            field_to_column,
            column_to_field,
        }
    }

    /// Physical column for a logical field; unknown names pass through unchanged.
    pub fn column_for_field<'a>(&'a self, field: &'a str) -> &'a str {
        self.field_to_column.get(field).map_or(field, String::as_str)
    }

    /// Logical field for a physical column; unknown names pass through unchanged.
    pub fn field_for_column<'a>(&'a self, column: &'a str) -> &'a str {
        self.column_to_field.get(column).map_or(column, String::as_str)
    }

    /// Logical field holding the primary key.
    pub fn primary_field(&self) -> &str {
        self.field_for_column(&self.primary_key)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name || c.field == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDecl> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn primary_column(&self) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == self.primary_key)
    }

    /// Column map of the declared columns present in `fields`.
    pub fn to_columns(&self, fields: &Record) -> Record {
        self.columns
            .iter()
            .filter_map(|c| {
                let value = fields.get(&c.field).or_else(|| fields.get(&c.name))?;
                Some((c.name.clone(), value.clone()))
            })
            .collect()
    }

    /// Renames a stored row to logical field names.
    pub fn to_fields(&self, row: Record) -> Record {
        row.into_iter().map(|(column, value)| (self.field_for_column(&column).to_string(), value)).collect()
    }

    /// Column map for an `INSERT`: generated keys, missing primary keys and nulls are left
    /// out, and timestamp columns without a value are stamped with the local time.
    pub fn insert_columns(&self, fields: &Record) -> Record {
        let mut row = Record::new();
        for column in &self.columns {
            if column.is_generated() {
                continue;
            }
            let value = fields.get(&column.field).or_else(|| fields.get(&column.name)).cloned().unwrap_or_default();
            if column.primary_key && !value.is_present() {
                continue;
            }
            if value.is_null() {
                if column.is_timestamp() {
                    row.insert(column.name.clone(), Value::Text(crate::value::local_timestamp()));
                }
                continue;
            }
            row.insert(column.name.clone(), value);
        }
        row
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub models: usize,
    pub relations: usize,
    pub reverse_entries: usize,
}

/// Registration-time metadata table keyed by model name.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    models: RwLock<HashMap<String, Arc<ModelMeta>>>,
    /// Target model -> (source model, relation name).
    reverse: RwLock<HashMap<String, Vec<(String, String)>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model and every relation target reachable from it.
    ///
    /// Re-registering a known model returns the existing metadata unchanged.
    pub fn register(&self, def: &ModelDef) -> Arc<ModelMeta> {
        if let Some(meta) = self.lookup(&def.name) {
            return meta;
        }

        let meta = Arc::new(ModelMeta::build(def));
        {
            let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = models.get(&def.name) {
                return existing.clone();
            }
            models.insert(def.name.clone(), meta.clone());
        }
        log::debug!("registered model `{}` on table `{}`", meta.name, meta.table);

        for relation in &meta.relations {
            let target = match &relation.target {
                TargetRef::Named(name) => name.clone(),
                TargetRef::Deferred(resolve) => self.register(&resolve()).name.clone(),
            };
            self.reverse
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(target)
                .or_default()
                .push((meta.name.clone(), relation.name.clone()));
        }
        meta
    }

    fn lookup(&self, name: &str) -> Option<Arc<ModelMeta>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelMeta>> {
        self.lookup(name).ok_or_else(|| Error::config(format!("model `{name}` is not registered")))
    }

    /// The registered model stored in `table`, if any.
    pub fn by_table(&self, table: &str) -> Option<Arc<ModelMeta>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner).values().find(|m| m.table == table).cloned()
    }

    /// Metadata of a relation's target, registering deferred targets on first use.
    pub fn target_of(&self, relation: &RelationDecl) -> Result<Arc<ModelMeta>> {
        match &relation.target {
            TargetRef::Named(name) => self.get(name),
            TargetRef::Deferred(resolve) => Ok(self.register(&resolve())),
        }
    }

    pub fn columns(&self, name: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self.get(name)?.columns.clone())
    }

    pub fn primary_key(&self, name: &str) -> Result<String> {
        Ok(self.get(name)?.primary_key.clone())
    }

    pub fn table_name(&self, name: &str) -> Result<String> {
        Ok(self.get(name)?.table.clone())
    }

    /// Relations pointing at `target`, as (source model, relation name) pairs.
    pub fn relations_to(&self, target: &str) -> Vec<(String, String)> {
        self.reverse.read().unwrap_or_else(PoisonError::into_inner).get(target).cloned().unwrap_or_default()
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.models.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    /// Checks that every relation target is registered and every many-to-many
    /// declaration is complete.
    pub fn validate(&self) -> Result<()> {
        let models: Vec<_> = self.models.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        for meta in models {
            for relation in &meta.relations {
                if let TargetRef::Named(target) = &relation.target {
                    if !self.contains(target) {
                        return Err(Error::config(format!(
                            "relation `{}.{}` targets unregistered model `{target}`",
                            meta.name, relation.name
                        )));
                    }
                }
                if relation.kind == RelationKind::ManyToMany {
                    let blank = |v: &Option<String>| v.as_deref().is_some_and(|s| s.trim().is_empty());
                    if blank(&relation.through) || blank(&relation.through_foreign_key) || blank(&relation.through_other_key) {
                        return Err(Error::config(format!(
                            "many-to-many relation `{}.{}` has an incomplete join table",
                            meta.name, relation.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let reverse = self.reverse.read().unwrap_or_else(PoisonError::into_inner);
        RegistryStats {
            models: models.len(),
            relations: models.values().map(|m| m.relations.len()).sum(),
            reverse_entries: reverse.values().map(Vec::len).sum(),
        }
    }

    pub fn clear(&self) {
        self.models.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.reverse.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnInfo, RelationDecl};

    fn author() -> ModelDef {
        ModelDef::new("Author")
            .table("authors")
            .column(ColumnInfo::integer("id").primary_key().auto_increment())
            .column(ColumnInfo::text("penName"))
            .relation(RelationDecl::has_many("books", TargetRef::deferred(book)))
    }

    fn book() -> ModelDef {
        ModelDef::new("Book")
            .table("books")
            .column(ColumnInfo::integer("isbn").primary_key())
            .column(ColumnInfo::integer("author_id"))
            .relation(RelationDecl::belongs_to("author", TargetRef::deferred(author)))
    }

    #[test]
    fn registration_follows_deferred_targets() {
        let registry = MetadataRegistry::new();
        registry.register(&author());

        assert!(registry.contains("Book"));
        assert_eq!(registry.primary_key("Book").unwrap(), "isbn");
        assert_eq!(registry.relations_to("Book"), [("Author".to_string(), "books".to_string())]);
        assert_eq!(registry.stats(), RegistryStats { models: 2, relations: 2, reverse_entries: 2 });
    }

    #[test]
    fn register_is_idempotent() {
        let registry = MetadataRegistry::new();
        let first = registry.register(&author());
        let second = registry.register(&author());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.stats().reverse_entries, 2);
    }

    #[test]
    fn accessors_translate_names() {
        let registry = MetadataRegistry::new();
        let meta = registry.register(&author());
        assert_eq!(meta.column_for_field("penName"), "pen_name");
        assert_eq!(meta.field_for_column("pen_name"), "penName");
        assert_eq!(meta.field_for_column("unknown"), "unknown");
    }

    #[test]
    fn insert_columns_skip_generated_and_null() {
        let registry = MetadataRegistry::new();
        let meta = registry.register(&author());
        let mut fields = Record::new();
        fields.insert("id".into(), Value::Integer(4));
        fields.insert("penName".into(), Value::Null);
        assert!(meta.insert_columns(&fields).is_empty());
    }

    #[test]
    fn validate_reports_unknown_named_target() {
        let registry = MetadataRegistry::new();
        registry.register(&ModelDef::new("Tag").relation(RelationDecl::many_to_many("posts", "Post")));
        assert!(matches!(registry.validate(), Err(Error::Configuration(_))));
    }
}
