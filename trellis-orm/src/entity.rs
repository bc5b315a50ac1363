//! # Entity Module
//!
//! Runtime entity instances. An [`EntityRef`] is a shared handle over a dynamic
//! [`Entity`]: the same instance can be reachable from several places of a relation
//! graph, and cascades recognise it by handle identity.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{json, Map};

use crate::{Error, Model, Record, Result, Value};

/// Related instances attached to an entity under a relation name.
#[derive(Debug, Clone)]
pub enum Related {
    One(EntityRef),
    Many(Vec<EntityRef>),
}

impl Related {
    /// Every attached instance, whatever the cardinality.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            Related::One(entity) => vec![entity.clone()],
            Related::Many(entities) => entities.clone(),
        }
    }
}

/// A dynamic instance of a registered model.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub model: String,
    /// Values keyed by logical field name.
    pub fields: Record,
    pub relations: BTreeMap<String, Related>,
}

/// Shared handle over an [`Entity`].
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(model: impl Into<String>) -> Self {
        Self::from_record(model, Record::new())
    }

    pub fn from_record(model: impl Into<String>, fields: Record) -> Self {
        Self(Arc::new(RwLock::new(Entity { model: model.into(), fields, relations: BTreeMap::new() })))
    }

    /// Wraps a typed model instance.
    pub fn from_model<T: Model>(model: &T) -> Self {
        Self::from_record(T::model_name(), model.to_record())
    }

    fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identity of the underlying instance.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn model(&self) -> String {
        self.read().model.clone()
    }

    /// The field value, `Value::Null` when unset.
    pub fn get(&self, field: &str) -> Value {
        self.read().fields.get(field).cloned().unwrap_or_default()
    }

    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        self.write().fields.insert(field.into(), value.into());
    }

    /// Builder-style [`EntityRef::set`].
    pub fn with(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn fields(&self) -> Record {
        self.read().fields.clone()
    }

    /// Merges `fields` into the instance, overwriting existing values.
    pub fn merge(&self, fields: Record) {
        self.write().fields.extend(fields);
    }

    pub fn related(&self, name: &str) -> Option<Related> {
        self.read().relations.get(name).cloned()
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.read().relations.keys().cloned().collect()
    }

    pub fn set_one(&self, name: impl Into<String>, entity: EntityRef) {
        self.write().relations.insert(name.into(), Related::One(entity));
    }

    pub fn set_many(&self, name: impl Into<String>, entities: Vec<EntityRef>) {
        self.write().relations.insert(name.into(), Related::Many(entities));
    }

    /// Appends to a to-many relation, creating it when absent.
    pub fn push(&self, name: impl Into<String>, entity: EntityRef) {
        let mut guard = self.write();
        let relation = guard.relations.entry(name.into()).or_insert_with(|| Related::Many(Vec::new()));
        match relation {
            Related::Many(entities) => entities.push(entity),
            Related::One(existing) => {
                let existing = existing.clone();
                *relation = Related::Many(vec![existing, entity]);
            }
        }
    }

    pub fn clear_related(&self, name: &str) -> Option<Related> {
        self.write().relations.remove(name)
    }

    /// Single related instance, if attached.
    pub fn one(&self, name: &str) -> Option<EntityRef> {
        match self.related(name)? {
            Related::One(entity) => Some(entity),
            Related::Many(entities) => entities.into_iter().next(),
        }
    }

    /// Related instances of a relation, empty when not attached.
    pub fn many(&self, name: &str) -> Vec<EntityRef> {
        self.related(name).map(|related| related.entities()).unwrap_or_default()
    }

    /// Converts the instance into a typed model.
    pub fn to_model<T: Model>(&self) -> Result<T> {
        let (model, fields) = {
            let guard = self.read();
            (guard.model.clone(), guard.fields.clone())
        };
        if model != T::model_name() {
            return Err(Error::config(format!("entity of `{model}` cannot become `{}`", T::model_name())));
        }
        T::from_record(&fields)
    }

    /// JSON snapshot of the instance and everything attached to it.
    ///
    /// Instances already emitted on the current path are rendered as `{"$ref": model}`.
    pub fn to_json(&self) -> serde_json::Value {
        self.snapshot(&mut HashSet::new())
    }

    fn snapshot(&self, path: &mut HashSet<usize>) -> serde_json::Value {
        let (model, fields, relations) = {
            let guard = self.read();
            (guard.model.clone(), guard.fields.clone(), guard.relations.clone())
        };
        if !path.insert(self.id()) {
            return json!({ "$ref": model });
        }

        let mut object = Map::new();
        for (name, value) in fields {
            object.insert(name, serde_json::to_value(value).unwrap_or_default());
        }
        for (name, related) in relations {
            let value = match related {
                Related::One(entity) => entity.snapshot(path),
                Related::Many(entities) => entities.iter().map(|e| e.snapshot(path)).collect(),
            };
            object.insert(name, value);
        }
        path.remove(&self.id());
        serde_json::Value::Object(object)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.read();
        f.debug_struct("EntityRef")
            .field("model", &guard.model)
            .field("fields", &guard.fields)
            .field("relations", &guard.relations.keys().collect::<Vec<_>>())
            .finish()
    }
}
