//! # Query Builder Module
//!
//! [`Session`] is the chainable query builder of Trellis ORM. Chain methods record
//! predicates; terminal methods run them against the bound table.
//!
//! A session must be bound with [`Session::table`] or [`Session::model`] before any
//! predicate is added. Calling a predicate method on an unbound session records a sticky
//! [`Error::TableNotSet`] that every later terminal call reports, until the session is
//! bound again.
//!
//! # Example
//!
//! ```rust,ignore
//! let items = orm
//!     .table("order_items")
//!     .filter("order_id", order_id)
//!     .greater("quantity", 1)
//!     .order_by_desc("id")
//!     .find()
//!     .await?;
//! ```

use std::sync::Arc;

use crate::database::Connection;
use crate::entity::EntityRef;
use crate::metadata::ModelMeta;
use crate::naming::quote;
use crate::predicate::{self, Keys, Operand, Predicates};
use crate::value::local_timestamp;
use crate::{Error, Model, Orm, Record, Result, Value};

const INSERT_CHUNK: usize = 200;

/// Chainable query builder bound to one table.
#[derive(Debug)]
pub struct Session {
    pub(crate) orm: Orm,
    table: Option<String>,
    pub(crate) model: Option<Arc<ModelMeta>>,
    columns: Vec<String>,
    pub(crate) predicates: Predicates,
    last_error: Option<Error>,
    pub(crate) preloads: Vec<String>,
}

impl Session {
    pub(crate) fn new(orm: Orm) -> Self {
        Self {
            orm,
            table: None,
            model: None,
            columns: Vec::new(),
            predicates: Predicates::default(),
            last_error: None,
            preloads: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.table = None;
        self.model = None;
        self.columns.clear();
        self.predicates = Predicates::default();
        self.last_error = None;
        self.preloads.clear();
    }

    // ========================================================================
    // Binding
    // ========================================================================

    /// Binds the session to `table`, discarding previous predicates and errors.
    ///
    /// When a registered model is stored in `table`, it is bound as well.
    pub fn table(&mut self, table: &str) -> &mut Self {
        self.reset();
        self.model = self.orm.metadata().by_table(table);
        self.table = Some(table.to_string());
        self
    }

    /// Binds the session to the table of a typed model, registering it if needed.
    pub fn model<T: Model>(&mut self) -> &mut Self {
        let meta = self.orm.metadata().register(&T::definition());
        self.bind(meta);
        self
    }

    /// Binds the session to a registered model by name.
    pub fn model_named(&mut self, name: &str) -> &mut Self {
        match self.orm.metadata().get(name) {
            Ok(meta) => self.bind(meta),
            Err(error) => {
                self.reset();
                self.last_error = Some(error);
            }
        }
        self
    }

    fn bind(&mut self, meta: Arc<ModelMeta>) {
        self.reset();
        self.table = Some(meta.table.clone());
        self.model = Some(meta);
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// The sticky error recorded by a chain method, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub(crate) fn bound(&mut self) -> bool {
        if self.table.is_none() {
            self.last_error = Some(Error::TableNotSet);
            return false;
        }
        true
    }

    pub(crate) fn fail(&mut self, error: Error) {
        self.last_error = Some(error);
    }

    /// Physical column for a key given either logically or physically.
    fn column(&self, key: &str) -> String {
        self.model.as_ref().map_or_else(|| key.to_string(), |m| m.column_for_field(key).to_string())
    }

    fn columns_of(&self, keys: Keys) -> Keys {
        match keys {
            Keys::One(key) => Keys::One(self.column(&key)),
            Keys::Many(keys) => Keys::Many(keys.iter().map(|k| self.column(k)).collect()),
        }
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    /// Equality filter. `Null` checks for null, a list becomes `IN`, and parallel key and
    /// value lists pair up.
    pub fn filter(&mut self, keys: impl Into<Keys>, value: impl Into<Operand>) -> &mut Self {
        self.equality(keys.into(), value.into(), false)
    }

    /// Negated [`Session::filter`].
    pub fn not(&mut self, keys: impl Into<Keys>, value: impl Into<Operand>) -> &mut Self {
        self.equality(keys.into(), value.into(), true)
    }

    fn equality(&mut self, keys: Keys, operand: Operand, negate: bool) -> &mut Self {
        if !self.bound() {
            return self;
        }
        match predicate::equality(&self.columns_of(keys), &operand, negate) {
            Ok(condition) => self.predicates.push(condition),
            Err(error) => self.fail(error),
        }
        self
    }

    pub fn like(&mut self, key: &str, pattern: &str) -> &mut Self {
        if self.bound() {
            let condition = predicate::like(&self.column(key), pattern);
            self.predicates.push(condition);
        }
        self
    }

    pub fn between(&mut self, key: &str, low: impl Into<Value>, high: impl Into<Value>) -> &mut Self {
        if self.bound() {
            let condition = predicate::between(&self.column(key), low.into(), high.into(), false);
            self.predicates.push(condition);
        }
        self
    }

    pub fn not_between(&mut self, key: &str, low: impl Into<Value>, high: impl Into<Value>) -> &mut Self {
        if self.bound() {
            let condition = predicate::between(&self.column(key), low.into(), high.into(), true);
            self.predicates.push(condition);
        }
        self
    }

    fn compare(&mut self, key: &str, operator: &str, value: Value) -> &mut Self {
        if self.bound() {
            let condition = predicate::comparison(&self.column(key), operator, value);
            self.predicates.push(condition);
        }
        self
    }

    pub fn greater(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.compare(key, ">", value.into())
    }

    pub fn less(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.compare(key, "<", value.into())
    }

    pub fn greater_or_equal(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.compare(key, ">=", value.into())
    }

    pub fn less_or_equal(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.compare(key, "<=", value.into())
    }

    /// Joins the next predicate with `OR` instead of `AND`.
    pub fn or(&mut self) -> &mut Self {
        if self.bound() {
            self.predicates.or();
        }
        self
    }

    pub fn and(&mut self) -> &mut Self {
        if self.bound() {
            self.predicates.and();
        }
        self
    }

    pub fn order_by_asc(&mut self, key: &str) -> &mut Self {
        if self.bound() {
            let column = self.column(key);
            self.predicates.order_by(&column, true);
        }
        self
    }

    pub fn order_by_desc(&mut self, key: &str) -> &mut Self {
        if self.bound() {
            let column = self.column(key);
            self.predicates.order_by(&column, false);
        }
        self
    }

    pub fn limit(&mut self, limit: i64) -> &mut Self {
        if self.bound() {
            self.predicates.limit(limit);
        }
        self
    }

    pub fn offset(&mut self, offset: i64) -> &mut Self {
        if self.bound() {
            self.predicates.offset(offset);
        }
        self
    }

    pub fn group(&mut self, keys: impl Into<Keys>) -> &mut Self {
        if self.bound() {
            let keys = match self.columns_of(keys.into()) {
                Keys::One(key) => vec![key],
                Keys::Many(keys) => keys,
            };
            self.predicates.group(&keys);
        }
        self
    }

    /// Restricts the columns read by `first`/`last`/`find` and written by `update`.
    pub fn select(&mut self, keys: impl Into<Keys>) -> &mut Self {
        if self.bound() {
            self.columns = match self.columns_of(keys.into()) {
                Keys::One(key) => vec![key],
                Keys::Many(keys) => keys,
            };
        }
        self
    }

    // ========================================================================
    // SQL rendering
    // ========================================================================

    /// The bound table, or the error a terminal operation must report.
    pub(crate) fn ready(&self) -> Result<&str> {
        if let Some(error) = &self.last_error {
            return Err(error.replay());
        }
        self.table.as_deref().ok_or(Error::TableNotSet)
    }

    fn projection(&self) -> String {
        if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
        }
    }

    fn select_sql(&self, predicates: &Predicates) -> Result<(String, Vec<Value>)> {
        let table = self.ready()?;
        let (where_sql, params) = predicates.where_sql();
        let sql = format!("SELECT {} FROM {}{where_sql}{}", self.projection(), quote(table), predicates.tail_sql());
        Ok((sql, params))
    }

    /// The `SELECT` statement `find` would run, with its parameters.
    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        self.select_sql(&self.predicates)
    }

    fn to_logical(&self, row: Record) -> Record {
        match &self.model {
            Some(meta) => meta.to_fields(row),
            None => row,
        }
    }

    fn to_physical(&self, record: Record) -> Record {
        match &self.model {
            Some(meta) => {
                record.into_iter().map(|(key, value)| (meta.column_for_field(&key).to_string(), value)).collect()
            }
            None => record,
        }
    }

    pub(crate) async fn fetch_rows(&self) -> Result<Vec<Record>> {
        let (sql, params) = self.to_sql()?;
        self.orm.database().fetch_all(&sql, &params).await
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Inserts one column map and returns the new row id.
    pub async fn insert(&self, record: Record) -> Result<i64> {
        let table = self.ready()?;
        let row = self.to_physical(record);
        insert_row(&self.orm, table, &row).await
    }

    /// Inserts column maps in multi-row statements and returns the inserted count.
    pub async fn insert_all(&self, records: Vec<Record>) -> Result<u64> {
        let table = self.ready()?;
        let rows: Vec<Record> = records.into_iter().map(|r| self.to_physical(r)).collect();

        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        if columns.is_empty() {
            for row in &rows {
                insert_row(&self.orm, table, row).await?;
            }
            return Ok(rows.len() as u64);
        }

        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let sql = format!(
                "INSERT INTO {} ({column_list}) VALUES {}",
                quote(table),
                vec![tuple.as_str(); chunk.len()].join(", ")
            );
            let params: Vec<Value> = chunk
                .iter()
                .flat_map(|row| columns.iter().map(|c| row.get(c).cloned().unwrap_or_default()))
                .collect();
            inserted += self.orm.database().execute(&sql, &params).await?.rows_affected;
        }
        Ok(inserted)
    }

    /// Inserts an entity instance and returns the new row id. A generated primary key is
    /// always replaced by the id the store assigned, a missing one is filled in with it.
    pub async fn insert_entity(&self, entity: &EntityRef) -> Result<i64> {
        let table = self.ready()?;
        let meta = self.orm.metadata().get(&entity.model())?;
        let row = meta.insert_columns(&entity.fields());
        let id = insert_row(&self.orm, table, &row).await?;
        let key_field = meta.primary_field().to_string();
        let generated = meta.primary_column().is_some_and(|c| c.is_generated());
        if generated || !entity.get(&key_field).is_present() {
            entity.set(key_field, id);
        }
        Ok(id)
    }

    /// Inserts several entity instances, returning how many were inserted.
    pub async fn insert_entities(&self, entities: &[EntityRef]) -> Result<u64> {
        for entity in entities {
            self.insert_entity(entity).await?;
        }
        Ok(entities.len() as u64)
    }

    /// Inserts a typed model instance and returns the new row id.
    pub async fn insert_model<T: Model>(&self, model: &T) -> Result<i64> {
        self.orm.metadata().register(&T::definition());
        self.insert_entity(&EntityRef::from_model(model)).await
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// First matching row, or an empty record when nothing matched.
    pub async fn first(&self) -> Result<Record> {
        let mut predicates = self.predicates.clone();
        predicates.limit(1);
        let (sql, params) = self.select_sql(&predicates)?;
        let row = self.orm.database().fetch_optional(&sql, &params).await?;
        Ok(row.map(|r| self.to_logical(r)).unwrap_or_default())
    }

    /// Last matching row, or an empty record when nothing matched.
    pub async fn last(&self) -> Result<Record> {
        let rows = self.fetch_rows().await?;
        Ok(rows.into_iter().last().map(|r| self.to_logical(r)).unwrap_or_default())
    }

    /// Copies the first matching row into `entity`. Returns whether a row matched.
    pub async fn first_into(&self, entity: &EntityRef) -> Result<bool> {
        let row = self.first().await?;
        if row.is_empty() {
            return Ok(false);
        }
        let fields = match self.orm.metadata().get(&entity.model()) {
            Ok(meta) => meta.to_fields(self.to_physical(row)),
            Err(_) => row,
        };
        entity.merge(fields);
        Ok(true)
    }

    /// First matching row as a typed model.
    pub async fn first_as<T: Model>(&self) -> Result<Option<T>> {
        let row = self.first().await?;
        if row.is_empty() {
            return Ok(None);
        }
        T::from_record(&row).map(Some)
    }

    /// All matching rows.
    pub async fn find(&self) -> Result<Vec<Record>> {
        let rows = self.fetch_rows().await?;
        Ok(rows.into_iter().map(|r| self.to_logical(r)).collect())
    }

    /// All matching rows as typed models.
    pub async fn find_as<T: Model>(&self) -> Result<Vec<T>> {
        self.find().await?.iter().map(T::from_record).collect()
    }

    /// All matching rows as entity instances of `model`.
    pub async fn find_entities(&self, model: &str) -> Result<Vec<EntityRef>> {
        let meta = self.orm.metadata().get(model)?;
        let rows = self.fetch_rows().await?;
        Ok(rows.into_iter().map(|row| EntityRef::from_record(model, meta.to_fields(row))).collect())
    }

    /// Number of matching rows, ignoring `limit` and `offset`.
    pub async fn count(&self) -> Result<i64> {
        let table = self.ready()?;
        let (where_sql, params) = self.predicates.where_sql();
        let sql = format!(
            "SELECT COUNT(*) AS total FROM (SELECT 1 FROM {}{where_sql}{})",
            quote(table),
            self.predicates.group_sql()
        );
        let row = self.orm.database().fetch_optional(&sql, &params).await?;
        Ok(row.and_then(|r| r.get("total").and_then(Value::as_i64)).unwrap_or(0))
    }

    // ========================================================================
    // Update / Delete
    // ========================================================================

    /// Applies `values` to every matching row and returns the number of rows affected.
    ///
    /// With a column selection, only selected columns are written. Tables with an
    /// `updated_at` column (or columns tagged update-time) get it stamped.
    pub async fn update(&self, values: Record) -> Result<u64> {
        let table = self.ready()?;
        let mut payload = self.to_physical(values);
        if !self.columns.is_empty() {
            payload.retain(|key, _| self.columns.contains(key));
        }
        if payload.is_empty() {
            return Ok(0);
        }

        let stamped: Vec<String> = match &self.model {
            Some(meta) => {
                meta.columns.iter().filter(|c| c.auto_update_time || c.name == "updated_at").map(|c| c.name.clone()).collect()
            }
            None => {
                let columns = self.orm.database().table_columns(table).await?;
                columns.into_iter().filter(|c| c.name == "updated_at").map(|c| c.name).collect()
            }
        };
        for column in stamped {
            payload.entry(column).or_insert_with(|| Value::Text(local_timestamp()));
        }

        let assignments = payload.keys().map(|c| format!("{} = ?", quote(c))).collect::<Vec<_>>().join(", ");
        let (where_sql, where_params) = self.predicates.where_sql();
        let sql = format!("UPDATE {} SET {assignments}{where_sql}", quote(table));
        let params: Vec<Value> = payload.into_values().chain(where_params).collect();
        Ok(self.orm.database().execute(&sql, &params).await?.rows_affected)
    }

    /// Deletes every matching row and returns the number of rows deleted.
    pub async fn delete(&self) -> Result<u64> {
        let table = self.ready()?;
        let (where_sql, params) = self.predicates.where_sql();
        let sql = format!("DELETE FROM {}{where_sql}", quote(table));
        Ok(self.orm.database().execute(&sql, &params).await?.rows_affected)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&self) -> Result<()> {
        self.orm.database().begin().await
    }

    pub async fn commit(&self) -> Result<()> {
        self.orm.database().commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.orm.database().rollback().await
    }
}

/// `INSERT` of one physical row; returns the row id the store reports.
pub(crate) async fn insert_row(orm: &Orm, table: &str, row: &Record) -> Result<i64> {
    let sql = if row.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote(table))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table),
            row.keys().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            vec!["?"; row.len()].join(", ")
        )
    };
    let params: Vec<Value> = row.values().cloned().collect();
    Ok(orm.database().execute(&sql, &params).await?.last_insert_id)
}
