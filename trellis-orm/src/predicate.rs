//! # Predicate Module
//!
//! Accumulates `WHERE` conditions, ordering, grouping and paging for a session and
//! renders them as SQL with positional parameters.

use crate::naming::quote;
use crate::{Error, Result, Value};

/// Column side of a filter: one key or several.
#[derive(Debug, Clone, PartialEq)]
pub enum Keys {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for Keys {
    fn from(key: &str) -> Self {
        Keys::One(key.to_string())
    }
}

impl From<String> for Keys {
    fn from(key: String) -> Self {
        Keys::One(key)
    }
}

impl From<Vec<&str>> for Keys {
    fn from(keys: Vec<&str>) -> Self {
        Keys::Many(keys.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Keys::Many(keys)
    }
}

impl<const N: usize> From<[&str; N]> for Keys {
    fn from(keys: [&str; N]) -> Self {
        Keys::Many(keys.iter().map(|k| k.to_string()).collect())
    }
}

/// Value side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Null,
    Scalar(Value),
    List(Vec<Value>),
}

macro_rules! impl_scalar_operand {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Operand {
                fn from(value: $t) -> Self {
                    Operand::Scalar(Value::from(value))
                }
            }
        )*
    };
}

impl_scalar_operand!(i8, i16, i32, i64, u8, u16, u32, bool, f32, f64, String, &str);

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        if value.is_null() { Operand::Null } else { Operand::Scalar(value) }
    }
}

impl From<&Value> for Operand {
    fn from(value: &Value) -> Self {
        Operand::from(value.clone())
    }
}

macro_rules! impl_list_operand {
    ($($t:ty),*) => {
        $(
            impl From<Vec<$t>> for Operand {
                fn from(values: Vec<$t>) -> Self {
                    Operand::List(values.into_iter().map(Value::from).collect())
                }
            }
        )*
    };
}

impl_list_operand!(Value, i32, i64, String, &str);

impl<T: Into<Value>> From<Option<T>> for Operand {
    fn from(value: Option<T>) -> Self {
        value.map_or(Operand::Null, |v| Operand::Scalar(v.into()))
    }
}

/// A rendered condition: SQL text plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Condition {
    fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self { sql: sql.into(), params }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn single(key: &str, operand: &Operand, negate: bool) -> Condition {
    let column = quote(key);
    match (operand, negate) {
        (Operand::Null, false) => Condition::new(format!("{column} IS NULL"), vec![]),
        (Operand::Null, true) => Condition::new(format!("{column} IS NOT NULL"), vec![]),
        (Operand::Scalar(v), false) => Condition::new(format!("{column} = ?"), vec![v.clone()]),
        (Operand::Scalar(v), true) => Condition::new(format!("{column} <> ?"), vec![v.clone()]),
        // An empty set matches nothing, and its negation matches everything.
        (Operand::List(values), false) if values.is_empty() => Condition::new("1 = 0", vec![]),
        (Operand::List(values), true) if values.is_empty() => Condition::new("1 = 1", vec![]),
        (Operand::List(values), false) => {
            Condition::new(format!("{column} IN ({})", placeholders(values.len())), values.clone())
        }
        (Operand::List(values), true) => {
            Condition::new(format!("{column} NOT IN ({})", placeholders(values.len())), values.clone())
        }
    }
}

/// Renders an equality filter (`negate = false`) or its negation, dispatching on the
/// shape of the arguments.
pub fn equality(keys: &Keys, operand: &Operand, negate: bool) -> Result<Condition> {
    match keys {
        Keys::One(key) => Ok(single(key, operand, negate)),
        Keys::Many(keys) if keys.is_empty() => Err(Error::config("filter needs at least one key")),
        Keys::Many(keys) if keys.len() == 1 => Ok(single(&keys[0], operand, negate)),
        Keys::Many(keys) => {
            let parts: Vec<Condition> = match operand {
                Operand::List(values) => {
                    if values.len() != keys.len() {
                        return Err(Error::config(format!(
                            "{} keys given with {} values",
                            keys.len(),
                            values.len()
                        )));
                    }
                    keys.iter()
                        .zip(values)
                        .map(|(k, v)| single(k, &Operand::from(v), false))
                        .collect()
                }
                other => keys.iter().map(|k| single(k, other, false)).collect(),
            };
            let sql = parts.iter().map(|c| c.sql.as_str()).collect::<Vec<_>>().join(" AND ");
            let params = parts.into_iter().flat_map(|c| c.params).collect();
            let sql = if negate { format!("NOT ({sql})") } else { format!("({sql})") };
            Ok(Condition::new(sql, params))
        }
    }
}

pub fn comparison(key: &str, operator: &str, value: Value) -> Condition {
    Condition::new(format!("{} {operator} ?", quote(key)), vec![value])
}

pub fn like(key: &str, pattern: &str) -> Condition {
    Condition::new(format!("{} LIKE ?", quote(key)), vec![Value::from(pattern)])
}

pub fn between(key: &str, low: Value, high: Value, negate: bool) -> Condition {
    let keyword = if negate { "NOT BETWEEN" } else { "BETWEEN" };
    Condition::new(format!("{} {keyword} ? AND ?", quote(key)), vec![low, high])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Connector {
    #[default]
    And,
    Or,
}

/// The predicate accumulator of a session.
#[derive(Debug, Clone, Default)]
pub struct Predicates {
    conditions: Vec<(Connector, Condition)>,
    next: Connector,
    order: Vec<String>,
    group: Vec<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Predicates {
    pub fn push(&mut self, condition: Condition) {
        let connector = std::mem::take(&mut self.next);
        self.conditions.push((connector, condition));
    }

    /// Joins the next condition with `OR`.
    pub fn or(&mut self) {
        self.next = Connector::Or;
    }

    pub fn and(&mut self) {
        self.next = Connector::And;
    }

    pub fn order_by(&mut self, key: &str, ascending: bool) {
        let direction = if ascending { "ASC" } else { "DESC" };
        self.order.push(format!("{} {direction}", quote(key)));
    }

    pub fn group(&mut self, keys: &[String]) {
        self.group.extend(keys.iter().map(|k| quote(k)));
    }

    pub fn limit(&mut self, limit: i64) {
        self.limit = Some(limit);
    }

    pub fn offset(&mut self, offset: i64) {
        self.offset = Some(offset);
    }

    pub(crate) fn clear_paging(&mut self) -> (Option<i64>, Option<i64>) {
        (self.limit.take(), self.offset.take())
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// ` WHERE ...` (leading space included), or an empty string.
    pub fn where_sql(&self) -> (String, Vec<Value>) {
        if self.conditions.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut sql = String::from(" WHERE ");
        let mut params = Vec::new();
        for (index, (connector, condition)) in self.conditions.iter().enumerate() {
            if index > 0 {
                sql.push_str(match connector {
                    Connector::And => " AND ",
                    Connector::Or => " OR ",
                });
            }
            sql.push_str(&condition.sql);
            params.extend(condition.params.iter().cloned());
        }
        (sql, params)
    }

    /// ` GROUP BY ...`, or an empty string.
    pub fn group_sql(&self) -> String {
        if self.group.is_empty() { String::new() } else { format!(" GROUP BY {}", self.group.join(", ")) }
    }

    /// `GROUP BY`, `ORDER BY`, `LIMIT` and `OFFSET` clauses.
    pub fn tail_sql(&self) -> String {
        let mut sql = self.group_sql();
        if !self.order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.order.join(", ")));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_null_and_list_dispatch() {
        let eq = equality(&"age".into(), &Operand::from(3), false).unwrap();
        assert_eq!(eq.sql, "\"age\" = ?");
        assert_eq!(eq.params, vec![Value::Integer(3)]);

        let null = equality(&"age".into(), &Operand::Null, true).unwrap();
        assert_eq!(null.sql, "\"age\" IS NOT NULL");

        let list = equality(&"id".into(), &Operand::from(vec![1, 2, 3]), false).unwrap();
        assert_eq!(list.sql, "\"id\" IN (?, ?, ?)");

        let empty = equality(&"id".into(), &Operand::List(vec![]), false).unwrap();
        assert_eq!(empty.sql, "1 = 0");
    }

    #[test]
    fn parallel_keys_pair_up() {
        let keys = Keys::from(["a", "b"]);
        let pair = equality(&keys, &Operand::from(vec![Value::from(1), Value::from("x")]), false).unwrap();
        assert_eq!(pair.sql, "(\"a\" = ? AND \"b\" = ?)");
        assert_eq!(pair.params.len(), 2);

        let nulls = equality(&keys, &Operand::Null, false).unwrap();
        assert_eq!(nulls.sql, "(\"a\" IS NULL AND \"b\" IS NULL)");

        assert!(equality(&keys, &Operand::from(vec![1]), false).is_err());
    }

    #[test]
    fn or_applies_to_the_next_condition_only() {
        let mut predicates = Predicates::default();
        predicates.push(comparison("a", ">", Value::from(1)));
        predicates.or();
        predicates.push(like("b", "x%"));
        predicates.push(between("c", Value::from(1), Value::from(9), true));
        let (sql, params) = predicates.where_sql();
        assert_eq!(sql, " WHERE \"a\" > ? OR \"b\" LIKE ? AND \"c\" NOT BETWEEN ? AND ?");
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn offset_without_limit() {
        let mut predicates = Predicates::default();
        predicates.order_by("id", false);
        predicates.offset(20);
        assert_eq!(predicates.tail_sql(), " ORDER BY \"id\" DESC LIMIT -1 OFFSET 20");
    }
}
