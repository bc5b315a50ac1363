//! Naming conventions shared by the metadata, relation and migration layers.

use heck::ToSnakeCase;

/// Converts a type or field name into its physical (snake_case) spelling.
pub fn snake_case(name: &str) -> String {
    name.strip_prefix("r#").unwrap_or(name).to_snake_case()
}

/// Drops a single trailing `s`: `orders` -> `order`, `address` -> `addres`.
pub fn singular(table: &str) -> &str {
    table.strip_suffix('s').unwrap_or(table)
}

/// Default foreign key column referencing `table`: `<snake_case(table)>_id`.
pub fn foreign_key_for(table: &str) -> String {
    format!("{}_id", snake_case(table))
}

/// Default join-table key column for `table`: `<singular(table)>_id`.
pub fn join_key_for(table: &str) -> String {
    format!("{}_id", singular(&snake_case(table)))
}

/// Default join table name for a many-to-many pair.
///
/// Both names are singularized and sorted, joined with `_` and pluralized, so the
/// result does not depend on which side declares the relation.
pub fn join_table_for(left: &str, right: &str) -> String {
    let left = snake_case(left);
    let right = snake_case(right);
    let mut parts = [singular(&left), singular(&right)];
    parts.sort_unstable();
    format!("{}s", parts.join("_"))
}

/// Quotes an identifier for use in generated SQL.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_strips_raw_prefix() {
        assert_eq!(snake_case("OrderItem"), "order_item");
        assert_eq!(snake_case("r#type"), "type");
    }

    #[test]
    fn join_table_is_order_independent() {
        assert_eq!(join_table_for("students", "courses"), "course_students");
        assert_eq!(join_table_for("courses", "students"), "course_students");
        assert_eq!(join_table_for("tag", "posts"), "post_tags");
    }

    #[test]
    fn default_keys() {
        assert_eq!(foreign_key_for("orders"), "orders_id");
        assert_eq!(foreign_key_for("User"), "user_id");
        assert_eq!(join_key_for("students"), "student_id");
    }

    #[test]
    fn quote_escapes_embedded_quotes() {
        assert_eq!(quote("name"), "\"name\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }
}
