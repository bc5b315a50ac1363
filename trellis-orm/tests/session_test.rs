use trellis_orm::{record, ColumnInfo, Database, Error, ModelDef, Orm, Value};

fn customer() -> ModelDef {
    ModelDef::new("Customer")
        .table("customers")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::text("name").not_null())
        .column(ColumnInfo::text("email"))
        .column(ColumnInfo::integer("age"))
        .column(ColumnInfo::text("updatedAt").update_time())
}

async fn setup() -> Result<Orm, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
    let orm = Orm::new(db);
    orm.auto_migrate(&customer(), false).await?;

    let session = orm.table("customers");
    session
        .insert_all(vec![
            record! { "name" => "Alice", "email" => "alice@example.com", "age" => 30 },
            record! { "name" => "Bob", "age" => 17 },
            record! { "name" => "Carol", "email" => "carol@example.com", "age" => 45 },
            record! { "name" => "Dave", "email" => "dave@example.org", "age" => 30 },
        ])
        .await?;
    Ok(orm)
}

fn names(rows: &[trellis_orm::Record]) -> Vec<String> {
    rows.iter().filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string)).collect()
}

#[tokio::test]
async fn test_unbound_session_is_sticky() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;
    let before = orm.database().statement_count();

    let mut session = orm.session();
    session.filter("name", "Alice").greater("age", 1).order_by_asc("id").limit(1);
    assert!(matches!(session.last_error(), Some(Error::TableNotSet)));

    assert!(matches!(session.find().await, Err(Error::TableNotSet)));
    assert!(matches!(session.insert(record! { "name" => "Eve" }).await, Err(Error::TableNotSet)));
    assert!(matches!(session.delete().await, Err(Error::TableNotSet)));
    assert_eq!(orm.database().statement_count(), before);
    assert_eq!(orm.table("customers").count().await?, 4);

    // Binding a table is what clears the error.
    session.table("customers").filter("name", "Alice");
    assert!(session.last_error().is_none());
    assert_eq!(session.find().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_filter_shapes() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let rows = orm.table("customers").filter("age", 30).order_by_asc("id").find().await?;
    assert_eq!(names(&rows), ["Alice", "Dave"]);

    let rows = orm.table("customers").filter("email", Value::Null).find().await?;
    assert_eq!(names(&rows), ["Bob"]);

    let rows = orm.table("customers").not("email", None::<String>).find().await?;
    assert_eq!(rows.len(), 3);

    let rows = orm.table("customers").filter("name", vec!["Bob", "Carol"]).order_by_asc("id").find().await?;
    assert_eq!(names(&rows), ["Bob", "Carol"]);

    let rows = orm.table("customers").not("name", vec!["Bob", "Carol"]).order_by_asc("id").find().await?;
    assert_eq!(names(&rows), ["Alice", "Dave"]);

    let rows = orm.table("customers").filter(vec!["name", "age"], vec![Value::from("Dave"), Value::from(30)]).find().await?;
    assert_eq!(names(&rows), ["Dave"]);

    let mut session = orm.table("customers");
    session.filter(vec!["name", "age"], vec![Value::from("Dave")]);
    assert!(matches!(session.last_error(), Some(Error::Configuration(_))));
    Ok(())
}

#[tokio::test]
async fn test_comparisons_and_paging() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let rows = orm.table("customers").greater_or_equal("age", 30).less("age", 45).find().await?;
    assert_eq!(rows.len(), 2);

    let rows = orm.table("customers").between("age", 18, 40).order_by_desc("name").find().await?;
    assert_eq!(names(&rows), ["Dave", "Alice"]);

    let rows = orm.table("customers").not_between("age", 18, 40).order_by_asc("age").find().await?;
    assert_eq!(names(&rows), ["Bob", "Carol"]);

    let rows = orm.table("customers").like("email", "%@example.com").or().less_or_equal("age", 17).find().await?;
    assert_eq!(rows.len(), 3);

    let rows = orm.table("customers").order_by_asc("id").offset(1).limit(2).find().await?;
    assert_eq!(names(&rows), ["Bob", "Carol"]);

    let rows = orm.table("customers").order_by_asc("id").offset(3).find().await?;
    assert_eq!(names(&rows), ["Dave"]);

    let groups = orm.table("customers").group("age").count().await?;
    assert_eq!(groups, 3);
    Ok(())
}

#[tokio::test]
async fn test_first_last_and_select() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let first = orm.table("customers").order_by_asc("id").first().await?;
    assert_eq!(first["name"], Value::from("Alice"));
    let last = orm.table("customers").order_by_asc("id").last().await?;
    assert_eq!(last["name"], Value::from("Dave"));

    let none = orm.table("customers").filter("name", "Zed").first().await?;
    assert!(none.is_empty());

    let projected = orm.table("customers").select(vec!["name", "age"]).filter("name", "Carol").first().await?;
    assert_eq!(projected.len(), 2);
    assert_eq!(projected["age"], Value::Integer(45));

    let entity = trellis_orm::EntityRef::new("Customer");
    assert!(orm.table("customers").filter("name", "Bob").first_into(&entity).await?);
    assert_eq!(entity.get("age"), Value::Integer(17));
    Ok(())
}

#[tokio::test]
async fn test_update_and_delete() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let updated = orm.table("customers").filter("age", 30).update(record! { "email" => "x@example.net" }).await?;
    assert_eq!(updated, 2);
    let row = orm.table("customers").filter("name", "Alice").first().await?;
    assert_eq!(row["email"], Value::from("x@example.net"));
    assert!(row["updatedAt"].is_present());

    // A column selection limits what is written.
    let updated = orm
        .table("customers")
        .select("age")
        .filter("name", "Bob")
        .update(record! { "age" => 18, "name" => "Robert" })
        .await?;
    assert_eq!(updated, 1);
    let bob = orm.table("customers").filter("age", 18).first().await?;
    assert_eq!(bob["name"], Value::from("Bob"));

    let deleted = orm.table("customers").less("age", 40).delete().await?;
    assert_eq!(deleted, 3);
    assert_eq!(orm.table("customers").count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_transactions_do_not_nest() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;
    let session = orm.table("customers");

    session.begin().await?;
    assert!(matches!(session.begin().await, Err(Error::State(_))));
    session.insert(record! { "name" => "Eve", "age" => 22 }).await?;
    assert_eq!(session.count().await?, 5);
    session.rollback().await?;
    assert_eq!(session.count().await?, 4);

    assert!(matches!(session.commit().await, Err(Error::State(_))));

    session.begin().await?;
    session.insert(record! { "name" => "Eve", "age" => 22 }).await?;
    session.commit().await?;
    assert_eq!(session.count().await?, 5);
    Ok(())
}

#[tokio::test]
async fn test_raw_queries() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let rows = orm.raw("SELECT name FROM customers WHERE age > ? ORDER BY name").bind(20).fetch_all().await?;
    assert_eq!(names(&rows), ["Alice", "Carol", "Dave"]);

    let total = orm.raw("SELECT SUM(age) AS total FROM customers").fetch_scalar().await?;
    assert_eq!(total, Value::Integer(122));

    let missing = orm.raw("SELECT name FROM customers WHERE id = ?").bind(99).fetch_optional().await?;
    assert!(missing.is_none());
    Ok(())
}
