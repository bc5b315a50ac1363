use trellis_orm::{record, ColumnInfo, Database, Error, ModelDef, Orm, Record, RelationDecl, Value};

fn customer() -> ModelDef {
    ModelDef::new("Customer")
        .table("customers")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::text("name"))
        .relation(RelationDecl::has_many("orders", "Order").foreign_key("customer_id"))
}

fn order() -> ModelDef {
    ModelDef::new("Order")
        .table("orders")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::integer("customerId").column("customer_id"))
        .column(ColumnInfo::text("status"))
        .relation(RelationDecl::belongs_to("customer", "Customer").foreign_key("customer_id"))
        .relation(RelationDecl::has_many("items", "OrderItem").foreign_key("order_id"))
}

fn order_item() -> ModelDef {
    ModelDef::new("OrderItem")
        .table("order_items")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::integer("order_id"))
        .column(ColumnInfo::integer("product_id"))
        .column(ColumnInfo::integer("quantity"))
        .relation(RelationDecl::belongs_to("product", "Product").foreign_key("product_id"))
}

fn product() -> ModelDef {
    ModelDef::new("Product")
        .table("products")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::text("title"))
}

fn student() -> ModelDef {
    ModelDef::new("Student")
        .table("students")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::text("name"))
        .relation(RelationDecl::many_to_many("courses", "Course"))
}

fn course() -> ModelDef {
    ModelDef::new("Course")
        .table("courses")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::text("title"))
}

/// Two customers, 50 orders alternating between them, two items per order and three
/// products shared by the items.
async fn setup() -> Result<Orm, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
    let orm = Orm::new(db);
    orm.migrator()
        .register_def(customer)
        .register_def(order)
        .register_def(order_item)
        .register_def(product)
        .register_def(student)
        .register_def(course)
        .run()
        .await?;

    orm.table("customers").insert_all(vec![record! { "name" => "ada" }, record! { "name" => "grace" }]).await?;
    orm.table("products")
        .insert_all(vec![record! { "title" => "pen" }, record! { "title" => "ink" }, record! { "title" => "nib" }])
        .await?;

    let orders: Vec<Record> = (0..50)
        .map(|i| record! { "customer_id" => 1 + i % 2, "status" => if i < 10 { "open" } else { "closed" } })
        .collect();
    orm.table("orders").insert_all(orders).await?;

    let items: Vec<Record> = (1..=50)
        .flat_map(|order_id| {
            [
                record! { "order_id" => order_id, "product_id" => 1 + order_id % 3, "quantity" => 1 },
                record! { "order_id" => order_id, "product_id" => 1 + (order_id + 1) % 3, "quantity" => 2 },
            ]
        })
        .collect();
    orm.table("order_items").insert_all(items).await?;
    Ok(orm)
}

#[tokio::test]
async fn test_has_many_preload_is_one_query() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let before = orm.database().statement_count();
    let orders = orm.table("orders").with("items").find_with_relations().await?;
    assert_eq!(orm.database().statement_count() - before, 2);

    assert_eq!(orders.len(), 50);
    for order in &orders {
        let items = order.many("items");
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.get("order_id") == order.get("id")));
    }
    Ok(())
}

#[tokio::test]
async fn test_nested_paths_load_level_by_level() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let before = orm.database().statement_count();
    let orders = orm
        .table("orders")
        .filter("status", "open")
        .preload(&["items", "items.product", "customer"])
        .find_with_relations()
        .await?;
    // orders, customers, items, products
    assert_eq!(orm.database().statement_count() - before, 4);

    assert_eq!(orders.len(), 10);
    for order in &orders {
        let customer = order.one("customer").expect("customer attached");
        assert_eq!(customer.get("id"), order.get("customerId"));
        for item in order.many("items") {
            let product = item.one("product").expect("product attached");
            assert_eq!(product.get("id"), item.get("product_id"));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_belongs_to_shares_parents() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let customers = orm.table("customers").with("orders").find_with_relations().await?;
    assert_eq!(customers.len(), 2);
    assert_eq!(customers[0].many("orders").len(), 25);
    assert_eq!(customers[1].many("orders").len(), 25);

    // A dangling foreign key leaves the relation empty.
    orm.table("orders").insert(record! { "customer_id" => 99, "status" => "lost" }).await?;
    let orphan = orm.table("orders").filter("status", "lost").with("customer").first_with_relations().await?;
    let orphan = orphan.expect("orphan order");
    assert!(orphan.one("customer").is_none());
    Ok(())
}

#[tokio::test]
async fn test_many_to_many_preload() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    orm.table("students").insert_all(vec![record! { "name" => "kim" }, record! { "name" => "lee" }]).await?;
    orm.table("courses")
        .insert_all(vec![record! { "title" => "algebra" }, record! { "title" => "botany" }, record! { "title" => "chess" }])
        .await?;
    orm.table("course_students")
        .insert_all(vec![
            record! { "student_id" => 1, "course_id" => 1 },
            record! { "student_id" => 1, "course_id" => 3 },
            record! { "student_id" => 2, "course_id" => 2 },
        ])
        .await?;

    let before = orm.database().statement_count();
    let students = orm.table("students").order_by_asc("id").with("courses").find_with_relations().await?;
    assert_eq!(orm.database().statement_count() - before, 2);

    let titles = |i: usize| {
        let mut titles: Vec<Value> = students[i].many("courses").iter().map(|c| c.get("title")).collect();
        titles.sort_by_key(|t| t.to_string());
        titles
    };
    assert_eq!(titles(0), [Value::from("algebra"), Value::from("chess")]);
    assert_eq!(titles(1), [Value::from("botany")]);
    // The synthetic owner column does not leak into the target rows.
    assert!(students[0].many("courses").iter().all(|c| c.fields().len() == 2));
    Ok(())
}

#[tokio::test]
async fn test_preload_needs_a_model() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;
    orm.raw("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)").execute().await?;

    let mut session = orm.table("notes");
    session.with("author");
    assert!(matches!(session.last_error(), Some(Error::Configuration(_))));
    assert!(session.find_with_relations().await.is_err());

    let unknown = orm.table("orders").with("warehouse").find_with_relations().await;
    assert!(unknown.is_err());
    Ok(())
}
