use trellis_orm::{
    record, CascadeType, Database, Error, FieldType, Model, Orm, Pagination, RelationKind, TargetRef,
};

#[derive(Debug, Clone, Default, Model, PartialEq)]
#[orm(table = "audits")]
struct Audit {
    #[orm(primary_key, auto_increment)]
    id: Option<i64>,
    #[orm(create_time)]
    created_at: Option<String>,
    #[orm(update_time)]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Model, PartialEq)]
#[orm(table = "invoices")]
#[orm(belongs_to(target = Customer, foreign_key = "customer_id"))]
#[orm(has_many(name = "lines", target = "InvoiceLine", foreign_key = "invoice_id", cascade = "create, delete", lazy = false))]
struct Invoice {
    #[orm(base)]
    audit: Audit,
    number: String,
    amount: f64,
    paid: bool,
    customer_id: Option<i64>,
    #[orm(column = "note_text")]
    note: Option<String>,
    #[orm(skip)]
    scratch: Vec<String>,
}

#[derive(Debug, Clone, Default, Model, PartialEq)]
struct Customer {
    #[orm(primary_key, auto_increment)]
    id: Option<i64>,
    name: String,
}

#[derive(Debug, Clone, Default, Model, PartialEq)]
struct InvoiceLine {
    #[orm(primary_key, auto_increment)]
    id: Option<i64>,
    invoice_id: i64,
    #[orm(storage = "text")]
    code: i64,
}

async fn setup() -> Result<Orm, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
    let orm = Orm::new(db);
    orm.migrator().register::<Customer>().register::<InvoiceLine>().register::<Invoice>().run().await?;
    Ok(orm)
}

fn invoice(number: &str, amount: f64) -> Invoice {
    Invoice { number: number.to_string(), amount, ..Default::default() }
}

#[test]
fn test_definition_composes_base_columns() {
    let columns = Invoice::columns();
    let fields: Vec<_> = columns.iter().map(|c| c.field.as_str()).collect();
    assert_eq!(fields, ["id", "created_at", "updated_at", "number", "amount", "paid", "customer_id", "note"]);

    assert!(columns[0].primary_key && columns[0].auto_increment);
    assert!(columns[1].auto_create_time);
    assert!(columns[2].auto_update_time);
    assert_eq!(columns[4].field_type, FieldType::Real);
    assert_eq!(columns[5].field_type, FieldType::Integer);
    assert!(columns[3].not_null && !columns[7].not_null);
    assert_eq!(columns[7].name, "note_text");

    assert_eq!(Invoice::table_name(), "invoices");
    assert_eq!(Customer::table_name(), "customer");
    assert_eq!(InvoiceLine::columns()[2].field_type, FieldType::Text);
}

#[test]
fn test_definition_declares_relations() {
    let def = Invoice::definition();
    assert_eq!(def.relations.len(), 2);

    let customer = &def.relations[0];
    assert_eq!(customer.name, "customer");
    assert_eq!(customer.kind, RelationKind::BelongsTo);
    assert_eq!(customer.foreign_key.as_deref(), Some("customer_id"));
    assert!(customer.lazy);
    assert!(matches!(customer.target, TargetRef::Deferred(_)));

    let lines = &def.relations[1];
    assert_eq!(lines.name, "lines");
    assert_eq!(lines.kind, RelationKind::HasMany);
    assert_eq!(lines.cascade, [CascadeType::Create, CascadeType::Delete]);
    assert!(!lines.lazy);
    assert!(matches!(&lines.target, TargetRef::Named(name) if name == "InvoiceLine"));
}

#[tokio::test]
async fn test_insert_and_read_back() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;

    let mut draft = invoice("INV-1", 120.5);
    draft.note = Some("net 30".to_string());
    draft.scratch = vec!["not stored".to_string()];
    let id = orm.model::<Invoice>().insert_model(&draft).await?;

    let stored = orm.model::<Invoice>().filter("number", "INV-1").first_as::<Invoice>().await?;
    let stored = stored.ok_or("invoice not found")?;
    assert_eq!(stored.audit.id, Some(id));
    assert!(stored.audit.created_at.is_some());
    assert!(stored.audit.updated_at.is_some());
    assert_eq!(stored.amount, 120.5);
    assert!(!stored.paid);
    assert_eq!(stored.note.as_deref(), Some("net 30"));
    assert!(stored.scratch.is_empty());

    let raw = orm.raw("SELECT note_text FROM invoices WHERE id = ?").bind(id).fetch_scalar().await?;
    assert_eq!(raw, trellis_orm::Value::from("net 30"));
    Ok(())
}

#[tokio::test]
async fn test_decode_error_names_the_field() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;
    orm.raw("INSERT INTO invoices (number, amount, paid) VALUES ('INV-X', 1.0, 'maybe')").execute().await?;

    let result = orm.model::<Invoice>().find_as::<Invoice>().await;
    assert!(matches!(result, Err(Error::Decode { ref field, .. }) if field == "paid"));
    Ok(())
}

#[tokio::test]
async fn test_entity_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;
    let customer = Customer { id: None, name: "initech".to_string() };
    let entity = trellis_orm::EntityRef::from_model(&customer);
    orm.create(&entity).await?;

    let back: Customer = entity.to_model()?;
    assert_eq!(back.name, "initech");
    assert!(back.id.is_some());
    assert!(entity.to_model::<Invoice>().is_err());
    Ok(())
}

#[tokio::test]
async fn test_pagination() -> Result<(), Box<dyn std::error::Error>> {
    let orm = setup().await?;
    let rows = (1..=25).map(|n| record! { "number" => format!("INV-{n:02}"), "amount" => n, "paid" => n % 2 == 0 });
    orm.table("invoices").insert_all(rows.collect()).await?;

    let mut session = orm.model::<Invoice>();
    session.order_by_asc("number");
    let first = Pagination::new(0, 10).paginate(&mut session).await?;
    assert_eq!(first.total, 25);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.data.len(), 10);
    assert_eq!(first.data[0]["number"], trellis_orm::Value::from("INV-01"));

    let mut session = orm.model::<Invoice>();
    session.order_by_asc("number");
    let last = Pagination::new(2, 10).paginate_as::<Invoice>(&mut session).await?;
    assert_eq!(last.data.len(), 5);
    assert_eq!(last.data[0].number, "INV-21");

    let mut session = orm.model::<Invoice>();
    session.filter("paid", true);
    let paid = Pagination::new(0, 500).paginate(&mut session).await?;
    assert_eq!(paid.limit, 10);
    assert_eq!(paid.total, 12);
    assert_eq!(paid.total_pages, 2);

    let mut session = orm.model::<Invoice>();
    let beyond = Pagination::new(7, 10).paginate(&mut session).await?;
    assert!(beyond.data.is_empty());
    assert_eq!(beyond.total, 25);
    Ok(())
}
