use trellis_orm::{CascadeType, ColumnInfo, Database, FieldType, ModelDef, Orm, RelationDecl, Value};

async fn connect() -> Result<Orm, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
    Ok(Orm::new(db))
}

fn gauge_v1() -> ModelDef {
    ModelDef::new("Gauge")
        .table("gauges")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::text("reading"))
}

fn gauge_v2() -> ModelDef {
    ModelDef::new("GaugeV2")
        .table("gauges")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::integer("reading"))
        .column(ColumnInfo::text("unit").not_null())
        .column(ColumnInfo::text("checkedAt").update_time())
}

#[tokio::test]
async fn test_auto_migrate_is_cached() -> Result<(), Box<dyn std::error::Error>> {
    let orm = connect().await?;

    orm.auto_migrate(&gauge_v1(), false).await?;
    assert!(orm.schema().has_table("gauges").await?);

    let before = orm.database().statement_count();
    orm.auto_migrate(&gauge_v1(), false).await?;
    assert_eq!(orm.database().statement_count(), before);

    // Forcing bypasses the cache and finds nothing to change.
    orm.auto_migrate(&gauge_v1(), true).await?;
    assert!(orm.database().statement_count() > before);
    assert_eq!(orm.schema().table_info("gauges").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_create_table_ddl() -> Result<(), Box<dyn std::error::Error>> {
    let orm = connect().await?;
    let def = ModelDef::new("Reading")
        .table("readings")
        .column(ColumnInfo::integer("id").primary_key().auto_increment())
        .column(ColumnInfo::real("value").not_null())
        .column(ColumnInfo::text("createdAt").create_time());

    assert!(orm.schema().create_table(&def).await?);
    assert!(!orm.schema().create_table(&def).await?);

    let columns = orm.schema().table_info("readings").await?;
    let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "value", "created_at"]);
    assert!(columns[0].primary_key);
    assert!(columns[1].not_null);

    // The store fills the creation time itself.
    orm.raw("INSERT INTO readings (value) VALUES (?)").bind(1.5).execute().await?;
    let row = orm.table("readings").first().await?;
    assert!(row["createdAt"].as_str().is_some_and(|s| !s.is_empty()));
    Ok(())
}

#[tokio::test]
async fn test_alter_column_preserves_rows_and_casts() -> Result<(), Box<dyn std::error::Error>> {
    let orm = connect().await?;
    orm.auto_migrate(&gauge_v1(), false).await?;
    orm.table("gauges").insert(trellis_orm::record! { "reading" => "12" }).await?;
    orm.table("gauges").insert(trellis_orm::record! { "reading" => "7" }).await?;

    // The table was migrated in this process already, so the new shape needs `force`.
    orm.auto_migrate(&gauge_v2(), true).await?;

    let schema = orm.schema();
    let info = schema.table_info("gauges").await?;
    let reading = info.iter().find(|c| c.name == "reading").expect("reading column");
    assert_eq!(FieldType::from_declared(&reading.declared_type), FieldType::Integer);
    assert!(schema.has_column("gauges", "unit").await?);
    assert!(schema.has_column("gauges", "checked_at").await?);
    assert!(!schema.has_table("temp_gauges").await?);

    let rows = orm.session_of("GaugeV2").order_by_asc("id").find().await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["reading"], Value::Integer(12));
    assert_eq!(rows[1]["reading"], Value::Integer(7));
    assert_eq!(rows[0]["unit"], Value::Text(String::new()));
    assert!(rows[0]["checkedAt"].is_present());

    let kind = orm.raw("SELECT typeof(reading) AS kind FROM gauges LIMIT 1").fetch_scalar().await?;
    assert_eq!(kind, Value::from("integer"));
    Ok(())
}

#[tokio::test]
async fn test_drop_column_is_explicit() -> Result<(), Box<dyn std::error::Error>> {
    let orm = connect().await?;
    orm.raw("CREATE TABLE gauges (id INTEGER PRIMARY KEY AUTOINCREMENT, reading TEXT, legacy TEXT)").execute().await?;

    orm.auto_migrate(&gauge_v1(), false).await?;
    assert!(orm.schema().has_column("gauges", "legacy").await?);

    let dropped = orm.schema().drop_column(&gauge_v1()).await?;
    assert_eq!(dropped, ["legacy"]);
    assert!(!orm.schema().has_column("gauges", "legacy").await?);
    Ok(())
}

#[tokio::test]
async fn test_join_table_is_provisioned() -> Result<(), Box<dyn std::error::Error>> {
    let orm = connect().await?;
    let tag = || {
        ModelDef::new("Tag")
            .table("tags")
            .column(ColumnInfo::integer("id").primary_key().auto_increment())
            .column(ColumnInfo::text("label"))
    };
    let article = move || {
        ModelDef::new("Article")
            .table("articles")
            .column(ColumnInfo::integer("id").primary_key().auto_increment())
            .relation(RelationDecl::many_to_many("tags", trellis_orm::TargetRef::deferred(tag)).cascade([CascadeType::All]))
    };

    orm.auto_migrate(&article(), false).await?;

    let schema = orm.schema();
    assert!(orm.metadata().contains("Tag"));
    assert!(schema.has_table("article_tags").await?);
    let names: Vec<_> = schema.table_info("article_tags").await?.into_iter().map(|c| c.name).collect();
    assert_eq!(names, ["id", "article_id", "tag_id", "created_at"]);

    let indexes = orm.database().table_indexes("article_tags").await?;
    assert!(indexes.iter().any(|i| i == "idx_article_tags_article_id"));
    assert!(indexes.iter().any(|i| i == "idx_article_tags_tag_id"));

    orm.raw("INSERT INTO article_tags (article_id, tag_id) VALUES (1, 2)").execute().await?;
    let duplicate = orm.raw("INSERT INTO article_tags (article_id, tag_id) VALUES (1, 2)").execute().await;
    assert!(duplicate.is_err());
    Ok(())
}

#[tokio::test]
async fn test_rename_and_drop_table() -> Result<(), Box<dyn std::error::Error>> {
    let orm = connect().await?;
    let schema = orm.schema();
    orm.auto_migrate(&gauge_v1(), false).await?;

    schema.rename_table("gauges", "meters").await?;
    assert!(!schema.has_table("gauges").await?);
    assert!(schema.has_table("meters").await?);

    // The cache forgot the renamed table, so migrating recreates it.
    orm.auto_migrate(&gauge_v1(), false).await?;
    assert!(schema.has_table("gauges").await?);

    schema.drop_table("meters").await?;
    assert!(!schema.has_table("meters").await?);
    Ok(())
}
