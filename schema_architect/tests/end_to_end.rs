use pretty_assertions::assert_eq;
use std::sync::Arc;

use schema_architect::config::{Config, DatabaseConfig, GeneratorConfig, OutputFormat};
use schema_architect::schema::dialect::{Dialect, GENERIC, POSTGRES};
use schema_architect::schema::generator::WarningKind;
use schema_architect::schema::source::{ColumnRecord, ImportedKeyRecord, InMemorySource, TableRecord};
use schema_architect::schema::tree::TreeEvent;
use schema_architect::schema::type_map::TypeMap;
use schema_architect::schema::types::{type_codes, Column, NewRelationship, TableCoordinates, TableKind};
use schema_architect::{compare, ArchitectClient, Comparison, DdlGenerator, DiffType, Error, LiveDatabase, SchemaTree};

fn generic() -> DdlGenerator {
    DdlGenerator::new(GENERIC).with_type_map(TypeMap::ansi())
}

/// `T(id PK, name)` and `U(id PK, t_id)`
fn base_tree(name: &str) -> SchemaTree {
    let mut tree = SchemaTree::new(name);
    let t = tree.add_table(tree.root(), "T", TableKind::Table).unwrap();
    tree.add_column(t, Column::new("id", type_codes::INTEGER).primary_key(1)).unwrap();
    tree.add_column(t, Column::new("name", type_codes::VARCHAR).precision(80).nullable(true))
        .unwrap();
    let u = tree.add_table(tree.root(), "U", TableKind::Table).unwrap();
    tree.add_column(u, Column::new("id", type_codes::INTEGER).primary_key(1)).unwrap();
    tree.add_column(u, Column::new("t_id", type_codes::INTEGER).nullable(true)).unwrap();
    tree
}

fn link(tree: &mut SchemaTree, name: &str, fk_column: &str) {
    let t = tree.find_table(None, None, "T").unwrap();
    let u = tree.find_table(None, None, "U").unwrap();
    let id = tree.find_column(t, "id").unwrap();
    let fk = tree.find_column(u, fk_column).unwrap();
    tree.add_relationship(NewRelationship::new(name, t, u).map(id, fk)).unwrap();
}

#[test]
fn test_added_column_and_relationship_migration() {
    let left = base_tree("before");
    let mut right = base_tree("after");
    let t = right.find_table(None, None, "T").unwrap();
    right
        .add_column(t, Column::new("email", type_codes::VARCHAR).precision(120).nullable(true))
        .unwrap();
    link(&mut right, "U_T_fk", "t_id");

    let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
    let summary: Vec<(String, DiffType)> = chunks
        .iter()
        .map(|c| (c.resolve(&left, &right).unwrap().name().to_string(), c.kind))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("T".to_string(), DiffType::Same),
            ("id".to_string(), DiffType::Same),
            ("name".to_string(), DiffType::Same),
            ("email".to_string(), DiffType::RightOnly),
            ("U".to_string(), DiffType::Same),
            ("id".to_string(), DiffType::Same),
            ("t_id".to_string(), DiffType::Same),
            ("U_T_fk".to_string(), DiffType::RightOnly),
        ]
    );

    let ddl = generic().generate_migration(&left, &right, &chunks).unwrap();
    assert_eq!(
        ddl.statements,
        vec![
            "ALTER TABLE T ADD email VARCHAR(120) NULL".to_string(),
            "ALTER TABLE U ADD CONSTRAINT U_T_fk FOREIGN KEY (t_id) REFERENCES T (id)".to_string(),
        ]
    );
    assert!(ddl.script().contains("-- Generated SQL Script to turn before into after --"));
}

#[test]
fn test_relationship_drops_and_adds_bracket_other_statements() {
    let mut left = base_tree("left");
    let u = left.find_table(None, None, "U").unwrap();
    left.add_column(u, Column::new("t_ref", type_codes::INTEGER).nullable(true)).unwrap();
    let old = left.add_table(left.root(), "Old", TableKind::Table).unwrap();
    left.add_column(old, Column::new("x", type_codes::INTEGER)).unwrap();
    link(&mut left, "U_T_fk", "t_id");

    let mut right = base_tree("right");
    let u = right.find_table(None, None, "U").unwrap();
    right.add_column(u, Column::new("t_ref", type_codes::INTEGER).nullable(true)).unwrap();
    let t = right.find_table(None, None, "T").unwrap();
    right
        .add_column(t, Column::new("email", type_codes::VARCHAR).precision(120).nullable(true))
        .unwrap();
    link(&mut right, "U_T_ref_fk", "t_ref");

    let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
    let ddl = generic().generate_migration(&left, &right, &chunks).unwrap();
    assert_eq!(
        ddl.statements,
        vec![
            "ALTER TABLE U DROP CONSTRAINT U_T_fk".to_string(),
            "DROP TABLE Old".to_string(),
            "ALTER TABLE T ADD email VARCHAR(120) NULL".to_string(),
            "ALTER TABLE U ADD CONSTRAINT U_T_ref_fk FOREIGN KEY (t_ref) REFERENCES T (id)".to_string(),
        ]
    );

    let last_drop = ddl.statements.iter().rposition(|s| s.contains("DROP CONSTRAINT")).unwrap();
    let first_add = ddl.statements.iter().position(|s| s.contains("FOREIGN KEY")).unwrap();
    assert!(ddl.statements[last_drop + 1..first_add]
        .iter()
        .all(|s| !s.contains("CONSTRAINT")));
}

#[test]
fn test_identical_trees_are_all_same() {
    let mut left = base_tree("db");
    link(&mut left, "U_T_fk", "t_id");
    let right = left.clone();

    let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.kind == DiffType::Same));

    for dialect in Dialect::all() {
        let generator = DdlGenerator::new(dialect).with_type_map(TypeMap::ansi());
        let ddl = generator.generate_migration(&left, &right, &chunks).unwrap();
        assert!(ddl.statements.is_empty(), "{} produced statements", dialect);
    }
}

#[test]
fn test_duplicate_table_names_resolve_deterministically() {
    let mut tree = SchemaTree::new("db");
    for schema in ["sales", "archive"] {
        let s = tree.add_schema(tree.root(), schema).unwrap();
        let t = tree.add_table(s, "ORDERS", TableKind::Table).unwrap();
        tree.add_column(t, Column::new("id", type_codes::INTEGER)).unwrap();
    }

    for _ in 0..3 {
        let ddl = generic().generate(&tree, tree.root()).unwrap();
        assert!(ddl.statements[0].starts_with("CREATE TABLE ORDERS ("));
        assert!(ddl.statements[1].starts_with("CREATE TABLE ORDERS_1 ("));
        assert_eq!(ddl.warnings.len(), 1);
        assert_eq!(ddl.warnings[0].kind, WarningKind::NameChange);
        assert_eq!(ddl.warnings[0].original, "ORDERS");
    }
}

#[test]
fn test_primary_key_follows_sequence_numbers() {
    let mut tree = SchemaTree::new("db");
    let t = tree.add_table(tree.root(), "pair", TableKind::Table).unwrap();
    tree.add_column(t, Column::new("B", type_codes::INTEGER).primary_key(2)).unwrap();
    tree.add_column(t, Column::new("A", type_codes::INTEGER).primary_key(1)).unwrap();

    let ddl = DdlGenerator::new(POSTGRES).generate(&tree, tree.root()).unwrap();
    assert!(ddl.statements.iter().any(|s| s.ends_with("PRIMARY KEY (A, B)")));
}

#[test]
fn test_type_problems_fatal_or_warning() {
    let mut tree = SchemaTree::new("db");
    let t = tree.add_table(tree.root(), "things", TableKind::Table).unwrap();
    tree.add_column(t, Column::new("shape", 4242).source_type("geometry").nullable(true))
        .unwrap();

    let ddl = generic().generate(&tree, tree.root()).unwrap();
    assert!(ddl.statements[0].contains("shape VARCHAR NULL"));
    assert_eq!(ddl.warnings.len(), 1);
    assert_eq!(ddl.warnings[0].kind, WarningKind::TypeMapping);

    let strict = TypeMap::ansi().with(
        schema_architect::schema::type_map::TypeDescriptor::new(4242, "GEOMETRY").not_nullable(),
    );
    let err = DdlGenerator::new(GENERIC)
        .with_type_map(strict)
        .generate(&tree, tree.root())
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperationError(_)));
}

fn shop_source() -> InMemorySource {
    let customers = TableCoordinates::new(None, Some("public"), "customers");
    let orders = TableCoordinates::new(None, Some("public"), "orders");
    InMemorySource::new()
        .with_table(TableRecord::new(None, Some("public"), "customers", TableKind::Table))
        .with_table(TableRecord::new(None, Some("public"), "orders", TableKind::Table))
        .with_column(&customers, ColumnRecord::new("id", "integer").primary_key(1, "customers_pkey"))
        .with_column(&customers, ColumnRecord::new("name", "varchar").precision(80, 0))
        .with_column(&orders, ColumnRecord::new("id", "integer").primary_key(1, "orders_pkey"))
        .with_column(&orders, ColumnRecord::new("customer_id", "integer").not_null())
        .with_imported_key(
            &orders,
            ImportedKeyRecord::new("orders_customer_fk", customers.clone(), "id", "customer_id", 1),
        )
}

#[tokio::test]
async fn test_population_is_idempotent_and_notifies_once() {
    let live = LiveDatabase::new("shop", Arc::new(shop_source()));
    let mut events = live.subscribe();

    live.populate_database().await.unwrap();
    let orders = live.read().await.find_table(None, Some("public"), "orders").unwrap();

    live.populate_table(orders).await.unwrap();
    let mut first = Vec::new();
    while let Ok(event) = events.try_recv() {
        first.push(event);
    }
    assert!(first.iter().any(|e| matches!(e, TreeEvent::ChildrenInserted(_))));
    let snapshot = live.snapshot().await;

    live.populate_table(orders).await.unwrap();
    live.populate_database().await.unwrap();
    assert!(events.try_recv().is_err());

    let again = live.snapshot().await;
    assert_eq!(snapshot.table(orders).unwrap().columns, again.table(orders).unwrap().columns);
    assert_eq!(
        snapshot.table(orders).unwrap().imported_keys,
        again.table(orders).unwrap().imported_keys
    );
    assert_eq!(again.table(orders).unwrap().imported_keys.len(), 1);
}

#[tokio::test]
async fn test_live_trees_compare_and_generate() {
    let left = LiveDatabase::new("shop", Arc::new(shop_source()));
    left.populate_all().await.unwrap();
    let left = left.into_tree();

    let source = shop_source().with_column(
        &TableCoordinates::new(None, Some("public"), "orders"),
        ColumnRecord::new("placed_at", "timestamp"),
    );
    let right = LiveDatabase::new("shop_next", Arc::new(source));
    right.populate_all().await.unwrap();
    let right = right.into_tree();

    let ddl = DdlGenerator::new(POSTGRES).generate(&left, left.root()).unwrap();
    assert_eq!(
        ddl.statements.last().unwrap(),
        "ALTER TABLE orders ADD CONSTRAINT orders_customer_fk FOREIGN KEY (customer_id) REFERENCES customers (id)"
    );

    let comparison = Comparison::new(left, right).unwrap();
    assert!(comparison.has_differences());
    let sql = comparison
        .render(OutputFormat::Sql, &DdlGenerator::new(POSTGRES), false)
        .unwrap();
    assert!(sql.contains("ALTER TABLE orders ADD COLUMN placed_at TIMESTAMP NULL;"));

    let english = comparison
        .render(OutputFormat::English, &DdlGenerator::new(POSTGRES), true)
        .unwrap();
    assert!(english.contains("Table orders needs no changes\n\tColumn placed_at should be added\n"));
    assert!(english.contains("\tColumn placed_at should be removed\n"));
}

fn sqlite_config() -> Config {
    Config {
        database: DatabaseConfig {
            driver: "sqlite".to_string(),
            url: "sqlite::memory:".to_string(),
            pool_size: Some(1),
            timeout_seconds: Some(5),
            catalog: None,
            schema: None,
            table_pattern: None,
        },
        generator: GeneratorConfig {
            dialect: "postgres".to_string(),
            ..GeneratorConfig::default()
        },
        compare: Default::default(),
        logging: None,
    }
}

#[tokio::test]
async fn test_sqlite_database_to_postgres_ddl() {
    let client = ArchitectClient::new(sqlite_config()).await.unwrap();
    let schema_architect::DatabaseConnection::Sqlite(pool) = client.connection() else {
        unreachable!()
    };
    for statement in [
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name VARCHAR(80) NOT NULL)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id))",
        "CREATE VIEW customer_names AS SELECT name FROM customers",
    ] {
        sqlx::query(statement).execute(pool).await.unwrap();
    }

    let ddl = client.generate_ddl().await.unwrap();
    assert_eq!(
        ddl.statements,
        vec![
            "CREATE TABLE customers (\n    id INTEGER NOT NULL,\n    name VARCHAR(80) NOT NULL\n)".to_string(),
            "ALTER TABLE customers ADD CONSTRAINT customers_pk PRIMARY KEY (id)".to_string(),
            "CREATE TABLE orders (\n    id INTEGER NOT NULL,\n    customer_id INTEGER NULL\n)".to_string(),
            "ALTER TABLE orders ADD CONSTRAINT orders_pk PRIMARY KEY (id)".to_string(),
            "ALTER TABLE orders ADD CONSTRAINT orders_fk0 FOREIGN KEY (customer_id) REFERENCES customers (id)"
                .to_string(),
        ]
    );
    assert!(ddl.warnings.is_empty());
}

#[tokio::test]
async fn test_generic_dialect_needs_types_from_somewhere() {
    let mut config = sqlite_config();
    config.generator.dialect = "generic".to_string();
    config.generator.allow_connection = false;
    let client = ArchitectClient::new(config).await.unwrap();

    let generator = client.generator().await.unwrap();
    let tree = SchemaTree::new("empty");
    assert!(matches!(
        generator.generate(&tree, tree.root()),
        Err(Error::UnsupportedOperationError(_))
    ));
}
