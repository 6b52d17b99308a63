//! Live database introspection
//!
//! Implements [`MetadataSource`] for a [`DatabaseConnection`] by querying the
//! information schema (PostgreSQL, MySQL) or `sqlite_master` and pragmas.

use async_trait::async_trait;
use sqlx::{FromRow, MySql, Pool, Postgres, Row, Sqlite};
use tracing::{debug, warn};

use crate::db::connection::DatabaseConnection;
use crate::error::Result;
use crate::schema::source::{
    ColumnRecord, ImportedKeyRecord, MetadataSource, TableFilter, TableRecord, TypeInfoRecord,
};
use crate::schema::types::{type_codes, TableCoordinates, TableKind};

#[async_trait]
impl MetadataSource for DatabaseConnection {
    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<TableRecord>> {
        let records = match self {
            DatabaseConnection::Postgres(pool) => PostgresIntrospector { pool }.list_tables(filter).await?,
            DatabaseConnection::MySql(pool) => MySqlIntrospector { pool }.list_tables(filter).await?,
            DatabaseConnection::Sqlite(pool) => SqliteIntrospector { pool }.list_tables().await?,
        };

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            if filter.matches(&record.coordinates, record.kind)? {
                out.push(record);
            }
        }
        debug!(driver = self.driver(), tables = out.len(), "Listed tables");
        Ok(out)
    }

    async fn list_columns(&self, table: &TableCoordinates) -> Result<Vec<ColumnRecord>> {
        match self {
            DatabaseConnection::Postgres(pool) => PostgresIntrospector { pool }.list_columns(table).await,
            DatabaseConnection::MySql(pool) => MySqlIntrospector { pool }.list_columns(table).await,
            DatabaseConnection::Sqlite(pool) => SqliteIntrospector { pool }.list_columns(table).await,
        }
    }

    async fn list_imported_keys(&self, table: &TableCoordinates) -> Result<Vec<ImportedKeyRecord>> {
        match self {
            DatabaseConnection::Postgres(pool) => PostgresIntrospector { pool }.list_imported_keys(table).await,
            DatabaseConnection::MySql(pool) => MySqlIntrospector { pool }.list_imported_keys(table).await,
            DatabaseConnection::Sqlite(pool) => SqliteIntrospector { pool }.list_imported_keys(table).await,
        }
    }

    async fn type_info(&self) -> Result<Vec<TypeInfoRecord>> {
        match self {
            DatabaseConnection::Postgres(pool) => PostgresIntrospector { pool }.type_info().await,
            // Neither reports a usable type catalogue; the static maps cover them
            DatabaseConnection::MySql(_) | DatabaseConnection::Sqlite(_) => Ok(Vec::new()),
        }
    }
}

// Row types shared by the information_schema queries
#[derive(FromRow)]
struct TableRow {
    table_catalog: Option<String>,
    table_schema: Option<String>,
    table_name: String,
    table_type: String,
    remarks: Option<String>,
}

#[derive(FromRow)]
struct ColumnRow {
    column_name: String,
    data_type: String,
    is_nullable: String,
    column_default: Option<String>,
    character_maximum_length: Option<i64>,
    numeric_precision: Option<i64>,
    numeric_scale: Option<i64>,
    ordinal_position: i64,
    remarks: Option<String>,
}

#[derive(FromRow)]
struct PrimaryKeyRow {
    constraint_name: String,
    column_name: String,
    key_seq: i64,
}

#[derive(FromRow)]
struct ForeignKeyRow {
    fk_name: String,
    pk_catalog: Option<String>,
    pk_schema: Option<String>,
    pk_table: String,
    pk_column: String,
    fk_column: String,
    key_seq: i64,
    update_rule: Option<String>,
    delete_rule: Option<String>,
}

#[derive(FromRow)]
struct TypeRow {
    type_name: String,
}

fn table_kind(table_type: &str) -> TableKind {
    table_type.parse().unwrap_or(TableKind::Table)
}

fn to_u32(value: Option<i64>) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

fn column_record(row: ColumnRow, keys: &[PrimaryKeyRow]) -> ColumnRecord {
    let mut record = ColumnRecord::new(&row.column_name, &row.data_type);
    record.precision = match row.character_maximum_length {
        Some(len) => to_u32(Some(len)),
        None => to_u32(row.numeric_precision),
    };
    record.scale = to_u32(row.numeric_scale);
    record.nullable = row.is_nullable.eq_ignore_ascii_case("YES");
    record.ordinal_position = to_u32(Some(row.ordinal_position));
    record.default_value = row.column_default;
    record.remarks = row.remarks.filter(|r| !r.is_empty());

    if let Some(key) = keys.iter().find(|k| k.column_name == record.name) {
        record = record.primary_key(to_u32(Some(key.key_seq)), &key.constraint_name);
    }
    record
}

fn imported_key(row: ForeignKeyRow) -> ImportedKeyRecord {
    let pk_table = TableCoordinates::new(row.pk_catalog.as_deref(), row.pk_schema.as_deref(), &row.pk_table);
    let mut record = ImportedKeyRecord::new(&row.fk_name, pk_table, &row.pk_column, &row.fk_column, to_u32(Some(row.key_seq)));
    record.update_rule = row.update_rule;
    record.delete_rule = row.delete_rule;
    record
}

/// Decode PostgreSQL's single-letter `pg_constraint` referential actions
fn pg_rule(code: &str) -> Option<String> {
    let rule = match code {
        "a" => "NO ACTION",
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => return None,
    };
    Some(rule.to_string())
}

/// `varchar(40)` -> (40, 0), `numeric(10, 2)` -> (10, 2)
fn parse_type_params(declared: &str) -> (u32, u32) {
    let Some(open) = declared.find('(') else {
        return (0, 0);
    };
    let inner = declared[open + 1..].trim_end_matches(|c: char| c == ')' || c.is_whitespace());
    let mut parts = inner.split(',').map(|p| p.trim().parse::<u32>().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

/// PostgreSQL introspection
struct PostgresIntrospector<'a> {
    pool: &'a Pool<Postgres>,
}

impl<'a> PostgresIntrospector<'a> {
    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<TableRecord>> {
        let sql = r#"
            SELECT
                NULL::text AS table_catalog,
                t.table_schema::text AS table_schema,
                t.table_name::text AS table_name,
                CASE WHEN t.table_schema IN ('pg_catalog', 'information_schema')
                     THEN 'SYSTEM TABLE' ELSE t.table_type::text END AS table_type,
                obj_description(c.oid, 'pg_class') AS remarks
            FROM information_schema.tables t
            LEFT JOIN pg_namespace n ON n.nspname = t.table_schema
            LEFT JOIN pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid
            WHERE ($1::text IS NULL OR t.table_schema LIKE $1)
              AND ($2::text IS NULL OR t.table_name LIKE $2)
            ORDER BY t.table_schema, t.table_name
        "#;

        let rows = sqlx::query_as::<_, TableRow>(sql)
            .bind(filter.schema_pattern.as_deref())
            .bind(filter.name_pattern.as_deref())
            .fetch_all(self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| TableRecord {
                coordinates: TableCoordinates::new(None, row.table_schema.as_deref(), &row.table_name),
                kind: table_kind(&row.table_type),
                remarks: row.remarks,
            })
            .collect())
    }

    async fn list_columns(&self, table: &TableCoordinates) -> Result<Vec<ColumnRecord>> {
        let schema = table.schema.as_deref().unwrap_or("public");

        let sql = r#"
            SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable::text AS is_nullable,
                c.column_default::text AS column_default,
                c.character_maximum_length::int8 AS character_maximum_length,
                c.numeric_precision::int8 AS numeric_precision,
                c.numeric_scale::int8 AS numeric_scale,
                c.ordinal_position::int8 AS ordinal_position,
                col_description(format('%I.%I', c.table_schema, c.table_name)::regclass, c.ordinal_position::int) AS remarks
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;
        let column_rows = sqlx::query_as::<_, ColumnRow>(sql)
            .bind(schema)
            .bind(&table.name)
            .fetch_all(self.pool)
            .await?;

        let sql = r#"
            SELECT
                tc.constraint_name::text AS constraint_name,
                kcu.column_name::text AS column_name,
                kcu.ordinal_position::int8 AS key_seq
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = $1
                AND tc.table_name = $2
            ORDER BY kcu.ordinal_position
        "#;
        let pk_rows = sqlx::query_as::<_, PrimaryKeyRow>(sql)
            .bind(schema)
            .bind(&table.name)
            .fetch_all(self.pool)
            .await?;

        Ok(column_rows.into_iter().map(|row| column_record(row, &pk_rows)).collect())
    }

    async fn list_imported_keys(&self, table: &TableCoordinates) -> Result<Vec<ImportedKeyRecord>> {
        let schema = table.schema.as_deref().unwrap_or("public");

        let sql = r#"
            SELECT
                con.conname::text AS fk_name,
                NULL::text AS pk_catalog,
                pn.nspname::text AS pk_schema,
                pc.relname::text AS pk_table,
                pa.attname::text AS pk_column,
                fa.attname::text AS fk_column,
                k.seq::int8 AS key_seq,
                con.confupdtype::text AS update_rule,
                con.confdeltype::text AS delete_rule
            FROM pg_constraint con
            JOIN pg_class fc ON fc.oid = con.conrelid
            JOIN pg_namespace fn ON fn.oid = fc.relnamespace
            JOIN pg_class pc ON pc.oid = con.confrelid
            JOIN pg_namespace pn ON pn.oid = pc.relnamespace
            CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(fk_attnum, pk_attnum, seq)
            JOIN pg_attribute fa ON fa.attrelid = con.conrelid AND fa.attnum = k.fk_attnum
            JOIN pg_attribute pa ON pa.attrelid = con.confrelid AND pa.attnum = k.pk_attnum
            WHERE con.contype = 'f' AND fn.nspname = $1 AND fc.relname = $2
            ORDER BY con.conname, k.seq
        "#;
        let rows = sqlx::query_as::<_, ForeignKeyRow>(sql)
            .bind(schema)
            .bind(&table.name)
            .fetch_all(self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|mut row| {
                row.update_rule = row.update_rule.as_deref().and_then(pg_rule);
                row.delete_rule = row.delete_rule.as_deref().and_then(pg_rule);
                imported_key(row)
            })
            .collect())
    }

    async fn type_info(&self) -> Result<Vec<TypeInfoRecord>> {
        let sql = r#"
            SELECT format_type(t.oid, NULL) AS type_name
            FROM pg_type t
            JOIN pg_namespace n ON n.oid = t.typnamespace
            WHERE n.nspname = 'pg_catalog' AND t.typtype = 'b' AND t.typelem = 0
            ORDER BY t.oid
        "#;
        let rows = sqlx::query_as::<_, TypeRow>(sql).fetch_all(self.pool).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let type_code = type_codes::for_name(&row.type_name);
                if type_code == type_codes::OTHER {
                    return None;
                }
                let create_params = match type_code {
                    type_codes::CHAR | type_codes::VARCHAR => Some("length".to_string()),
                    type_codes::NUMERIC | type_codes::DECIMAL => Some("precision,scale".to_string()),
                    _ => None,
                };
                Some(TypeInfoRecord {
                    type_name: row.type_name,
                    type_code,
                    precision: 0,
                    create_params,
                    nullable: true,
                })
            })
            .collect())
    }
}

/// MySQL introspection; MySQL databases are reported as catalogs
struct MySqlIntrospector<'a> {
    pool: &'a Pool<MySql>,
}

impl<'a> MySqlIntrospector<'a> {
    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<TableRecord>> {
        let sql = r#"
            SELECT
                CAST(table_schema AS CHAR) AS table_catalog,
                CAST(NULL AS CHAR) AS table_schema,
                CAST(table_name AS CHAR) AS table_name,
                CASE WHEN table_schema IN ('mysql', 'information_schema', 'performance_schema', 'sys')
                     THEN 'SYSTEM TABLE' ELSE CAST(table_type AS CHAR) END AS table_type,
                CAST(table_comment AS CHAR) AS remarks
            FROM information_schema.tables
            WHERE (? IS NULL OR table_schema = ?)
              AND (? IS NULL OR table_name LIKE ?)
            ORDER BY table_schema, table_name
        "#;

        let rows = sqlx::query_as::<_, TableRow>(sql)
            .bind(filter.catalog.as_deref())
            .bind(filter.catalog.as_deref())
            .bind(filter.name_pattern.as_deref())
            .bind(filter.name_pattern.as_deref())
            .fetch_all(self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| TableRecord {
                coordinates: TableCoordinates::new(
                    row.table_catalog.as_deref(),
                    row.table_schema.as_deref(),
                    &row.table_name,
                ),
                kind: table_kind(&row.table_type),
                remarks: row.remarks.filter(|r| !r.is_empty()),
            })
            .collect())
    }

    async fn list_columns(&self, table: &TableCoordinates) -> Result<Vec<ColumnRecord>> {
        let sql = r#"
            SELECT
                CAST(column_name AS CHAR) AS column_name,
                CAST(data_type AS CHAR) AS data_type,
                CAST(is_nullable AS CHAR) AS is_nullable,
                CAST(column_default AS CHAR) AS column_default,
                CAST(character_maximum_length AS SIGNED) AS character_maximum_length,
                CAST(numeric_precision AS SIGNED) AS numeric_precision,
                CAST(numeric_scale AS SIGNED) AS numeric_scale,
                CAST(ordinal_position AS SIGNED) AS ordinal_position,
                CAST(column_comment AS CHAR) AS remarks
            FROM information_schema.columns
            WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?
            ORDER BY ordinal_position
        "#;
        let column_rows = sqlx::query_as::<_, ColumnRow>(sql)
            .bind(table.catalog.as_deref())
            .bind(&table.name)
            .fetch_all(self.pool)
            .await?;

        let sql = r#"
            SELECT
                CAST(constraint_name AS CHAR) AS constraint_name,
                CAST(column_name AS CHAR) AS column_name,
                CAST(ordinal_position AS SIGNED) AS key_seq
            FROM information_schema.key_column_usage
            WHERE constraint_name = 'PRIMARY'
              AND table_schema = COALESCE(?, DATABASE())
              AND table_name = ?
            ORDER BY ordinal_position
        "#;
        let pk_rows = sqlx::query_as::<_, PrimaryKeyRow>(sql)
            .bind(table.catalog.as_deref())
            .bind(&table.name)
            .fetch_all(self.pool)
            .await?;

        Ok(column_rows.into_iter().map(|row| column_record(row, &pk_rows)).collect())
    }

    async fn list_imported_keys(&self, table: &TableCoordinates) -> Result<Vec<ImportedKeyRecord>> {
        let sql = r#"
            SELECT
                CAST(k.constraint_name AS CHAR) AS fk_name,
                CAST(k.referenced_table_schema AS CHAR) AS pk_catalog,
                CAST(NULL AS CHAR) AS pk_schema,
                CAST(k.referenced_table_name AS CHAR) AS pk_table,
                CAST(k.referenced_column_name AS CHAR) AS pk_column,
                CAST(k.column_name AS CHAR) AS fk_column,
                CAST(k.ordinal_position AS SIGNED) AS key_seq,
                CAST(r.update_rule AS CHAR) AS update_rule,
                CAST(r.delete_rule AS CHAR) AS delete_rule
            FROM information_schema.key_column_usage k
            JOIN information_schema.referential_constraints r
                ON r.constraint_schema = k.constraint_schema
                AND r.constraint_name = k.constraint_name
            WHERE k.referenced_table_name IS NOT NULL
              AND k.table_schema = COALESCE(?, DATABASE())
              AND k.table_name = ?
            ORDER BY k.constraint_name, k.ordinal_position
        "#;
        let rows = sqlx::query_as::<_, ForeignKeyRow>(sql)
            .bind(table.catalog.as_deref())
            .bind(&table.name)
            .fetch_all(self.pool)
            .await?;

        Ok(rows.into_iter().map(imported_key).collect())
    }
}

/// SQLite introspection through `sqlite_master` and pragmas
struct SqliteIntrospector<'a> {
    pool: &'a Pool<Sqlite>,
}

fn pragma_target(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl<'a> SqliteIntrospector<'a> {
    async fn list_tables(&self) -> Result<Vec<TableRecord>> {
        let sql = r#"SELECT name, type FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name"#;
        let rows = sqlx::query(sql).fetch_all(self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let kind: String = row.try_get("type")?;
            let kind = if name.starts_with("sqlite_") {
                TableKind::SystemTable
            } else {
                table_kind(&kind)
            };
            out.push(TableRecord::new(None, None, &name, kind));
        }
        Ok(out)
    }

    async fn list_columns(&self, table: &TableCoordinates) -> Result<Vec<ColumnRecord>> {
        let pragma = format!("PRAGMA table_info({})", pragma_target(&table.name));
        let rows = sqlx::query(&pragma).fetch_all(self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cid: i64 = row.try_get("cid")?;
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            let not_null: i64 = row.try_get("notnull")?;
            let default_value: Option<String> = row.try_get("dflt_value")?;
            let pk: i64 = row.try_get("pk")?;

            let (precision, scale) = parse_type_params(&declared);
            let type_name = declared.split('(').next().unwrap_or(&declared).trim();
            let mut record = ColumnRecord::new(&name, type_name).precision(precision, scale);
            record.ordinal_position = to_u32(Some(cid + 1));
            record.default_value = default_value;
            if not_null != 0 {
                record = record.not_null();
            }
            if pk > 0 {
                record.pk_seq = Some(to_u32(Some(pk)));
                record.nullable = false;
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn list_imported_keys(&self, table: &TableCoordinates) -> Result<Vec<ImportedKeyRecord>> {
        let pragma = format!("PRAGMA foreign_key_list({})", pragma_target(&table.name));
        let rows = sqlx::query(&pragma).fetch_all(self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let seq: i64 = row.try_get("seq")?;
            let pk_table: String = row.try_get("table")?;
            let fk_column: String = row.try_get("from")?;
            let pk_column: Option<String> = row.try_get("to")?;

            // A missing target column means the parent's primary key
            let pk_column = match pk_column {
                Some(column) => column,
                None => match self.primary_key_column(&pk_table, seq).await? {
                    Some(column) => column,
                    None => {
                        warn!(table = %table.name, parent = %pk_table, "Foreign key target column not found; skipping");
                        continue;
                    }
                },
            };

            // SQLite constraints are anonymous
            let fk_name = format!("{}_fk{}", table.name, id);
            let mut record = ImportedKeyRecord::new(
                &fk_name,
                TableCoordinates::new(None, None, &pk_table),
                &pk_column,
                &fk_column,
                to_u32(Some(seq + 1)),
            );
            record.update_rule = row.try_get("on_update")?;
            record.delete_rule = row.try_get("on_delete")?;
            out.push(record);
        }
        Ok(out)
    }

    async fn primary_key_column(&self, table: &str, seq: i64) -> Result<Option<String>> {
        let pragma = format!("PRAGMA table_info({})", pragma_target(table));
        let rows = sqlx::query(&pragma).fetch_all(self.pool).await?;
        for row in rows {
            let pk: i64 = row.try_get("pk")?;
            if pk == seq + 1 {
                return Ok(Some(row.try_get("name")?));
            }
        }
        Ok(None)
    }
}
