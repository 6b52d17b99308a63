//! Metadata sources
//!
//! A [`MetadataSource`] answers the catalog questions a tree needs during
//! population. The sqlx-backed implementation lives in `analyzer.rs`;
//! [`InMemorySource`] serves canned metadata.

use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::schema::tree::SchemaTree;
use crate::schema::types::{type_codes, Column, TableCoordinates, TableKind};

/// Restricts which tables a database sweep discovers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub catalog: Option<String>,
    /// SQL `LIKE` pattern
    pub schema_pattern: Option<String>,
    /// SQL `LIKE` pattern
    pub name_pattern: Option<String>,
    /// Empty means every kind
    pub kinds: Vec<TableKind>,
}

impl TableFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            catalog: config.catalog.clone(),
            schema_pattern: config.schema.clone(),
            name_pattern: config.table_pattern.clone(),
            kinds: Vec::new(),
        }
    }

    pub fn with_kinds(mut self, kinds: Vec<TableKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_name_pattern(mut self, pattern: &str) -> Self {
        self.name_pattern = Some(pattern.to_string());
        self
    }

    pub fn with_schema_pattern(mut self, pattern: &str) -> Self {
        self.schema_pattern = Some(pattern.to_string());
        self
    }

    pub fn accepts_kind(&self, kind: TableKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    /// Check a table against every part of the filter
    pub fn matches(&self, coordinates: &TableCoordinates, kind: TableKind) -> Result<bool> {
        if !self.accepts_kind(kind) {
            return Ok(false);
        }
        if let Some(catalog) = &self.catalog {
            if coordinates.catalog.as_deref() != Some(catalog.as_str()) {
                return Ok(false);
            }
        }
        if let Some(pattern) = &self.schema_pattern {
            match coordinates.schema.as_deref() {
                Some(schema) if like_to_regex(pattern)?.is_match(schema) => {}
                _ => return Ok(false),
            }
        }
        if let Some(pattern) = &self.name_pattern {
            if !like_to_regex(pattern)?.is_match(&coordinates.name) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Translate a SQL `LIKE` pattern (`%`, `_`, backslash escapes) into an
/// anchored regex
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::ConfigError(format!("Invalid LIKE pattern '{}': {}", pattern, e)))
}

/// A table reported by a database sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub coordinates: TableCoordinates,
    pub kind: TableKind,
    pub remarks: Option<String>,
}

impl TableRecord {
    pub fn new(catalog: Option<&str>, schema: Option<&str>, name: &str, kind: TableKind) -> Self {
        Self {
            coordinates: TableCoordinates::new(catalog, schema, name),
            kind,
            remarks: None,
        }
    }

    pub fn remarks(mut self, remarks: &str) -> Self {
        self.remarks = Some(remarks.to_string());
        self
    }
}

/// A column reported for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRecord {
    pub name: String,
    pub type_code: i32,
    pub type_name: String,
    pub precision: u32,
    pub scale: u32,
    pub nullable: bool,
    pub ordinal_position: u32,
    pub remarks: Option<String>,
    pub default_value: Option<String>,
    /// Position in the table's primary key
    pub pk_seq: Option<u32>,
    pub pk_name: Option<String>,
}

impl ColumnRecord {
    /// Build a record whose type code is classified from `type_name`
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_code: type_codes::for_name(type_name),
            type_name: type_name.to_string(),
            precision: 0,
            scale: 0,
            nullable: true,
            ordinal_position: 0,
            remarks: None,
            default_value: None,
            pk_seq: None,
            pk_name: None,
        }
    }

    pub fn precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self, seq: u32, constraint: &str) -> Self {
        self.pk_seq = Some(seq);
        self.pk_name = Some(constraint.to_string());
        self.nullable = false;
        self
    }

    pub fn into_column(self) -> Column {
        Column {
            name: self.name,
            type_code: self.type_code,
            source_type_name: Some(self.type_name),
            precision: self.precision,
            scale: self.scale,
            nullable: self.nullable,
            ordinal_position: self.ordinal_position,
            primary_key_seq: self.pk_seq,
            remarks: self.remarks,
            default_value: self.default_value,
        }
    }
}

/// One column pair of a foreign key imported by a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedKeyRecord {
    pub pk_table: TableCoordinates,
    pub pk_column: String,
    pub fk_column: String,
    /// 1-based position of the pair within the key
    pub key_seq: u32,
    pub fk_name: Option<String>,
    pub update_rule: Option<String>,
    pub delete_rule: Option<String>,
}

impl ImportedKeyRecord {
    pub fn new(fk_name: &str, pk_table: TableCoordinates, pk_column: &str, fk_column: &str, key_seq: u32) -> Self {
        Self {
            pk_table,
            pk_column: pk_column.to_string(),
            fk_column: fk_column.to_string(),
            key_seq,
            fk_name: Some(fk_name.to_string()),
            update_rule: None,
            delete_rule: None,
        }
    }
}

/// A data type the source database supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInfoRecord {
    pub type_name: String,
    pub type_code: i32,
    /// Maximum precision; zero when the type takes none
    pub precision: u32,
    /// e.g. `"length"` or `"precision,scale"`
    pub create_params: Option<String>,
    pub nullable: bool,
}

/// Catalog queries a tree is populated from
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Tables matching `filter`, with their catalog and schema
    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<TableRecord>>;

    /// Columns of a table in ordinal order
    async fn list_columns(&self, table: &TableCoordinates) -> Result<Vec<ColumnRecord>>;

    /// Foreign keys the table imports, one record per column pair
    async fn list_imported_keys(&self, table: &TableCoordinates) -> Result<Vec<ImportedKeyRecord>>;

    async fn type_info(&self) -> Result<Vec<TypeInfoRecord>>;
}

#[derive(Debug, Clone)]
struct StoredTable {
    record: TableRecord,
    columns: Vec<ColumnRecord>,
    imported_keys: Vec<ImportedKeyRecord>,
}

/// Metadata held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    tables: IndexMap<TableCoordinates, StoredTable>,
    types: Vec<TypeInfoRecord>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, record: TableRecord) -> Self {
        self.tables.insert(
            record.coordinates.clone(),
            StoredTable {
                record,
                columns: Vec::new(),
                imported_keys: Vec::new(),
            },
        );
        self
    }

    pub fn with_column(mut self, table: &TableCoordinates, mut column: ColumnRecord) -> Self {
        if let Some(stored) = self.tables.get_mut(table) {
            if column.ordinal_position == 0 {
                column.ordinal_position = stored.columns.len() as u32 + 1;
            }
            stored.columns.push(column);
        }
        self
    }

    pub fn with_imported_key(mut self, table: &TableCoordinates, key: ImportedKeyRecord) -> Self {
        if let Some(stored) = self.tables.get_mut(table) {
            stored.imported_keys.push(key);
        }
        self
    }

    pub fn with_type(mut self, info: TypeInfoRecord) -> Self {
        self.types.push(info);
        self
    }

    /// Serve the metadata of a fully populated tree
    pub fn from_tree(tree: &SchemaTree) -> Result<Self> {
        let mut source = Self::new();
        for table_id in tree.tables(tree.root()) {
            let table = tree.table(table_id)?;
            if !table.is_populated() {
                return Err(Error::precondition(format!(
                    "table {} is not populated",
                    tree.qualified_name(table_id)
                )));
            }
            let coords = tree.table_coordinates(table_id)?;
            source = source.with_table(TableRecord {
                coordinates: coords.clone(),
                kind: table.kind,
                remarks: table.remarks.clone(),
            });

            for column_id in &table.columns {
                let c = tree.column(*column_id)?;
                let column = ColumnRecord {
                    name: c.name.clone(),
                    type_code: c.type_code,
                    type_name: c.source_type_name.clone().unwrap_or_default(),
                    precision: c.precision,
                    scale: c.scale,
                    nullable: c.nullable,
                    ordinal_position: c.ordinal_position,
                    remarks: c.remarks.clone(),
                    default_value: c.default_value.clone(),
                    pk_seq: c.primary_key_seq,
                    pk_name: c.primary_key_seq.and(table.primary_key_name.clone()),
                };
                source = source.with_column(&coords, column);
            }

            for rel_id in &table.imported_keys {
                let rel = tree.relationship(*rel_id)?;
                let pk_table = tree.table_coordinates(rel.pk_table)?;
                for (seq, mapping) in rel.mappings.iter().enumerate() {
                    let key = ImportedKeyRecord {
                        pk_table: pk_table.clone(),
                        pk_column: tree.column(mapping.pk_column)?.name.clone(),
                        fk_column: tree.column(mapping.fk_column)?.name.clone(),
                        key_seq: seq as u32 + 1,
                        fk_name: Some(rel.name.clone()),
                        update_rule: rel.update_rule.clone(),
                        delete_rule: rel.delete_rule.clone(),
                    };
                    source = source.with_imported_key(&coords, key);
                }
            }
        }
        Ok(source)
    }

    fn stored(&self, table: &TableCoordinates) -> Result<&StoredTable> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::DatabaseError(format!("Table {} does not exist", table)))
    }
}

#[async_trait]
impl MetadataSource for InMemorySource {
    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<TableRecord>> {
        let mut out = Vec::new();
        for stored in self.tables.values() {
            if filter.matches(&stored.record.coordinates, stored.record.kind)? {
                out.push(stored.record.clone());
            }
        }
        Ok(out)
    }

    async fn list_columns(&self, table: &TableCoordinates) -> Result<Vec<ColumnRecord>> {
        Ok(self.stored(table)?.columns.clone())
    }

    async fn list_imported_keys(&self, table: &TableCoordinates) -> Result<Vec<ImportedKeyRecord>> {
        Ok(self.stored(table)?.imported_keys.clone())
    }

    async fn type_info(&self) -> Result<Vec<TypeInfoRecord>> {
        Ok(self.types.clone())
    }
}
