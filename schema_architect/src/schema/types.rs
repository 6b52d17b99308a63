//! Type definitions for schema metadata nodes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable address of a node inside one [`SchemaTree`](super::tree::SchemaTree)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source data type codes.
///
/// These are the JDBC `java.sql.Types` values, which most metadata sources
/// already speak and which give every dialect a common vocabulary.
pub mod type_codes {
    pub const BIT: i32 = -7;
    pub const TINYINT: i32 = -6;
    pub const SMALLINT: i32 = 5;
    pub const INTEGER: i32 = 4;
    pub const BIGINT: i32 = -5;
    pub const FLOAT: i32 = 6;
    pub const REAL: i32 = 7;
    pub const DOUBLE: i32 = 8;
    pub const NUMERIC: i32 = 2;
    pub const DECIMAL: i32 = 3;
    pub const CHAR: i32 = 1;
    pub const VARCHAR: i32 = 12;
    pub const LONGVARCHAR: i32 = -1;
    pub const DATE: i32 = 91;
    pub const TIME: i32 = 92;
    pub const TIMESTAMP: i32 = 93;
    pub const BINARY: i32 = -2;
    pub const VARBINARY: i32 = -3;
    pub const LONGVARBINARY: i32 = -4;
    pub const OTHER: i32 = 1111;
    pub const BLOB: i32 = 2004;
    pub const CLOB: i32 = 2005;
    pub const BOOLEAN: i32 = 16;

    /// Classify a database type name (as reported by a catalog) into a code
    pub fn for_name(type_name: &str) -> i32 {
        let lower = type_name.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or(&lower).trim();

        match base {
            "bit" => BIT,
            "tinyint" => TINYINT,
            "smallint" | "int2" | "smallserial" => SMALLINT,
            "integer" | "int" | "int4" | "mediumint" | "serial" => INTEGER,
            "bigint" | "int8" | "bigserial" => BIGINT,
            "float" => FLOAT,
            "real" | "float4" => REAL,
            "double" | "double precision" | "float8" => DOUBLE,
            "numeric" => NUMERIC,
            "decimal" | "money" => DECIMAL,
            "char" | "character" | "bpchar" | "nchar" => CHAR,
            "varchar" | "character varying" | "nvarchar" | "varchar2" => VARCHAR,
            "text" | "mediumtext" | "longtext" | "tinytext" => LONGVARCHAR,
            "clob" => CLOB,
            "date" => DATE,
            "time" | "time without time zone" | "time with time zone" | "timetz" => TIME,
            "timestamp"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "timestamptz"
            | "datetime"
            | "datetime2" => TIMESTAMP,
            "binary" => BINARY,
            "varbinary" => VARBINARY,
            "bytea" | "image" | "longblob" | "mediumblob" => LONGVARBINARY,
            "blob" | "tinyblob" => BLOB,
            "boolean" | "bool" => BOOLEAN,
            _ => OTHER,
        }
    }
}

/// Kind of table-like object, as reported by the metadata source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    #[serde(rename = "TABLE")]
    Table,
    #[serde(rename = "VIEW")]
    View,
    #[serde(rename = "SYSTEM TABLE")]
    SystemTable,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Table => "TABLE",
            TableKind::View => "VIEW",
            TableKind::SystemTable => "SYSTEM TABLE",
        }
    }

    pub fn all() -> Vec<TableKind> {
        vec![TableKind::SystemTable, TableKind::Table, TableKind::View]
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TableKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TABLE" | "BASE TABLE" => Ok(TableKind::Table),
            "VIEW" => Ok(TableKind::View),
            "SYSTEM TABLE" | "SYSTEM VIEW" => Ok(TableKind::SystemTable),
            other => Err(format!("unknown table kind '{}'", other)),
        }
    }
}

/// Whether a node's children have been fetched from its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PopulationState {
    Unpopulated,
    Populated,
    /// The fetch failed. The node counts as populated so the failure is not
    /// retried on every access; `SchemaTree::reset_population` re-arms it.
    Failed(String),
}

impl PopulationState {
    pub fn is_populated(&self) -> bool {
        !matches!(self, PopulationState::Unpopulated)
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            PopulationState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Root of a schema tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub children: Vec<NodeId>,
    pub state: PopulationState,
}

/// A catalog or schema: a named grouping of tables (and, for catalogs, schemas)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub children: Vec<NodeId>,
}

/// Represents a database table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub remarks: Option<String>,
    pub kind: TableKind,
    pub primary_key_name: Option<String>,
    pub catalog: Option<NodeId>,
    pub schema: Option<NodeId>,
    pub columns: Vec<NodeId>,
    pub exported_keys: Vec<NodeId>,
    pub imported_keys: Vec<NodeId>,
    pub columns_state: PopulationState,
    pub relationships_state: PopulationState,
}

impl Table {
    pub fn is_populated(&self) -> bool {
        self.columns_state.is_populated() && self.relationships_state.is_populated()
    }
}

/// Represents a database column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_code: i32,
    pub source_type_name: Option<String>,
    pub precision: u32,
    pub scale: u32,
    pub nullable: bool,
    pub ordinal_position: u32,
    /// Position within the primary key; `None` when not a key column
    pub primary_key_seq: Option<u32>,
    pub remarks: Option<String>,
    pub default_value: Option<String>,
}

impl Column {
    /// Create a new column with the given name and type code
    pub fn new(name: &str, type_code: i32) -> Self {
        Self {
            name: name.to_string(),
            type_code,
            source_type_name: None,
            precision: 0,
            scale: 0,
            nullable: false,
            ordinal_position: 0,
            primary_key_seq: None,
            remarks: None,
            default_value: None,
        }
    }

    /// Set whether the column is nullable
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    pub fn scale(mut self, scale: u32) -> Self {
        self.scale = scale;
        self
    }

    /// Make this column the `seq`-th member of the primary key
    pub fn primary_key(mut self, seq: u32) -> Self {
        self.primary_key_seq = Some(seq);
        self
    }

    pub fn source_type(mut self, type_name: &str) -> Self {
        self.source_type_name = Some(type_name.to_string());
        self
    }

    pub fn default_value(mut self, default: &str) -> Self {
        self.default_value = Some(default.to_string());
        self
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key_seq.is_some()
    }
}

/// One parent-column/child-column pair of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub pk_column: NodeId,
    pub fk_column: NodeId,
}

/// A foreign key between a parent ("one") table and a child ("many") table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub pk_table: NodeId,
    pub fk_table: NodeId,
    pub mappings: Vec<ColumnMapping>,
    pub update_rule: Option<String>,
    pub delete_rule: Option<String>,
}

/// Everything needed to add a relationship to a tree
#[derive(Debug, Clone)]
pub struct NewRelationship {
    pub name: String,
    pub pk_table: NodeId,
    pub fk_table: NodeId,
    /// (pk column, fk column) pairs in key order
    pub mappings: Vec<(NodeId, NodeId)>,
    pub update_rule: Option<String>,
    pub delete_rule: Option<String>,
}

impl NewRelationship {
    pub fn new(name: &str, pk_table: NodeId, fk_table: NodeId) -> Self {
        Self {
            name: name.to_string(),
            pk_table,
            fk_table,
            mappings: Vec::new(),
            update_rule: None,
            delete_rule: None,
        }
    }

    pub fn map(mut self, pk_column: NodeId, fk_column: NodeId) -> Self {
        self.mappings.push((pk_column, fk_column));
        self
    }
}

/// Node variants of the metadata tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Database(Database),
    Catalog(Group),
    Schema(Group),
    Table(Table),
    Column(Column),
    Relationship(Relationship),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Database(_) => "Database",
            NodeKind::Catalog(_) => "Catalog",
            NodeKind::Schema(_) => "Schema",
            NodeKind::Table(_) => "Table",
            NodeKind::Column(_) => "Column",
            NodeKind::Relationship(_) => "Relationship",
        }
    }
}

/// One arena slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Navigation-only back reference; ownership flows parent to child
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn name(&self) -> &str {
        match &self.kind {
            NodeKind::Database(d) => &d.name,
            NodeKind::Catalog(g) | NodeKind::Schema(g) => &g.name,
            NodeKind::Table(t) => &t.name,
            NodeKind::Column(c) => &c.name,
            NodeKind::Relationship(r) => &r.name,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match &self.kind {
            NodeKind::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_column(&self) -> Option<&Column> {
        match &self.kind {
            NodeKind::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match &self.kind {
            NodeKind::Relationship(r) => Some(r),
            _ => None,
        }
    }
}

/// The three child lists every table owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FolderKind {
    Columns,
    ExportedKeys,
    ImportedKeys,
}

impl FolderKind {
    pub fn name(&self) -> &'static str {
        match self {
            FolderKind::Columns => "Columns",
            FolderKind::ExportedKeys => "Exported Keys",
            FolderKind::ImportedKeys => "Imported Keys",
        }
    }

    pub fn all() -> [FolderKind; 3] {
        [FolderKind::Columns, FolderKind::ExportedKeys, FolderKind::ImportedKeys]
    }
}

/// Address of anything a generic tree consumer can visit: a real node or a
/// table's folder view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeItem {
    Node(NodeId),
    Folder(NodeId, FolderKind),
}

/// Where a table lives in its source, used to address metadata queries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableCoordinates {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
}

impl TableCoordinates {
    pub fn new(catalog: Option<&str>, schema: Option<&str>, name: &str) -> Self {
        Self {
            catalog: catalog.map(str::to_string),
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for TableCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::utils::naming::to_qualified_name(
            self.catalog.as_deref(),
            self.schema.as_deref(),
            &self.name,
        ))
    }
}
