//! Source type code to target type mapping

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::source::TypeInfoRecord;
use crate::schema::types::type_codes::*;

/// How a target database spells one data type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub type_code: i32,
    pub name: String,
    pub has_precision: bool,
    pub has_scale: bool,
    /// Whether the target accepts NULL in columns of this type
    pub nullable: bool,
}

impl TypeDescriptor {
    pub fn new(type_code: i32, name: &str) -> Self {
        Self {
            type_code,
            name: name.to_string(),
            has_precision: false,
            has_scale: false,
            nullable: true,
        }
    }

    pub fn with_precision(mut self) -> Self {
        self.has_precision = true;
        self
    }

    /// Scale only makes sense together with precision
    pub fn with_scale(mut self) -> Self {
        self.has_precision = true;
        self.has_scale = true;
        self
    }

    pub fn not_nullable(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn from_record(record: &TypeInfoRecord) -> Self {
        let params = record.create_params.as_deref().unwrap_or("").to_lowercase();
        Self {
            type_code: record.type_code,
            name: record.type_name.clone(),
            has_precision: ["length", "precision", "size"].iter().any(|p| params.contains(p)),
            has_scale: params.contains("scale"),
            nullable: record.nullable,
        }
    }

    /// Render the type for a column, e.g. `NUMERIC(10,2)`
    pub fn render(&self, precision: u32, scale: u32) -> String {
        if !self.has_precision || precision == 0 {
            return self.name.clone();
        }
        if self.has_scale {
            format!("{}({},{})", self.name, precision, scale)
        } else {
            format!("{}({})", self.name, precision)
        }
    }
}

/// Descriptors keyed by source type code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMap {
    types: BTreeMap<i32, TypeDescriptor>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.type_code, descriptor);
    }

    pub fn with(mut self, descriptor: TypeDescriptor) -> Self {
        self.insert(descriptor);
        self
    }

    pub fn get(&self, type_code: i32) -> Option<&TypeDescriptor> {
        self.types.get(&type_code)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Build a map from the type list a database reports. The first
    /// descriptor for a code wins; databases list their closest match first.
    pub fn from_records(records: &[TypeInfoRecord]) -> Self {
        let mut map = Self::new();
        for record in records {
            map.types
                .entry(record.type_code)
                .or_insert_with(|| TypeDescriptor::from_record(record));
        }
        map
    }

    fn from_table(entries: &[(i32, &str, bool, bool)]) -> Self {
        let mut map = Self::new();
        for (code, name, precision, scale) in entries {
            let mut td = TypeDescriptor::new(*code, name);
            if *scale {
                td = td.with_scale();
            } else if *precision {
                td = td.with_precision();
            }
            map.insert(td);
        }
        map
    }

    /// Plain SQL-92 names, usable with any reasonably standard database
    pub fn ansi() -> Self {
        Self::from_table(&[
            (BIT, "BIT", false, false),
            (BOOLEAN, "BOOLEAN", false, false),
            (TINYINT, "SMALLINT", false, false),
            (SMALLINT, "SMALLINT", false, false),
            (INTEGER, "INTEGER", false, false),
            (BIGINT, "BIGINT", false, false),
            (FLOAT, "FLOAT", true, false),
            (REAL, "REAL", false, false),
            (DOUBLE, "DOUBLE PRECISION", false, false),
            (NUMERIC, "NUMERIC", true, true),
            (DECIMAL, "DECIMAL", true, true),
            (CHAR, "CHAR", true, false),
            (VARCHAR, "VARCHAR", true, false),
            (LONGVARCHAR, "CLOB", false, false),
            (CLOB, "CLOB", false, false),
            (DATE, "DATE", false, false),
            (TIME, "TIME", false, false),
            (TIMESTAMP, "TIMESTAMP", false, false),
            (BINARY, "BINARY", true, false),
            (VARBINARY, "VARBINARY", true, false),
            (LONGVARBINARY, "BLOB", false, false),
            (BLOB, "BLOB", false, false),
        ])
    }

    pub fn postgres() -> Self {
        Self::from_table(&[
            (BIT, "BOOLEAN", false, false),
            (BOOLEAN, "BOOLEAN", false, false),
            (TINYINT, "SMALLINT", false, false),
            (SMALLINT, "SMALLINT", false, false),
            (INTEGER, "INTEGER", false, false),
            (BIGINT, "BIGINT", false, false),
            (FLOAT, "DOUBLE PRECISION", false, false),
            (REAL, "REAL", false, false),
            (DOUBLE, "DOUBLE PRECISION", false, false),
            (NUMERIC, "NUMERIC", true, true),
            (DECIMAL, "NUMERIC", true, true),
            (CHAR, "CHAR", true, false),
            (VARCHAR, "VARCHAR", true, false),
            (LONGVARCHAR, "TEXT", false, false),
            (CLOB, "TEXT", false, false),
            (DATE, "DATE", false, false),
            (TIME, "TIME", false, false),
            (TIMESTAMP, "TIMESTAMP", false, false),
            (BINARY, "BYTEA", false, false),
            (VARBINARY, "BYTEA", false, false),
            (LONGVARBINARY, "BYTEA", false, false),
            (BLOB, "BYTEA", false, false),
        ])
    }

    pub fn mysql() -> Self {
        Self::from_table(&[
            (BIT, "BIT", true, false),
            (BOOLEAN, "BOOLEAN", false, false),
            (TINYINT, "TINYINT", false, false),
            (SMALLINT, "SMALLINT", false, false),
            (INTEGER, "INT", false, false),
            (BIGINT, "BIGINT", false, false),
            (FLOAT, "FLOAT", false, false),
            (REAL, "DOUBLE", false, false),
            (DOUBLE, "DOUBLE", false, false),
            (NUMERIC, "DECIMAL", true, true),
            (DECIMAL, "DECIMAL", true, true),
            (CHAR, "CHAR", true, false),
            (VARCHAR, "VARCHAR", true, false),
            (LONGVARCHAR, "LONGTEXT", false, false),
            (CLOB, "LONGTEXT", false, false),
            (DATE, "DATE", false, false),
            (TIME, "TIME", false, false),
            (TIMESTAMP, "DATETIME", false, false),
            (BINARY, "BINARY", true, false),
            (VARBINARY, "VARBINARY", true, false),
            (LONGVARBINARY, "LONGBLOB", false, false),
            (BLOB, "BLOB", false, false),
        ])
    }

    pub fn sql_server() -> Self {
        Self::from_table(&[
            (BIT, "BIT", false, false),
            (BOOLEAN, "BIT", false, false),
            (TINYINT, "TINYINT", false, false),
            (SMALLINT, "SMALLINT", false, false),
            (INTEGER, "INT", false, false),
            (BIGINT, "BIGINT", false, false),
            (FLOAT, "FLOAT", false, false),
            (REAL, "REAL", false, false),
            (DOUBLE, "FLOAT", false, false),
            (NUMERIC, "NUMERIC", true, true),
            (DECIMAL, "DECIMAL", true, true),
            (CHAR, "CHAR", true, false),
            (VARCHAR, "VARCHAR", true, false),
            (LONGVARCHAR, "TEXT", false, false),
            (CLOB, "TEXT", false, false),
            (DATE, "DATETIME", false, false),
            (TIME, "DATETIME", false, false),
            (TIMESTAMP, "DATETIME", false, false),
            (BINARY, "BINARY", true, false),
            (VARBINARY, "VARBINARY", true, false),
            (LONGVARBINARY, "IMAGE", false, false),
            (BLOB, "IMAGE", false, false),
        ])
    }
}
