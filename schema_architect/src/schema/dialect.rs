//! Target dialect capability records
//!
//! A `Dialect` is plain data: the generator asks it how to spell
//! identifiers, terminators and the handful of statements whose syntax
//! differs between databases.

use std::fmt;

use crate::error::{Error, Result};
use crate::schema::type_map::TypeMap;
use crate::utils::naming::{escape_sql_keyword, format_sql_identifier};

/// How a column's type and nullability are changed in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyColumnStyle {
    /// `ALTER COLUMN c <type> [NOT] NULL`
    AlterColumn,
    /// `ALTER COLUMN c TYPE <type>, ALTER COLUMN c SET|DROP NOT NULL`
    AlterColumnType,
    /// `MODIFY COLUMN c <type> [NOT] NULL`
    ModifyColumn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropForeignKeyStyle {
    /// `DROP CONSTRAINT <name>`
    Constraint,
    /// `DROP FOREIGN KEY <name>`
    ForeignKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPrimaryKeyStyle {
    /// `DROP CONSTRAINT <pk name>`
    Constraint,
    /// `DROP PRIMARY KEY`
    PrimaryKey,
}

/// Everything the generator needs to know about a target database
#[derive(Clone, Copy)]
pub struct Dialect {
    pub name: &'static str,
    pub display_name: &'static str,
    quote: fn(&str) -> String,
    pub statement_terminator: &'static str,
    /// Statements wrapped around a whole script
    pub transaction: Option<(&'static str, &'static str)>,
    static_types: Option<fn() -> TypeMap>,
    pub add_column_keyword: &'static str,
    pub modify_column: ModifyColumnStyle,
    pub drop_foreign_key: DropForeignKeyStyle,
    pub drop_primary_key: DropPrimaryKeyStyle,
}

fn underscore_spaces(name: &str) -> String {
    name.replace(' ', "_")
}

fn postgres_identifier(name: &str) -> String {
    escape_sql_keyword(&underscore_spaces(name), "postgres")
}

fn mysql_identifier(name: &str) -> String {
    format_sql_identifier(name, "mysql")
}

fn sql_server_identifier(name: &str) -> String {
    format_sql_identifier(name, "sqlserver")
}

/// Works against anything, but needs a live connection (or a supplied
/// type map) because it carries no types of its own
pub const GENERIC: Dialect = Dialect {
    name: "generic",
    display_name: "Generic",
    quote: underscore_spaces,
    statement_terminator: ";",
    transaction: None,
    static_types: None,
    add_column_keyword: "ADD",
    modify_column: ModifyColumnStyle::AlterColumn,
    drop_foreign_key: DropForeignKeyStyle::Constraint,
    drop_primary_key: DropPrimaryKeyStyle::Constraint,
};

pub const POSTGRES: Dialect = Dialect {
    name: "postgres",
    display_name: "PostgreSQL",
    quote: postgres_identifier,
    statement_terminator: ";",
    transaction: Some(("BEGIN", "COMMIT")),
    static_types: Some(TypeMap::postgres),
    add_column_keyword: "ADD COLUMN",
    modify_column: ModifyColumnStyle::AlterColumnType,
    drop_foreign_key: DropForeignKeyStyle::Constraint,
    drop_primary_key: DropPrimaryKeyStyle::Constraint,
};

pub const MYSQL: Dialect = Dialect {
    name: "mysql",
    display_name: "MySQL",
    quote: mysql_identifier,
    statement_terminator: ";",
    transaction: None,
    static_types: Some(TypeMap::mysql),
    add_column_keyword: "ADD COLUMN",
    modify_column: ModifyColumnStyle::ModifyColumn,
    drop_foreign_key: DropForeignKeyStyle::ForeignKey,
    drop_primary_key: DropPrimaryKeyStyle::PrimaryKey,
};

pub const SQL_SERVER: Dialect = Dialect {
    name: "sqlserver",
    display_name: "SQL Server",
    quote: sql_server_identifier,
    statement_terminator: "\nGO",
    transaction: Some(("BEGIN TRANSACTION", "COMMIT TRANSACTION")),
    static_types: Some(TypeMap::sql_server),
    add_column_keyword: "ADD",
    modify_column: ModifyColumnStyle::AlterColumn,
    drop_foreign_key: DropForeignKeyStyle::Constraint,
    drop_primary_key: DropPrimaryKeyStyle::Constraint,
};

impl Dialect {
    pub fn all() -> [Dialect; 4] {
        [GENERIC, POSTGRES, MYSQL, SQL_SERVER]
    }

    /// Look a dialect up by name (case-insensitive, common aliases accepted)
    pub fn from_name(name: &str) -> Result<Dialect> {
        match name.to_lowercase().as_str() {
            "generic" | "ansi" => Ok(GENERIC),
            "postgres" | "postgresql" => Ok(POSTGRES),
            "mysql" | "mariadb" => Ok(MYSQL),
            "sqlserver" | "mssql" | "sql server" => Ok(SQL_SERVER),
            "sqlite" => Err(Error::ConfigError(
                "SQLite is supported for introspection only; choose a DDL dialect".to_string(),
            )),
            other => Err(Error::ConfigError(format!("Unknown dialect: {}", other))),
        }
    }

    /// Spell an identifier for this dialect
    pub fn identifier(&self, name: &str) -> String {
        (self.quote)(name)
    }

    /// The dialect's built-in type map, if it has one
    pub fn static_types(&self) -> Option<TypeMap> {
        self.static_types.map(|build| build())
    }
}

impl fmt::Debug for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialect")
            .field("name", &self.name)
            .field("statement_terminator", &self.statement_terminator)
            .field("transaction", &self.transaction)
            .field("modify_column", &self.modify_column)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name)
    }
}
