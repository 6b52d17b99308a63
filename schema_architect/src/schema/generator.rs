//! DDL generator
//!
//! Turns a populated tree into `CREATE TABLE` / `ALTER TABLE` statements for
//! one dialect, either for a whole database or chunk by chunk from a diff.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;
use crate::error::{Error, Result};
use crate::schema::dialect::{Dialect, DropForeignKeyStyle, DropPrimaryKeyStyle, ModifyColumnStyle};
use crate::schema::diff::{DiffChunk, DiffType};
use crate::schema::source::MetadataSource;
use crate::schema::tree::{SchemaTree, TreeId};
use crate::schema::type_map::{TypeDescriptor, TypeMap};
use crate::schema::types::{type_codes, Column, NodeId, NodeKind, PopulationState, TableKind, TreeItem};
use crate::utils::naming::generate_unique_name;

/// What a warning is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    /// An object was renamed to avoid a collision
    NameChange,
    /// A column type had no target mapping and fell back to VARCHAR
    TypeMapping,
}

/// A non-fatal problem found while generating
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdlWarning {
    pub kind: WarningKind,
    /// Qualified name of the affected object, after any rename
    pub subject: String,
    pub reason: String,
    /// The original name or type
    pub original: String,
}

impl fmt::Display for DdlWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (was {})", self.reason, self.subject, self.original)
    }
}

/// Output of one generation run
#[derive(Debug, Clone)]
pub struct GeneratedDdl {
    pub statements: Vec<String>,
    pub warnings: Vec<DdlWarning>,
    dialect: Dialect,
    preamble: Vec<String>,
}

impl GeneratedDdl {
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Render the complete script: header, preamble comments, transaction
    /// wrapper and terminated statements
    pub fn script(&self) -> String {
        let mut out = format!(
            "-- Created by schema_architect {} DDL Generator {} --\n",
            self.dialect.display_name,
            env!("CARGO_PKG_VERSION")
        );
        for line in &self.preamble {
            out.push_str(&format!("-- {} --\n", line));
        }
        if let Some((begin, _)) = self.dialect.transaction {
            out.push_str(&format!("{}{}\n", begin, self.dialect.statement_terminator));
        }
        for statement in &self.statements {
            out.push('\n');
            out.push_str(statement);
            out.push_str(self.dialect.statement_terminator);
            out.push('\n');
        }
        if let Some((_, end)) = self.dialect.transaction {
            out.push_str(&format!("\n{}{}\n", end, self.dialect.statement_terminator));
        }
        out
    }
}

/// Generator settings for one target dialect
#[derive(Debug, Clone)]
pub struct DdlGenerator {
    dialect: Dialect,
    allow_connection: bool,
    discovered_types: Option<TypeMap>,
    supplied_types: Option<TypeMap>,
    target_catalog: Option<String>,
    target_schema: Option<String>,
}

impl DdlGenerator {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            allow_connection: true,
            discovered_types: None,
            supplied_types: None,
            target_catalog: None,
            target_schema: None,
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        Ok(Self::new(Dialect::from_name(&config.dialect)?)
            .allow_connection(config.allow_connection)
            .target(config.target_catalog.clone(), config.target_schema.clone()))
    }

    pub fn allow_connection(mut self, allow: bool) -> Self {
        self.allow_connection = allow;
        self
    }

    /// Qualify generated table names with a catalog and/or schema
    pub fn target(mut self, catalog: Option<String>, schema: Option<String>) -> Self {
        self.target_catalog = catalog;
        self.target_schema = schema;
        self
    }

    /// Use `types` when neither discovery nor the dialect provides a map.
    /// Otherwise it is ignored with a warning.
    pub fn with_type_map(mut self, types: TypeMap) -> Self {
        self.supplied_types = Some(types);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Load the target's type list from a live source
    pub async fn discover_types(&mut self, source: &dyn MetadataSource) -> Result<()> {
        if !self.allow_connection {
            return Err(Error::unsupported(
                "Can't discover target types while connections are disabled",
            ));
        }
        let records = source.type_info().await?;
        if records.is_empty() {
            warn!(dialect = %self.dialect, "Source reported no data types");
            return Ok(());
        }
        let map = TypeMap::from_records(&records);
        debug!(dialect = %self.dialect, types = map.len(), "Discovered target types");
        self.discovered_types = Some(map);
        Ok(())
    }

    fn resolve_types(&self) -> Result<TypeMap> {
        if let Some(types) = &self.discovered_types {
            self.warn_supplied_ignored("discovered");
            return Ok(types.clone());
        }
        if let Some(types) = self.dialect.static_types() {
            self.warn_supplied_ignored("built-in");
            return Ok(types);
        }
        if let Some(types) = &self.supplied_types {
            return Ok(types.clone());
        }
        Err(Error::unsupported(format!(
            "Can't create a type map for {} without database metadata",
            self.dialect
        )))
    }

    fn warn_supplied_ignored(&self, winner: &str) {
        if self.supplied_types.is_some() {
            warn!(dialect = %self.dialect, using = winner, "Supplied type map ignored");
        }
    }

    /// Start an incremental generation run
    pub fn writer(&self) -> Result<DdlWriter<'_>> {
        Ok(DdlWriter {
            generator: self,
            types: self.resolve_types()?,
            statements: Vec::new(),
            warnings: Vec::new(),
            top_level_names: HashSet::new(),
            renamed: HashMap::new(),
        })
    }

    /// Generate the full schema under `database`: every table with its
    /// primary key, then every relationship
    pub fn generate(&self, tree: &SchemaTree, database: NodeId) -> Result<GeneratedDdl> {
        tree.ensure_populated(database, "generated")?;
        let tables: Vec<NodeId> = tree
            .tables(database)
            .into_iter()
            .filter(|t| tree.table(*t).map(|t| t.kind == TableKind::Table).unwrap_or(false))
            .collect();
        for table in &tables {
            check_populated(tree, *table)?;
        }

        info!(dialect = %self.dialect, tables = tables.len(), "Generating DDL");
        let mut writer = self.writer()?;
        for table in &tables {
            writer.add_table(tree, *table)?;
            writer.add_primary_key(tree, *table)?;
        }
        for table in &tables {
            for rel in &tree.table(*table)?.exported_keys {
                writer.add_relationship(tree, *rel)?;
            }
        }

        let database_name = tree.name(TreeItem::Node(database)).to_string();
        Ok(writer.finish(vec![format!("Would Create Database {} here.", database_name)]))
    }

    /// Turn diff chunks into a script that makes the left tree look like
    /// the right one. Relationship drops come first and relationship adds
    /// last, so every statement in between sees consistent constraints.
    /// A changed primary key is dropped ahead of its table's column
    /// statements and added back after them.
    pub fn generate_migration(
        &self,
        left: &SchemaTree,
        right: &SchemaTree,
        chunks: &[DiffChunk],
    ) -> Result<GeneratedDdl> {
        let mut drop_relationships = Vec::new();
        let mut others = Vec::new();
        let mut add_relationships = Vec::new();

        for chunk in chunks {
            let Some(node) = chunk.resolve(left, right) else {
                warn!(subject = %chunk.subject.id, "Diff chunk refers to a missing node; skipping");
                continue;
            };
            match (&node.kind, chunk.kind) {
                (NodeKind::Relationship(_), DiffType::LeftOnly) => drop_relationships.push(chunk),
                (NodeKind::Relationship(_), DiffType::RightOnly) => add_relationships.push(chunk),
                (NodeKind::Relationship(_), _) => {}
                _ => others.push(chunk),
            }
        }

        let mut writer = self.writer()?;
        for chunk in drop_relationships {
            writer.drop_relationship(left, chunk.subject.id)?;
        }
        let mut pending_key = None;
        for chunk in others {
            let is_column = matches!(
                chunk.resolve(left, right).map(|n| &n.kind),
                Some(NodeKind::Column(_))
            );
            if !is_column {
                if let Some(table) = pending_key.take() {
                    writer.add_primary_key(right, table)?;
                }
            }
            if chunk.kind == DiffType::KeyChanged {
                pending_key = writer.change_primary_key(left, right, chunk)?;
            } else {
                writer.apply_chunk(left, right, chunk)?;
            }
        }
        if let Some(table) = pending_key {
            writer.add_primary_key(right, table)?;
        }
        for chunk in add_relationships {
            writer.add_relationship(right, chunk.subject.id)?;
        }

        info!(
            dialect = %self.dialect,
            statements = writer.statements.len(),
            "Migration generated"
        );
        let title = format!(
            "Generated SQL Script to turn {} into {}",
            left.name(TreeItem::Node(left.root())),
            right.name(TreeItem::Node(right.root()))
        );
        Ok(writer.finish(vec![title]))
    }
}

fn check_populated(tree: &SchemaTree, table: NodeId) -> Result<()> {
    let t = tree.table(table)?;
    if !t.is_populated() {
        return Err(Error::precondition(format!(
            "table {} must be populated before DDL is generated",
            tree.qualified_name(table)
        )));
    }
    for state in [&t.columns_state, &t.relationships_state] {
        if let PopulationState::Failed(reason) = state {
            warn!(table = %tree.qualified_name(table), reason = %reason, "Generating DDL for a table whose population failed");
        }
    }
    Ok(())
}

/// Accumulates statements and warnings for one generation run
pub struct DdlWriter<'g> {
    generator: &'g DdlGenerator,
    types: TypeMap,
    statements: Vec<String>,
    warnings: Vec<DdlWarning>,
    /// Lowercased table and relationship names emitted so far
    top_level_names: HashSet<String>,
    /// Names this run assigned to renamed nodes
    renamed: HashMap<(TreeId, NodeId), String>,
}

impl<'g> DdlWriter<'g> {
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn warnings(&self) -> &[DdlWarning] {
        &self.warnings
    }

    pub fn finish(self, preamble: Vec<String>) -> GeneratedDdl {
        GeneratedDdl {
            statements: self.statements,
            warnings: self.warnings,
            dialect: self.generator.dialect,
            preamble,
        }
    }

    fn dialect(&self) -> Dialect {
        self.generator.dialect
    }

    fn ident(&self, name: &str) -> String {
        self.dialect().identifier(name)
    }

    /// Current name of a node in this run
    fn name_of(&self, tree: &SchemaTree, id: NodeId) -> Result<String> {
        if let Some(name) = self.renamed.get(&(tree.id(), id)) {
            return Ok(name.clone());
        }
        Ok(tree.node(id)?.name().to_string())
    }

    fn table_ref(&self, tree: &SchemaTree, table: NodeId) -> Result<String> {
        let mut out = String::new();
        if let Some(catalog) = &self.generator.target_catalog {
            out.push_str(&self.ident(catalog));
            out.push('.');
        }
        if let Some(schema) = &self.generator.target_schema {
            out.push_str(&self.ident(schema));
            out.push('.');
        }
        out.push_str(&self.ident(&self.name_of(tree, table)?));
        Ok(out)
    }

    fn column_ref(&self, tree: &SchemaTree, column: NodeId) -> Result<String> {
        Ok(self.ident(&self.name_of(tree, column)?))
    }

    fn owning_table(&self, tree: &SchemaTree, column: NodeId) -> Result<NodeId> {
        tree.table_of_column(column).ok_or_else(|| {
            Error::precondition(format!("column {} is not attached to a table", column))
        })
    }

    /// Claim a top-level name, renaming on collision
    fn claim_top_level(&mut self, tree: &SchemaTree, id: NodeId, reason: &str) -> Result<String> {
        let original = tree.node(id)?.name().to_string();
        let name = generate_unique_name(&original, &self.top_level_names);
        if name != original {
            self.renamed.insert((tree.id(), id), name.clone());
            self.warnings.push(DdlWarning {
                kind: WarningKind::NameChange,
                subject: name.clone(),
                reason: reason.to_string(),
                original: original.clone(),
            });
            debug!(original = %original, renamed = %name, "{}", reason);
        }
        self.top_level_names.insert(name.to_lowercase());
        Ok(name)
    }

    fn type_for(&mut self, tree: &SchemaTree, column_id: NodeId, column: &Column) -> Result<TypeDescriptor> {
        if let Some(td) = self.types.get(column.type_code) {
            return Ok(td.clone());
        }
        let fallback = self
            .types
            .get(type_codes::VARCHAR)
            .cloned()
            .unwrap_or_else(|| TypeDescriptor::new(type_codes::VARCHAR, "VARCHAR").with_precision());
        let original = column
            .source_type_name
            .clone()
            .unwrap_or_else(|| format!("type code {}", column.type_code));
        self.warnings.push(DdlWarning {
            kind: WarningKind::TypeMapping,
            subject: tree.qualified_name(column_id),
            reason: "Unknown Target Type".to_string(),
            original,
        });
        Ok(fallback)
    }

    /// Target type of a column; fails when the column is nullable and the
    /// target type is not
    fn target_type(&mut self, tree: &SchemaTree, column_id: NodeId, column: &Column) -> Result<TypeDescriptor> {
        let td = self.type_for(tree, column_id, column)?;
        if column.nullable && !td.nullable {
            return Err(Error::unsupported(format!(
                "The data type {} is not nullable on the target database platform.",
                td.name
            )));
        }
        Ok(td)
    }

    /// `name TYPE [NOT] NULL`
    fn column_definition(&mut self, tree: &SchemaTree, column_id: NodeId) -> Result<String> {
        let column = tree.column(column_id)?.clone();
        let td = self.target_type(tree, column_id, &column)?;
        Ok(format!(
            "{} {} {}",
            self.column_ref(tree, column_id)?,
            td.render(column.precision, column.scale),
            if column.nullable { "NULL" } else { "NOT NULL" }
        ))
    }

    /// `CREATE TABLE` with every column
    pub fn add_table(&mut self, tree: &SchemaTree, table: NodeId) -> Result<()> {
        check_populated(tree, table)?;
        self.claim_top_level(tree, table, "Duplicate Table Name")?;

        let table_name = self.name_of(tree, table)?;
        let columns = tree.table(table)?.columns.clone();
        let mut column_names = HashSet::new();
        let mut definitions = Vec::with_capacity(columns.len());
        for column_id in columns {
            let original = tree.column(column_id)?.name.clone();
            let name = generate_unique_name(&original, &column_names);
            if name != original {
                self.renamed.insert((tree.id(), column_id), name.clone());
                self.warnings.push(DdlWarning {
                    kind: WarningKind::NameChange,
                    subject: format!("{}.{}", table_name, name),
                    reason: "Duplicate Col Name".to_string(),
                    original,
                });
            }
            column_names.insert(name.to_lowercase());
            let definition = self.column_definition(tree, column_id)?;
            definitions.push(format!("    {}", definition));
        }

        let statement = format!(
            "CREATE TABLE {} (\n{}\n)",
            self.table_ref(tree, table)?,
            definitions.join(",\n")
        );
        self.statements.push(statement);
        Ok(())
    }

    pub fn drop_table(&mut self, tree: &SchemaTree, table: NodeId) -> Result<()> {
        let statement = format!("DROP TABLE {}", self.table_ref(tree, table)?);
        self.statements.push(statement);
        Ok(())
    }

    pub fn add_column(&mut self, tree: &SchemaTree, column: NodeId) -> Result<()> {
        let table = self.owning_table(tree, column)?;
        let statement = format!(
            "ALTER TABLE {} {} {}",
            self.table_ref(tree, table)?,
            self.dialect().add_column_keyword,
            self.column_definition(tree, column)?
        );
        self.statements.push(statement);
        Ok(())
    }

    pub fn drop_column(&mut self, tree: &SchemaTree, column: NodeId) -> Result<()> {
        let table = self.owning_table(tree, column)?;
        let statement = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.table_ref(tree, table)?,
            self.column_ref(tree, column)?
        );
        self.statements.push(statement);
        Ok(())
    }

    /// Change a column's type and nullability to match `column`
    pub fn modify_column(&mut self, tree: &SchemaTree, column: NodeId) -> Result<()> {
        let table = self.owning_table(tree, column)?;
        let table_ref = self.table_ref(tree, table)?;
        let statement = match self.dialect().modify_column {
            ModifyColumnStyle::AlterColumn => format!(
                "ALTER TABLE {} ALTER COLUMN {}",
                table_ref,
                self.column_definition(tree, column)?
            ),
            ModifyColumnStyle::ModifyColumn => format!(
                "ALTER TABLE {} MODIFY COLUMN {}",
                table_ref,
                self.column_definition(tree, column)?
            ),
            ModifyColumnStyle::AlterColumnType => {
                let c = tree.column(column)?.clone();
                let td = self.target_type(tree, column, &c)?;
                let name = self.column_ref(tree, column)?;
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}, ALTER COLUMN {} {} NOT NULL",
                    table_ref,
                    name,
                    td.render(c.precision, c.scale),
                    name,
                    if c.nullable { "DROP" } else { "SET" }
                )
            }
        };
        self.statements.push(statement);
        Ok(())
    }

    /// `ALTER TABLE fk ADD CONSTRAINT name FOREIGN KEY (...) REFERENCES pk (...)`
    pub fn add_relationship(&mut self, tree: &SchemaTree, relationship: NodeId) -> Result<()> {
        let rel = tree.relationship(relationship)?.clone();
        let name = self.claim_top_level(tree, relationship, "Duplicate FK Name")?;

        let mut fk_columns = Vec::with_capacity(rel.mappings.len());
        let mut pk_columns = Vec::with_capacity(rel.mappings.len());
        for mapping in &rel.mappings {
            fk_columns.push(self.column_ref(tree, mapping.fk_column)?);
            pk_columns.push(self.column_ref(tree, mapping.pk_column)?);
        }

        let statement = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.table_ref(tree, rel.fk_table)?,
            self.ident(&name),
            fk_columns.join(", "),
            self.table_ref(tree, rel.pk_table)?,
            pk_columns.join(", ")
        );
        self.statements.push(statement);
        Ok(())
    }

    pub fn drop_relationship(&mut self, tree: &SchemaTree, relationship: NodeId) -> Result<()> {
        let rel = tree.relationship(relationship)?;
        let keyword = match self.dialect().drop_foreign_key {
            DropForeignKeyStyle::Constraint => "DROP CONSTRAINT",
            DropForeignKeyStyle::ForeignKey => "DROP FOREIGN KEY",
        };
        let statement = format!(
            "ALTER TABLE {} {} {}",
            self.table_ref(tree, rel.fk_table)?,
            keyword,
            self.ident(&self.name_of(tree, relationship)?)
        );
        self.statements.push(statement);
        Ok(())
    }

    fn primary_key_name(&self, tree: &SchemaTree, table: NodeId) -> Result<String> {
        let t = tree.table(table)?;
        Ok(match &t.primary_key_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}_pk", self.name_of(tree, table)?),
        })
    }

    /// Primary key constraint in key-sequence order; nothing when the
    /// table has no key columns
    pub fn add_primary_key(&mut self, tree: &SchemaTree, table: NodeId) -> Result<()> {
        let key_columns = tree.primary_key_columns(table)?;
        if key_columns.is_empty() {
            return Ok(());
        }
        let columns = key_columns
            .iter()
            .map(|c| self.column_ref(tree, *c))
            .collect::<Result<Vec<_>>>()?;
        let statement = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
            self.table_ref(tree, table)?,
            self.ident(&self.primary_key_name(tree, table)?),
            columns.join(", ")
        );
        self.statements.push(statement);
        Ok(())
    }

    pub fn drop_primary_key(&mut self, tree: &SchemaTree, table: NodeId) -> Result<()> {
        let table_ref = self.table_ref(tree, table)?;
        let statement = match self.dialect().drop_primary_key {
            DropPrimaryKeyStyle::Constraint => format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                table_ref,
                self.ident(&self.primary_key_name(tree, table)?)
            ),
            DropPrimaryKeyStyle::PrimaryKey => format!("ALTER TABLE {} DROP PRIMARY KEY", table_ref),
        };
        self.statements.push(statement);
        Ok(())
    }

    /// Drop the old key of a KEY_CHANGED table. Returns the right-hand table
    /// whose new key still has to be added.
    fn change_primary_key(
        &mut self,
        left: &SchemaTree,
        right: &SchemaTree,
        chunk: &DiffChunk,
    ) -> Result<Option<NodeId>> {
        if let Some(old) = chunk.left_node() {
            if left.has_primary_key(old) {
                self.drop_primary_key(left, old)?;
            }
        }
        Ok(chunk.right_node().filter(|table| right.has_primary_key(*table)))
    }

    /// Emit whatever a table or column chunk calls for
    fn apply_chunk(&mut self, left: &SchemaTree, right: &SchemaTree, chunk: &DiffChunk) -> Result<()> {
        let tree = chunk.subject.tree(left, right);
        let id = chunk.subject.id;
        let node = tree.node(id)?;

        match (&node.kind, chunk.kind) {
            (NodeKind::Table(_), DiffType::LeftOnly) => self.drop_table(tree, id),
            (NodeKind::Table(t), DiffType::RightOnly) => {
                if t.kind == TableKind::Table {
                    self.add_table(tree, id)?;
                    self.add_primary_key(tree, id)?;
                }
                Ok(())
            }
            (NodeKind::Table(_), DiffType::KeyChanged) => {
                if let Some(table) = self.change_primary_key(left, right, chunk)? {
                    self.add_primary_key(right, table)?;
                }
                Ok(())
            }
            (NodeKind::Column(_), DiffType::LeftOnly) => self.drop_column(tree, id),
            (NodeKind::Column(_), DiffType::RightOnly) => self.add_column(tree, id),
            (NodeKind::Column(_), DiffType::Modified) => self.modify_column(tree, id),
            _ => Ok(()),
        }
    }
}
