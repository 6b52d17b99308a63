//! schema_architect: database schema metadata trees, DDL generation and
//! schema comparison
//!
//! A live database is introspected lazily into a [`SchemaTree`]. Trees can be
//! turned into DDL for a target dialect, or compared with each other to
//! produce a migration script or a report.

pub mod config;
pub mod db;
pub mod error;
pub mod schema;
pub mod utils;

use std::sync::Arc;
use tracing::info;

// Re-export main types for easier access
pub use config::{Config, DatabaseConfig, OutputFormat};
pub use db::connection::DatabaseConnection;
pub use error::{Error, Result};
pub use schema::diff::{compare, DiffChunk, DiffType};
pub use schema::generator::{DdlGenerator, GeneratedDdl};
pub use schema::populate::LiveDatabase;
pub use schema::tree::SchemaTree;

use schema::report;
use schema::source::TableFilter;
use schema::types::{TableKind, TreeItem};

/// Initialize a client with the specified configuration file
pub async fn init(config_path: &str) -> Result<ArchitectClient> {
    let config = config::load_from_file(config_path)?;
    ArchitectClient::new(config).await
}

/// Name a database after its catalog, or the last path segment of its URL
pub fn database_name(config: &DatabaseConfig) -> String {
    if let Some(catalog) = &config.catalog {
        return catalog.clone();
    }
    let path = config.url.split(['?', '#']).next().unwrap_or(&config.url);
    path.rsplit(['/', ':'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(&config.driver)
        .to_string()
}

/// The main client: one configured database plus generator settings
pub struct ArchitectClient {
    config: Config,
    connection: DatabaseConnection,
}

impl ArchitectClient {
    /// Connect to the configured database
    pub async fn new(config: Config) -> Result<Self> {
        let connection = DatabaseConnection::connect(&config.database).await?;
        Ok(Self { config, connection })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// An unpopulated tree over the configured database
    pub fn live_database(&self) -> LiveDatabase {
        live_database(&self.config.database, &self.connection)
    }

    /// Introspect the whole configured database
    pub async fn load_schema(&self) -> Result<SchemaTree> {
        let live = self.live_database();
        live.populate_all().await?;
        Ok(live.into_tree())
    }

    /// A generator for the configured dialect. Dialects without built-in
    /// types learn them from the connection when that is allowed.
    pub async fn generator(&self) -> Result<DdlGenerator> {
        let mut generator = DdlGenerator::from_config(&self.config.generator)?;
        if generator.dialect().static_types().is_none() && self.config.generator.allow_connection {
            generator.discover_types(&self.connection).await?;
        }
        Ok(generator)
    }

    /// Introspect and generate the full DDL for the configured database
    pub async fn generate_ddl(&self) -> Result<GeneratedDdl> {
        let tree = self.load_schema().await?;
        let generator = self.generator().await?;
        generator.generate(&tree, tree.root())
    }

    /// Introspect this database and `right`, and compare them
    pub async fn compare_with(&self, right: &DatabaseConfig) -> Result<Comparison> {
        let right_connection = DatabaseConnection::connect(right).await?;
        let left_live = self.live_database();
        let right_live = live_database(right, &right_connection);

        let (left_result, right_result) = tokio::join!(left_live.populate_all(), right_live.populate_all());
        left_result?;
        right_result?;
        right_connection.close().await;

        Comparison::new(left_live.into_tree(), right_live.into_tree())
    }
}

fn live_database(config: &DatabaseConfig, connection: &DatabaseConnection) -> LiveDatabase {
    let mut filter = TableFilter::from_config(config).with_kinds(vec![TableKind::Table, TableKind::View]);
    if filter.schema_pattern.is_none() {
        filter.schema_pattern = connection.default_schema().map(str::to_string);
    }
    LiveDatabase::new(&database_name(config), Arc::new(connection.clone())).with_filter(filter)
}

/// Two populated trees and their differences in both directions
pub struct Comparison {
    pub left: SchemaTree,
    pub right: SchemaTree,
    /// What it takes to turn left into right
    pub chunks: Vec<DiffChunk>,
    /// What it takes to turn right into left
    pub reverse: Vec<DiffChunk>,
}

impl Comparison {
    pub fn new(left: SchemaTree, right: SchemaTree) -> Result<Self> {
        let chunks = compare(&left, left.root(), &right, right.root())?;
        let reverse = compare(&right, right.root(), &left, left.root())?;
        info!(
            left = %left.name(TreeItem::Node(left.root())),
            right = %right.name(TreeItem::Node(right.root())),
            differences = chunks.iter().filter(|c| c.kind != DiffType::Same).count(),
            "Comparison complete"
        );
        Ok(Self { left, right, chunks, reverse })
    }

    pub fn has_differences(&self) -> bool {
        schema::diff::has_differences(&self.chunks)
    }

    /// Render in the requested format. SQL turns left into right; the
    /// English report covers both directions.
    pub fn render(&self, format: OutputFormat, generator: &DdlGenerator, suppress_similarities: bool) -> Result<String> {
        match format {
            OutputFormat::Sql => Ok(generator.generate_migration(&self.left, &self.right, &self.chunks)?.script()),
            OutputFormat::English => {
                let left_name = self.left.name(TreeItem::Node(self.left.root()));
                let right_name = self.right.name(TreeItem::Node(self.right.root()));
                Ok(format!(
                    "== {} -> {} ==\n{}\n== {} -> {} ==\n{}",
                    left_name,
                    right_name,
                    report::english(&self.left, &self.right, &self.chunks, suppress_similarities),
                    right_name,
                    left_name,
                    report::english(&self.right, &self.left, &self.reverse, suppress_similarities),
                ))
            }
            OutputFormat::Json => report::json(&self.left, &self.right, &self.chunks),
        }
    }
}
