//! Configuration handling for schema_architect

use serde::{Deserialize, Serialize};
use std::fs;

use crate::error::{Error, Result};

/// Load configuration from a TOML file
pub fn load_from_file(path: &str) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("Failed to read config file: {}", e)))?;

    parse(&config_str)
}

/// Parse configuration from TOML text
pub fn parse(config_str: &str) -> Result<Config> {
    toml::from_str(config_str)
        .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))
}

/// Represents the complete schema_architect configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub compare: CompareConfig,
    pub logging: Option<LoggingConfig>,
}

/// Database connection configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub driver: String,
    pub url: String,
    pub pool_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
    /// Restricts introspection to one catalog
    pub catalog: Option<String>,
    /// Schema name or SQL `LIKE` pattern to introspect
    pub schema: Option<String>,
    /// Table name SQL `LIKE` pattern to introspect
    pub table_pattern: Option<String>,
}

/// DDL generation configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneratorConfig {
    pub dialect: String,
    /// Whether the generator may ask the live connection for type information
    pub allow_connection: bool,
    pub target_catalog: Option<String>,
    pub target_schema: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            dialect: "generic".to_string(),
            allow_connection: true,
            target_catalog: None,
            target_schema: None,
        }
    }
}

/// Output produced by a comparison
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Migration script turning the left database into the right one
    #[default]
    Sql,
    /// One sentence per difference
    English,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sql" => Ok(OutputFormat::Sql),
            "english" | "text" => Ok(OutputFormat::English),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::ConfigError(format!("Unknown output format: {}", other))),
        }
    }
}

/// Comparison configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CompareConfig {
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub suppress_similarities: bool,
    /// The database the left-hand side is compared against
    pub right: Option<DatabaseConfig>,
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: String,
    pub stdout: bool,
}
