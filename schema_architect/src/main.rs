//! schema_architect CLI
//!
//! Usage:
//!   schema_architect [--config <file>] ddl [--dialect <dialect>] [--output <file>]
//!   schema_architect [--config <file>] compare [--right-url <url>] [--format sql|english|json]
//!
//! Examples:
//!   schema_architect ddl --dialect mysql
//!   schema_architect compare --right-url postgres://localhost/shop_next --format english

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use schema_architect::config::{self, Config, DatabaseConfig, OutputFormat};
use schema_architect::db::connection::driver_for_url;
use schema_architect::schema::generator::GeneratedDdl;
use schema_architect::utils::logging::init_logging;
use schema_architect::ArchitectClient;

#[derive(Parser)]
#[command(name = "schema_architect")]
#[command(about = "Introspect database schemas, generate DDL and compare schemas")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "schema_architect.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate DDL that recreates the configured database
    Ddl {
        /// Target dialect (generic, postgres, mysql, sqlserver)
        #[arg(short, long)]
        dialect: Option<String>,

        /// Write the script here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare the configured database with another one
    Compare {
        /// Connection URL of the right-hand database (overrides [compare.right])
        #[arg(long)]
        right_url: Option<String>,

        /// Output format
        #[arg(short, long)]
        format: Option<FormatArg>,

        /// Dialect of the migration script
        #[arg(short, long)]
        dialect: Option<String>,

        /// Leave unchanged tables and columns out of the English report
        #[arg(long)]
        suppress_similarities: bool,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    /// Migration script turning the configured database into the other one
    Sql,
    /// One sentence per difference
    English,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Sql => OutputFormat::Sql,
            FormatArg::English => OutputFormat::English,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_from_file(&cli.config.to_string_lossy())
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config.logging).context("initializing logging")?;

    match cli.command {
        Commands::Ddl { dialect, output } => {
            if let Some(dialect) = dialect {
                config.generator.dialect = dialect;
            }
            cmd_ddl(config, output).await
        }
        Commands::Compare {
            right_url,
            format,
            dialect,
            suppress_similarities,
            output,
        } => {
            if let Some(dialect) = dialect {
                config.generator.dialect = dialect;
            }
            if let Some(format) = format {
                config.compare.output_format = format.into();
            }
            config.compare.suppress_similarities |= suppress_similarities;
            if let Some(url) = right_url {
                config.compare.right = Some(right_database(&config.database, url)?);
            }
            cmd_compare(config, output).await
        }
    }
}

/// A right-hand database that shares the left's pool settings
fn right_database(left: &DatabaseConfig, url: String) -> anyhow::Result<DatabaseConfig> {
    let driver = driver_for_url(&url)?.to_string();
    Ok(DatabaseConfig {
        driver,
        url,
        pool_size: left.pool_size,
        timeout_seconds: left.timeout_seconds,
        catalog: None,
        schema: left.schema.clone(),
        table_pattern: left.table_pattern.clone(),
    })
}

fn emit(text: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Output written");
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn report_warnings(ddl: &GeneratedDdl) {
    for warning in &ddl.warnings {
        eprintln!("warning: {}", warning);
    }
}

async fn cmd_ddl(config: Config, output: Option<PathBuf>) -> anyhow::Result<()> {
    let client = ArchitectClient::new(config).await.context("connecting to database")?;
    let ddl = client.generate_ddl().await?;
    report_warnings(&ddl);
    emit(&ddl.script(), output)
}

async fn cmd_compare(config: Config, output: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(right) = config.compare.right.clone() else {
        bail!("nothing to compare against: set [compare.right] or pass --right-url");
    };
    let format = config.compare.output_format;
    let suppress = config.compare.suppress_similarities;

    let client = ArchitectClient::new(config).await.context("connecting to left database")?;
    let comparison = client.compare_with(&right).await?;
    let generator = client.generator().await?;

    let rendered = comparison.render(format, &generator, suppress)?;
    emit(&rendered, output)
}
