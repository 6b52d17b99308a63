//! Database connection handling
//!
//! This module opens the sqlx pools that live metadata is read from.

use sqlx::{
    mysql::MySqlPoolOptions, postgres::PgPoolOptions, sqlite::SqlitePoolOptions, MySql, Pool,
    Postgres, Sqlite,
};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Enumeration of supported database types
#[derive(Debug, Clone)]
pub enum DatabaseConnection {
    Postgres(Pool<Postgres>),
    MySql(Pool<MySql>),
    Sqlite(Pool<Sqlite>),
}

impl DatabaseConnection {
    /// Create a new database connection from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool_size = config.pool_size.unwrap_or(10);
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(30));

        let connection = match normalize_driver(&config.driver)? {
            "postgres" => {
                let pool = PgPoolOptions::new()
                    .max_connections(pool_size)
                    .acquire_timeout(timeout)
                    .connect(&config.url)
                    .await?;
                DatabaseConnection::Postgres(pool)
            }
            "mysql" => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(pool_size)
                    .acquire_timeout(timeout)
                    .connect(&config.url)
                    .await?;
                DatabaseConnection::MySql(pool)
            }
            _ => {
                let pool = SqlitePoolOptions::new()
                    .max_connections(pool_size)
                    .acquire_timeout(timeout)
                    .connect(&config.url)
                    .await?;
                DatabaseConnection::Sqlite(pool)
            }
        };

        info!(driver = connection.driver(), pool_size, "Connected to database");
        Ok(connection)
    }

    /// Canonical driver name of this connection
    pub fn driver(&self) -> &'static str {
        match self {
            DatabaseConnection::Postgres(_) => "postgres",
            DatabaseConnection::MySql(_) => "mysql",
            DatabaseConnection::Sqlite(_) => "sqlite",
        }
    }

    /// Schema introspected when the configuration names none
    pub fn default_schema(&self) -> Option<&'static str> {
        match self {
            DatabaseConnection::Postgres(_) => Some("public"),
            _ => None,
        }
    }

    pub async fn close(&self) {
        match self {
            DatabaseConnection::Postgres(pool) => pool.close().await,
            DatabaseConnection::MySql(pool) => pool.close().await,
            DatabaseConnection::Sqlite(pool) => pool.close().await,
        }
    }
}

/// Map a configured driver name onto one of the supported drivers
pub fn normalize_driver(driver: &str) -> Result<&'static str> {
    match driver.to_lowercase().as_str() {
        "postgres" | "postgresql" => Ok("postgres"),
        "mysql" | "mariadb" => Ok("mysql"),
        "sqlite" => Ok("sqlite"),
        other => Err(Error::DatabaseError(format!("Unsupported database driver: {}", other))),
    }
}

/// Guess the driver from a connection URL's scheme
pub fn driver_for_url(url: &str) -> Result<&'static str> {
    let scheme = url
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| Error::ConfigError(format!("Connection URL has no scheme: {}", url)))?;
    normalize_driver(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("postgres://localhost/app", "postgres")]
    #[case("postgresql://localhost/app", "postgres")]
    #[case("mysql://root@localhost/app", "mysql")]
    #[case("sqlite::memory:", "sqlite")]
    #[case("sqlite://data/app.db", "sqlite")]
    fn test_driver_for_url(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(driver_for_url(url).unwrap(), expected);
    }

    #[test]
    fn test_unknown_driver() {
        assert!(matches!(normalize_driver("oracle"), Err(Error::DatabaseError(_))));
        assert!(matches!(driver_for_url("no-scheme"), Err(Error::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_connect_in_memory_sqlite() {
        let config = DatabaseConfig {
            driver: "sqlite".to_string(),
            url: "sqlite::memory:".to_string(),
            pool_size: Some(1),
            timeout_seconds: Some(5),
            catalog: None,
            schema: None,
            table_pattern: None,
        };
        let connection = DatabaseConnection::connect(&config).await.unwrap();
        assert_eq!(connection.driver(), "sqlite");
        assert_eq!(connection.default_schema(), None);
        connection.close().await;
    }
}
