//! Error types for schema_architect

use thiserror::Error;

/// Result type for schema_architect operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for schema_architect
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A metadata source failed while a node was being populated.
    #[error("Failed to populate {node}: {source}")]
    MetadataFetchError {
        node: String,
        #[source]
        source: Box<Error>,
    },

    /// A caller broke an ordering or ownership rule of the tree API.
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    /// The active dialect (or generator setup) cannot express the request.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Wrap a source failure as a population failure for `node`
    pub fn fetch(node: impl Into<String>, source: Error) -> Self {
        Error::MetadataFetchError {
            node: node.into(),
            source: Box::new(source),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Error::PreconditionViolation(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedOperationError(message.into())
    }
}

/// Convert Serde JSON errors to schema_architect errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::SerializationError(error.to_string())
    }
}

/// Convert TOML deserialization errors to schema_architect errors
impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::ConfigError(error.to_string())
    }
}
