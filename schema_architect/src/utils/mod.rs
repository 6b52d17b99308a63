//! Utilities for schema_architect
//!
//! This module provides utility functions used across the library.

pub mod logging;
pub mod naming;

pub use naming::{escape_sql_keyword, generate_unique_name, to_qualified_name};
