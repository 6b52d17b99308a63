//! Schema module for schema_architect
//!
//! This module holds the metadata tree and everything that reads or writes
//! it: population from a live source, DDL generation and comparison.

pub mod analyzer;
pub mod dialect;
pub mod diff;
pub mod generator;
pub mod populate;
pub mod report;
pub mod source;
pub mod tree;
pub mod type_map;
pub mod types;

// Re-export key types
pub use dialect::Dialect;
pub use diff::{compare, DiffChunk, DiffType};
pub use generator::{DdlGenerator, DdlWarning, DdlWriter, GeneratedDdl, WarningKind};
pub use populate::LiveDatabase;
pub use source::{InMemorySource, MetadataSource, TableFilter};
pub use tree::{SchemaTree, TreeEvent};
pub use type_map::{TypeDescriptor, TypeMap};
pub use types::{Column, NodeId, NodeKind, PopulationState, TableKind, TreeItem};
