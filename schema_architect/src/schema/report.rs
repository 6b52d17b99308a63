//! Human- and machine-readable renderings of a diff

use serde::Serialize;

use crate::error::Result;
use crate::schema::diff::{DiffChunk, DiffType};
use crate::schema::tree::SchemaTree;
use crate::schema::types::NodeKind;

fn sentence(kind: DiffType) -> &'static str {
    match kind {
        DiffType::LeftOnly => "should be removed",
        DiffType::Modified => "should be modified",
        DiffType::Same => "needs no changes",
        DiffType::RightOnly => "should be added",
        DiffType::KeyChanged => "needs a different primary key",
    }
}

/// One line per chunk: "Table orders should be added" and so on.
///
/// With `suppress_similarities`, SAME chunks are skipped. The last skipped
/// table is remembered so that its first differing column is introduced by
/// a single "Table X needs no changes" line.
pub fn english(left: &SchemaTree, right: &SchemaTree, chunks: &[DiffChunk], suppress_similarities: bool) -> String {
    let mut out = String::new();
    let mut unchanged_table: Option<String> = None;

    for chunk in chunks {
        let node = chunk.resolve(left, right);

        if suppress_similarities && chunk.kind == DiffType::Same {
            if let Some(NodeKind::Table(t)) = node.map(|n| &n.kind) {
                unchanged_table = Some(t.name.clone());
            }
            continue;
        }

        match node.map(|n| &n.kind) {
            None => {
                out.push_str("ERROR: null object in diff list\n");
                continue;
            }
            Some(NodeKind::Table(t)) => {
                unchanged_table = None;
                out.push_str(&format!("Table {} ", t.name));
            }
            Some(NodeKind::Column(c)) => {
                if let Some(table) = unchanged_table.take() {
                    out.push_str(&format!("Table {} needs no changes\n", table));
                }
                out.push_str(&format!("\tColumn {} ", c.name));
            }
            Some(NodeKind::Catalog(g)) | Some(NodeKind::Schema(g)) => {
                unchanged_table = None;
                out.push_str(&format!("{} {} ", node.map(|n| n.kind.label()).unwrap_or_default(), g.name));
            }
            Some(NodeKind::Relationship(r)) => {
                out.push_str(&format!("Foreign Key {} ", r.name));
            }
            Some(other) => {
                out.push_str(&format!("{} {} ", other.label(), node.map(|n| n.name()).unwrap_or_default()));
            }
        }
        out.push_str(sentence(chunk.kind));
        out.push('\n');
    }
    out
}

/// Serialized form of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    #[serde(rename = "type")]
    pub diff_type: DiffType,
    pub object: String,
    pub name: Option<String>,
    pub qualified_name: Option<String>,
    /// Left-hand name when a matched pair is reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_name: Option<String>,
}

impl ChunkReport {
    pub fn from_chunk(left: &SchemaTree, right: &SchemaTree, chunk: &DiffChunk) -> Self {
        let tree = chunk.subject.tree(left, right);
        let node = chunk.resolve(left, right);
        let left_name = chunk
            .secondary
            .as_ref()
            .and_then(|s| s.resolve(left, right))
            .map(|n| n.name().to_string())
            .filter(|name| Some(name.as_str()) != node.map(|n| n.name()));

        Self {
            diff_type: chunk.kind,
            object: node.map(|n| n.kind.label().to_lowercase()).unwrap_or_else(|| "missing".to_string()),
            name: node.map(|n| n.name().to_string()),
            qualified_name: node.map(|n| tree.qualified_name(n.id)),
            left_name,
        }
    }
}

/// Pretty-printed JSON array of [`ChunkReport`]s
pub fn json(left: &SchemaTree, right: &SchemaTree, chunks: &[DiffChunk]) -> Result<String> {
    let reports: Vec<ChunkReport> = chunks
        .iter()
        .map(|chunk| ChunkReport::from_chunk(left, right, chunk))
        .collect();
    Ok(serde_json::to_string_pretty(&reports)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::diff::{compare, NodeRef};
    use crate::schema::types::{type_codes, Column, NodeId, TableKind};
    use pretty_assertions::assert_eq;

    fn trees() -> (SchemaTree, SchemaTree) {
        let mut left = SchemaTree::new("left");
        let a = left.add_table(left.root(), "accounts", TableKind::Table).unwrap();
        left.add_column(a, Column::new("id", type_codes::INTEGER).primary_key(1)).unwrap();
        let o = left.add_table(left.root(), "orders", TableKind::Table).unwrap();
        left.add_column(o, Column::new("id", type_codes::INTEGER).primary_key(1)).unwrap();
        left.add_column(o, Column::new("total", type_codes::INTEGER)).unwrap();

        let mut right = left.clone();
        let orders = right.find_table(None, None, "orders").unwrap();
        right.add_column(orders, Column::new("placed_at", type_codes::TIMESTAMP).nullable(true)).unwrap();
        (left, right)
    }

    #[test]
    fn test_english_full_report() {
        let (left, right) = trees();
        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();

        assert_eq!(
            english(&left, &right, &chunks, false),
            "Table accounts needs no changes\n\
             \tColumn id needs no changes\n\
             Table orders needs no changes\n\
             \tColumn id needs no changes\n\
             \tColumn total needs no changes\n\
             \tColumn placed_at should be added\n"
        );
    }

    #[test]
    fn test_english_suppress_similarities() {
        let (left, right) = trees();
        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();

        assert_eq!(
            english(&left, &right, &chunks, true),
            "Table orders needs no changes\n\tColumn placed_at should be added\n"
        );
    }

    #[test]
    fn test_english_reversed_direction() {
        let (left, right) = trees();
        let chunks = compare(&right, right.root(), &left, left.root()).unwrap();
        let report = english(&right, &left, &chunks, true);
        assert_eq!(report, "Table orders needs no changes\n\tColumn placed_at should be removed\n");
    }

    #[test]
    fn test_english_reports_schemas() {
        let mut left = SchemaTree::new("left");
        let sales = left.add_schema(left.root(), "sales").unwrap();
        left.add_table(sales, "orders", TableKind::Table).unwrap();
        let mut right = SchemaTree::new("right");
        let archive = right.add_schema(right.root(), "archive").unwrap();
        right.add_table(archive, "invoices", TableKind::Table).unwrap();
        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();

        assert_eq!(
            english(&left, &right, &chunks, true),
            "Schema archive should be added\n\
             Table invoices should be added\n\
             Schema sales should be removed\n\
             Table orders should be removed\n"
        );
    }

    #[test]
    fn test_missing_subject_is_reported() {
        let tree = SchemaTree::new("db");
        let chunk = DiffChunk {
            kind: DiffType::LeftOnly,
            subject: NodeRef::left(NodeId(99)),
            secondary: None,
        };
        assert_eq!(english(&tree, &tree, &[chunk], false), "ERROR: null object in diff list\n");
    }

    #[test]
    fn test_json_report() {
        let (left, right) = trees();
        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json(&left, &right, &chunks).unwrap()).unwrap();

        let last = &value.as_array().unwrap()[5];
        assert_eq!(last["type"], "RIGHT_ONLY");
        assert_eq!(last["object"], "column");
        assert_eq!(last["qualified_name"], "orders.placed_at");
        assert!(last.get("left_name").is_none());
    }
}
