//! Schema difference calculator
//!
//! This module compares two schema trees and classifies every catalog,
//! schema, table, column and relationship as the same, one-sided, modified
//! or re-keyed.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::schema::tree::SchemaTree;
use crate::schema::types::{Column, Node, NodeId, NodeKind};

/// Classification of one compared element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffType {
    Same,
    LeftOnly,
    RightOnly,
    Modified,
    KeyChanged,
}

impl DiffType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffType::Same => "SAME",
            DiffType::LeftOnly => "LEFT_ONLY",
            DiffType::RightOnly => "RIGHT_ONLY",
            DiffType::Modified => "MODIFIED",
            DiffType::KeyChanged => "KEY_CHANGED",
        }
    }
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two compared trees a node lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// A node of one of the two compared trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub side: Side,
    pub id: NodeId,
}

impl NodeRef {
    pub fn left(id: NodeId) -> Self {
        Self { side: Side::Left, id }
    }

    pub fn right(id: NodeId) -> Self {
        Self { side: Side::Right, id }
    }

    pub fn tree<'a>(&self, left: &'a SchemaTree, right: &'a SchemaTree) -> &'a SchemaTree {
        match self.side {
            Side::Left => left,
            Side::Right => right,
        }
    }

    pub fn resolve<'a>(&self, left: &'a SchemaTree, right: &'a SchemaTree) -> Option<&'a Node> {
        self.tree(left, right).get(self.id)
    }
}

/// One classified element.
///
/// One-sided chunks point at the node on their side. Matched chunks point
/// at the right-hand node, with the left-hand counterpart as `secondary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChunk {
    pub kind: DiffType,
    pub subject: NodeRef,
    pub secondary: Option<NodeRef>,
}

impl DiffChunk {
    pub fn left_only(id: NodeId) -> Self {
        Self {
            kind: DiffType::LeftOnly,
            subject: NodeRef::left(id),
            secondary: None,
        }
    }

    pub fn right_only(id: NodeId) -> Self {
        Self {
            kind: DiffType::RightOnly,
            subject: NodeRef::right(id),
            secondary: None,
        }
    }

    pub fn matched(kind: DiffType, right: NodeId, left: NodeId) -> Self {
        Self {
            kind,
            subject: NodeRef::right(right),
            secondary: Some(NodeRef::left(left)),
        }
    }

    pub fn resolve<'a>(&self, left: &'a SchemaTree, right: &'a SchemaTree) -> Option<&'a Node> {
        self.subject.resolve(left, right)
    }

    /// The left-hand node of the chunk, whichever field holds it
    pub fn left_node(&self) -> Option<NodeId> {
        match (self.subject.side, self.secondary) {
            (Side::Left, _) => Some(self.subject.id),
            (Side::Right, Some(NodeRef { side: Side::Left, id })) => Some(id),
            _ => None,
        }
    }

    /// The right-hand node of the chunk, if there is one
    pub fn right_node(&self) -> Option<NodeId> {
        match self.subject.side {
            Side::Right => Some(self.subject.id),
            Side::Left => None,
        }
    }
}

/// True when any chunk is something other than SAME
pub fn has_differences(chunks: &[DiffChunk]) -> bool {
    chunks.iter().any(|c| c.kind != DiffType::Same)
}

struct TableEntry {
    id: NodeId,
    key: String,
    name_key: String,
}

/// Dot-joined, lowercased names from just below `root` down to `node`
fn relative_key(tree: &SchemaTree, root: NodeId, node: NodeId) -> String {
    let mut parts = Vec::new();
    let mut current = Some(node);
    while let Some(id) = current {
        if id == root && id != node {
            break;
        }
        let Some(node) = tree.get(id) else { break };
        match &node.kind {
            NodeKind::Table(t) => parts.push(t.name.to_lowercase()),
            NodeKind::Catalog(g) | NodeKind::Schema(g) => parts.push(g.name.to_lowercase()),
            _ => break,
        }
        if id == root {
            break;
        }
        current = node.parent;
    }
    parts.reverse();
    parts.join(".")
}

/// Every catalog and schema below `root` with its relative key
fn group_entries(tree: &SchemaTree, root: NodeId) -> Vec<(String, NodeId)> {
    let mut entries = Vec::new();
    let mut pending = tree.groups(root);
    while let Some(id) = pending.pop() {
        entries.push((relative_key(tree, root, id), id));
        pending.extend(tree.groups(id));
    }
    entries
}

/// Relative key, match rank (matched, left only, right only) and the chunks
/// that sort under it
type Section = (String, u8, Vec<DiffChunk>);

/// Pair catalogs and schemas by relative key
fn group_chunks(left: &SchemaTree, left_root: NodeId, right: &SchemaTree, right_root: NodeId) -> Vec<Section> {
    let right_groups = group_entries(right, right_root);
    let mut right_by_key: HashMap<&str, NodeId> = HashMap::new();
    for (key, id) in &right_groups {
        right_by_key.entry(key.as_str()).or_insert(*id);
    }

    let mut out = Vec::new();
    let mut right_used = HashSet::new();
    for (key, lid) in group_entries(left, left_root) {
        match right_by_key.get(key.as_str()) {
            Some(rid) if !right_used.contains(rid) => {
                right_used.insert(*rid);
                out.push((key, 0, vec![DiffChunk::matched(DiffType::Same, *rid, lid)]));
            }
            _ => out.push((key, 1, vec![DiffChunk::left_only(lid)])),
        }
    }
    for (key, rid) in right_groups {
        if !right_used.contains(&rid) {
            out.push((key, 2, vec![DiffChunk::right_only(rid)]));
        }
    }
    out
}

fn table_entries(tree: &SchemaTree, root: NodeId) -> Result<Vec<TableEntry>> {
    tree.ensure_populated(root, "compared")?;
    let mut entries = Vec::new();
    for id in tree.tables(root) {
        let table = tree.table(id)?;
        if !table.is_populated() {
            return Err(Error::precondition(format!(
                "table {} must be populated before it is compared",
                tree.qualified_name(id)
            )));
        }
        entries.push(TableEntry {
            id,
            key: relative_key(tree, root, id),
            name_key: table.name.to_lowercase(),
        });
    }
    Ok(entries)
}

/// Pair tables by relative path, then pair leftovers whose bare names are
/// unique on both sides
fn match_tables(left: &[TableEntry], right: &[TableEntry]) -> Vec<(Option<usize>, Option<usize>)> {
    let mut right_by_key: HashMap<&str, usize> = HashMap::new();
    for (i, entry) in right.iter().enumerate() {
        right_by_key.entry(entry.key.as_str()).or_insert(i);
    }

    let mut pairs = Vec::new();
    let mut right_used = vec![false; right.len()];
    let mut left_unmatched = Vec::new();
    for (li, entry) in left.iter().enumerate() {
        match right_by_key.get(entry.key.as_str()) {
            Some(&ri) if !right_used[ri] => {
                right_used[ri] = true;
                pairs.push((Some(li), Some(ri)));
            }
            _ => left_unmatched.push(li),
        }
    }

    let right_unmatched: Vec<usize> = (0..right.len()).filter(|i| !right_used[*i]).collect();
    let count = |indices: &[usize], entries: &[TableEntry], name: &str| {
        indices.iter().filter(|i| entries[**i].name_key == name).count()
    };

    for li in left_unmatched {
        let name = left[li].name_key.as_str();
        let candidate = right_unmatched
            .iter()
            .copied()
            .find(|ri| !right_used[*ri] && right[*ri].name_key == name);
        match candidate {
            Some(ri)
                if count(&right_unmatched, right, name) == 1
                    && left.iter().filter(|e| e.name_key == name).count() == 1 =>
            {
                right_used[ri] = true;
                pairs.push((Some(li), Some(ri)));
            }
            _ => pairs.push((Some(li), None)),
        }
    }
    for ri in right_unmatched {
        if !right_used[ri] {
            pairs.push((None, Some(ri)));
        }
    }

    let sort_key = |pair: &(Option<usize>, Option<usize>)| -> (String, u8) {
        match pair {
            (Some(l), Some(_)) => (left[*l].key.clone(), 0),
            (Some(l), None) => (left[*l].key.clone(), 1),
            (None, Some(r)) => (right[*r].key.clone(), 2),
            (None, None) => (String::new(), 3),
        }
    };
    pairs.sort_by_key(sort_key);
    pairs
}

/// Check if a column needs to be altered
fn column_needs_alteration(current: &Column, target: &Column) -> bool {
    current.type_code != target.type_code
        || current.precision != target.precision
        || current.scale != target.scale
        || current.nullable != target.nullable
}

fn primary_key_names(tree: &SchemaTree, table: NodeId) -> Result<Vec<String>> {
    tree.primary_key_columns(table)?
        .into_iter()
        .map(|id| tree.column(id).map(|c| c.name.to_lowercase()))
        .collect()
}

fn table_chunk(left: &SchemaTree, lt: NodeId, right: &SchemaTree, rt: NodeId) -> Result<DiffChunk> {
    let (l, r) = (left.table(lt)?, right.table(rt)?);
    let kind = if primary_key_names(left, lt)? != primary_key_names(right, rt)? {
        DiffType::KeyChanged
    } else if l.remarks != r.remarks || l.kind != r.kind {
        DiffType::Modified
    } else {
        DiffType::Same
    };
    Ok(DiffChunk::matched(kind, rt, lt))
}

fn column_chunks(
    left: &SchemaTree,
    lt: NodeId,
    right: &SchemaTree,
    rt: NodeId,
    out: &mut Vec<DiffChunk>,
) -> Result<()> {
    let mut right_used = HashSet::new();
    for lc in &left.table(lt)?.columns {
        let left_column = left.column(*lc)?;
        match right.find_column(rt, &left_column.name) {
            Some(rc) if !right_used.contains(&rc) => {
                right_used.insert(rc);
                let kind = if column_needs_alteration(left_column, right.column(rc)?) {
                    DiffType::Modified
                } else {
                    DiffType::Same
                };
                out.push(DiffChunk::matched(kind, rc, *lc));
            }
            _ => out.push(DiffChunk::left_only(*lc)),
        }
    }
    for rc in &right.table(rt)?.columns {
        if !right_used.contains(rc) {
            out.push(DiffChunk::right_only(*rc));
        }
    }
    Ok(())
}

/// Structural identity of every relationship whose fk table is under `root`
fn relationship_keys(
    tree: &SchemaTree,
    root: NodeId,
    canonical: &HashMap<NodeId, String>,
) -> Result<Vec<(String, NodeId)>> {
    let table_key = |id: NodeId| {
        canonical
            .get(&id)
            .cloned()
            .unwrap_or_else(|| tree.qualified_name(id).to_lowercase())
    };

    let mut keys = Vec::new();
    for table in tree.tables(root) {
        for rel_id in &tree.table(table)?.imported_keys {
            let rel = tree.relationship(*rel_id)?;
            let mut pairs = Vec::with_capacity(rel.mappings.len());
            for m in &rel.mappings {
                pairs.push(format!(
                    "{}={}",
                    tree.column(m.pk_column)?.name.to_lowercase(),
                    tree.column(m.fk_column)?.name.to_lowercase()
                ));
            }
            let key = format!(
                "{}->{}[{}]",
                table_key(rel.pk_table),
                table_key(rel.fk_table),
                pairs.join(",")
            );
            keys.push((key, *rel_id));
        }
    }
    Ok(keys)
}

/// Compare the tables under `left_root` with those under `right_root`.
///
/// Output order: catalogs, schemas and tables sorted by relative key, each
/// table followed by its column chunks, then every relationship chunk sorted
/// by key. Fails when either root or any table has not been populated.
pub fn compare(
    left: &SchemaTree,
    left_root: NodeId,
    right: &SchemaTree,
    right_root: NodeId,
) -> Result<Vec<DiffChunk>> {
    let left_tables = table_entries(left, left_root)?;
    let right_tables = table_entries(right, right_root)?;
    debug!(
        left_tables = left_tables.len(),
        right_tables = right_tables.len(),
        "Comparing schemas"
    );

    let mut sections = group_chunks(left, left_root, right, right_root);
    let mut left_canonical = HashMap::new();
    let mut right_canonical = HashMap::new();

    for pair in match_tables(&left_tables, &right_tables) {
        match pair {
            (Some(li), Some(ri)) => {
                let (l, r) = (&left_tables[li], &right_tables[ri]);
                left_canonical.insert(l.id, l.key.clone());
                right_canonical.insert(r.id, l.key.clone());
                let mut section = vec![table_chunk(left, l.id, right, r.id)?];
                column_chunks(left, l.id, right, r.id, &mut section)?;
                sections.push((l.key.clone(), 0, section));
            }
            (Some(li), None) => {
                let l = &left_tables[li];
                left_canonical.insert(l.id, l.key.clone());
                sections.push((l.key.clone(), 1, vec![DiffChunk::left_only(l.id)]));
            }
            (None, Some(ri)) => {
                let r = &right_tables[ri];
                right_canonical.insert(r.id, r.key.clone());
                sections.push((r.key.clone(), 2, vec![DiffChunk::right_only(r.id)]));
            }
            (None, None) => {}
        }
    }

    // Segment-wise, so a container sorts directly ahead of its own tables
    sections.sort_by(|a, b| a.0.split('.').cmp(b.0.split('.')).then(a.1.cmp(&b.1)));
    let mut chunks: Vec<DiffChunk> = sections.into_iter().flat_map(|(_, _, section)| section).collect();

    let left_rels = relationship_keys(left, left_root, &left_canonical)?;
    let right_rels = relationship_keys(right, right_root, &right_canonical)?;
    let mut right_by_key: HashMap<&str, NodeId> = HashMap::new();
    for (key, id) in &right_rels {
        right_by_key.entry(key.as_str()).or_insert(*id);
    }

    let mut rel_chunks: Vec<(String, u8, DiffChunk)> = Vec::new();
    let mut right_used = HashSet::new();
    for (key, lid) in &left_rels {
        match right_by_key.get(key.as_str()) {
            Some(rid) if !right_used.contains(rid) => {
                right_used.insert(*rid);
                let same_name = left
                    .relationship(*lid)?
                    .name
                    .eq_ignore_ascii_case(&right.relationship(*rid)?.name);
                let kind = if same_name { DiffType::Same } else { DiffType::Modified };
                rel_chunks.push((key.clone(), 0, DiffChunk::matched(kind, *rid, *lid)));
            }
            _ => rel_chunks.push((key.clone(), 1, DiffChunk::left_only(*lid))),
        }
    }
    for (key, rid) in &right_rels {
        if !right_used.contains(rid) {
            rel_chunks.push((key.clone(), 2, DiffChunk::right_only(*rid)));
        }
    }
    rel_chunks.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    chunks.extend(rel_chunks.into_iter().map(|(_, _, chunk)| chunk));

    info!(
        chunks = chunks.len(),
        differences = chunks.iter().filter(|c| c.kind != DiffType::Same).count(),
        "Comparison finished"
    );
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{type_codes, NewRelationship, PopulationState, TableKind, TreeItem};
    use pretty_assertions::assert_eq;

    fn kinds(chunks: &[DiffChunk]) -> Vec<DiffType> {
        chunks.iter().map(|c| c.kind).collect()
    }

    fn names<'a>(chunks: &[DiffChunk], left: &'a SchemaTree, right: &'a SchemaTree) -> Vec<&'a str> {
        chunks
            .iter()
            .map(|c| c.resolve(left, right).map(Node::name).unwrap_or("?"))
            .collect()
    }

    fn customers(tree: &mut SchemaTree, name: &str) -> NodeId {
        let t = tree.add_table(tree.root(), name, TableKind::Table).unwrap();
        tree.add_column(t, Column::new("id", type_codes::INTEGER).primary_key(1))
            .unwrap();
        tree.add_column(t, Column::new("name", type_codes::VARCHAR).precision(80).nullable(true))
            .unwrap();
        t
    }

    #[test]
    fn test_identical_trees_are_all_same() {
        let mut left = SchemaTree::new("a");
        customers(&mut left, "customers");
        let right = left.clone();

        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
        assert_eq!(kinds(&chunks), vec![DiffType::Same; 3]);
        assert!(!has_differences(&chunks));
    }

    #[test]
    fn test_tables_sorted_and_matched_case_insensitively() {
        let mut left = SchemaTree::new("a");
        customers(&mut left, "Zebra");
        customers(&mut left, "apple");
        let mut right = SchemaTree::new("b");
        customers(&mut right, "APPLE");
        right.add_table(right.root(), "mango", TableKind::Table).unwrap();

        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
        assert_eq!(
            names(&chunks, &left, &right),
            vec!["APPLE", "id", "name", "mango", "Zebra"]
        );
        assert_eq!(
            kinds(&chunks),
            vec![
                DiffType::Same,
                DiffType::Same,
                DiffType::Same,
                DiffType::RightOnly,
                DiffType::LeftOnly,
            ]
        );
        let left_apple = chunks[0].left_node().unwrap();
        assert_eq!(left.name(TreeItem::Node(left_apple)), "apple");
    }

    #[test]
    fn test_column_changes_and_key_change() {
        let mut left = SchemaTree::new("a");
        let lt = customers(&mut left, "customers");
        left.add_column(lt, Column::new("legacy", type_codes::CHAR)).unwrap();

        let mut right = SchemaTree::new("b");
        let rt = right.add_table(right.root(), "customers", TableKind::Table).unwrap();
        right.add_column(rt, Column::new("id", type_codes::INTEGER)).unwrap();
        right
            .add_column(rt, Column::new("name", type_codes::VARCHAR).precision(120).nullable(true))
            .unwrap();
        right
            .add_column(rt, Column::new("email", type_codes::VARCHAR).primary_key(1))
            .unwrap();

        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
        assert_eq!(
            kinds(&chunks),
            vec![
                DiffType::KeyChanged,
                DiffType::Same,
                DiffType::Modified,
                DiffType::LeftOnly,
                DiffType::RightOnly,
            ]
        );
        assert_eq!(names(&chunks, &left, &right)[3..], ["legacy", "email"]);
    }

    #[test]
    fn test_relationships_follow_tables_and_match_structurally() {
        let build = |fk_name: &str| {
            let mut tree = SchemaTree::new("db");
            let t = customers(&mut tree, "T");
            let u = tree.add_table(tree.root(), "U", TableKind::Table).unwrap();
            let fk = tree.add_column(u, Column::new("t_id", type_codes::INTEGER)).unwrap();
            let pk = tree.find_column(t, "id").unwrap();
            tree.add_relationship(NewRelationship::new(fk_name, t, u).map(pk, fk))
                .unwrap();
            tree
        };
        let left = build("fk_u_t");
        let renamed = build("u_references_t");

        let chunks = compare(&left, left.root(), &renamed, renamed.root()).unwrap();
        let last = chunks.last().unwrap();
        assert_eq!(last.kind, DiffType::Modified);
        assert_eq!(names(&chunks, &left, &renamed).last(), Some(&"u_references_t"));

        let bare = {
            let mut tree = SchemaTree::new("db");
            customers(&mut tree, "T");
            let u = tree.add_table(tree.root(), "U", TableKind::Table).unwrap();
            tree.add_column(u, Column::new("t_id", type_codes::INTEGER)).unwrap();
            tree
        };
        let chunks = compare(&left, left.root(), &bare, bare.root()).unwrap();
        assert_eq!(chunks.last().unwrap().kind, DiffType::LeftOnly);
        assert_eq!(chunks.last().unwrap().subject.side, Side::Left);
    }

    #[test]
    fn test_unpopulated_table_is_precondition_violation() {
        let mut left = SchemaTree::for_introspection("live");
        left.insert_discovered_tables(vec![crate::schema::source::TableRecord::new(
            None,
            None,
            "pending",
            TableKind::Table,
        )])
        .unwrap();
        left.set_database_state(PopulationState::Populated);
        let right = SchemaTree::new("model");

        assert!(matches!(
            compare(&left, left.root(), &right, right.root()),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_unmatched_containers_flatten() {
        let mut left = SchemaTree::new("a");
        let sales = left.add_schema(left.root(), "sales").unwrap();
        let lt = left.add_table(sales, "orders", TableKind::Table).unwrap();
        left.add_column(lt, Column::new("id", type_codes::INTEGER)).unwrap();

        let mut right = SchemaTree::new("b");
        let rt = right.add_table(right.root(), "ORDERS", TableKind::Table).unwrap();
        right.add_column(rt, Column::new("id", type_codes::INTEGER)).unwrap();

        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
        assert_eq!(kinds(&chunks), vec![DiffType::LeftOnly, DiffType::Same, DiffType::Same]);
        assert_eq!(names(&chunks, &left, &right), vec!["sales", "ORDERS", "id"]);
    }

    #[test]
    fn test_catalogs_and_schemas_are_compared() {
        let mut left = SchemaTree::new("a");
        let shop = left.add_catalog("shop").unwrap();
        let sales = left.add_schema(shop, "sales").unwrap();
        left.add_table(sales, "orders", TableKind::Table).unwrap();

        let mut right = SchemaTree::new("b");
        let shop = right.add_catalog("SHOP").unwrap();
        let archive = right.add_schema(shop, "archive").unwrap();
        right.add_table(archive, "invoices", TableKind::Table).unwrap();

        let chunks = compare(&left, left.root(), &right, right.root()).unwrap();
        let summary: Vec<(&str, &str, DiffType)> = chunks
            .iter()
            .map(|c| {
                let node = c.resolve(&left, &right).unwrap();
                (node.kind.label(), node.name(), c.kind)
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Catalog", "SHOP", DiffType::Same),
                ("Schema", "archive", DiffType::RightOnly),
                ("Table", "invoices", DiffType::RightOnly),
                ("Schema", "sales", DiffType::LeftOnly),
                ("Table", "orders", DiffType::LeftOnly),
            ]
        );
    }

    #[test]
    fn test_unswept_database_is_precondition_violation() {
        let mut left = SchemaTree::new("model");
        left.add_table(left.root(), "orders", TableKind::Table).unwrap();
        let live = SchemaTree::for_introspection("live");

        for (l, r) in [(&left, &live), (&live, &left)] {
            assert!(matches!(
                compare(l, l.root(), r, r.root()),
                Err(Error::PreconditionViolation(_))
            ));
        }
    }
}
