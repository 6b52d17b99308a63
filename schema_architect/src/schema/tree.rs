//! Arena-backed schema metadata tree
//!
//! Every schema element lives in one `SchemaTree` and is addressed by a
//! [`NodeId`]. Parents own their children through id lists; the `parent`
//! field of a node is only used for navigation. Tables expose their three
//! child lists through [`Folder`] views that borrow the table's lists.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::schema::source::TableRecord;
use crate::schema::types::{
    Column, ColumnMapping, Database, FolderKind, Group, NewRelationship, Node, NodeId, NodeKind,
    PopulationState, Relationship, Table, TableCoordinates, TableKind, TreeItem,
};
use crate::utils::naming::to_qualified_name;

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a tree, so node ids from different trees are
/// never confused with each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId(u64);

impl TreeId {
    fn fresh() -> Self {
        TreeId(NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Indices and children affected by one structural change of one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildrenChanged {
    pub owner: TreeItem,
    pub indices: Vec<usize>,
    pub children: Vec<NodeId>,
}

impl ChildrenChanged {
    pub fn start_index(&self) -> Option<usize> {
        self.indices.first().copied()
    }
}

/// Structural change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TreeEvent {
    ChildrenInserted(ChildrenChanged),
    ChildrenRemoved(ChildrenChanged),
}

impl TreeEvent {
    pub fn change(&self) -> &ChildrenChanged {
        match self {
            TreeEvent::ChildrenInserted(c) | TreeEvent::ChildrenRemoved(c) => c,
        }
    }
}

/// Read-through view of one of a table's child lists
#[derive(Debug, Clone, Copy)]
pub struct Folder<'a> {
    tree: &'a SchemaTree,
    owner: NodeId,
    kind: FolderKind,
    list: &'a [NodeId],
}

impl<'a> Folder<'a> {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn kind(&self) -> FolderKind {
        self.kind
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Folders never need population of their own
    pub fn is_populated(&self) -> bool {
        true
    }

    pub fn children(&self) -> &'a [NodeId] {
        self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a Node> {
        self.list.get(index).and_then(|id| self.tree.get(*id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Node> + 'a {
        let tree = self.tree;
        self.list.iter().filter_map(move |id| tree.get(*id))
    }
}

/// The schema metadata tree
#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaTree {
    #[serde(skip, default = "TreeId::fresh")]
    id: TreeId,
    root: NodeId,
    nodes: Vec<Node>,
    #[serde(skip)]
    events: Vec<TreeEvent>,
}

impl Clone for SchemaTree {
    /// Clones get their own identity and no pending events
    fn clone(&self) -> Self {
        Self {
            id: TreeId::fresh(),
            root: self.root,
            nodes: self.nodes.clone(),
            events: Vec::new(),
        }
    }
}

impl SchemaTree {
    /// Create a tree for a hand-built model. The database counts as populated.
    pub fn new(database_name: &str) -> Self {
        Self::with_root_state(database_name, PopulationState::Populated)
    }

    /// Create a tree whose database is discovered later from a metadata source
    pub fn for_introspection(database_name: &str) -> Self {
        Self::with_root_state(database_name, PopulationState::Unpopulated)
    }

    fn with_root_state(database_name: &str, state: PopulationState) -> Self {
        let root = NodeId(0);
        Self {
            id: TreeId::fresh(),
            root,
            nodes: vec![Node {
                id: root,
                parent: None,
                kind: NodeKind::Database(Database {
                    name: database_name.to_string(),
                    children: Vec::new(),
                    state,
                }),
            }],
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id)
            .ok_or_else(|| Error::precondition(format!("node {} does not exist", id)))
    }

    pub fn table(&self, id: NodeId) -> Result<&Table> {
        self.node(id)?
            .as_table()
            .ok_or_else(|| Error::precondition(format!("node {} is not a table", id)))
    }

    pub fn column(&self, id: NodeId) -> Result<&Column> {
        self.node(id)?
            .as_column()
            .ok_or_else(|| Error::precondition(format!("node {} is not a column", id)))
    }

    pub fn relationship(&self, id: NodeId) -> Result<&Relationship> {
        self.node(id)?
            .as_relationship()
            .ok_or_else(|| Error::precondition(format!("node {} is not a relationship", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| Error::precondition(format!("node {} does not exist", id)))
    }

    fn table_mut(&mut self, id: NodeId) -> Result<&mut Table> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Table(t) => Ok(t),
            _ => Err(Error::precondition(format!("node {} is not a table", id))),
        }
    }

    /// The table owning a column, if the column is still attached
    pub fn table_of_column(&self, column: NodeId) -> Option<NodeId> {
        self.get(column)
            .filter(|n| n.as_column().is_some())
            .and_then(|n| n.parent)
    }

    /// Every table under `under` (a database, catalog, schema or table) in tree order
    pub fn tables(&self, under: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_tables(under, &mut out);
        out
    }

    fn collect_tables(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let Some(node) = self.get(id) else { return };
        match &node.kind {
            NodeKind::Database(Database { children, .. })
            | NodeKind::Catalog(Group { children, .. })
            | NodeKind::Schema(Group { children, .. }) => {
                for child in children {
                    self.collect_tables(*child, out);
                }
            }
            NodeKind::Table(_) => out.push(id),
            _ => {}
        }
    }

    /// Catalog and schema children of a container node
    pub fn groups(&self, under: NodeId) -> Vec<NodeId> {
        self.container_children(under)
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    self.get(*id).map(|n| &n.kind),
                    Some(NodeKind::Catalog(_)) | Some(NodeKind::Schema(_))
                )
            })
            .collect()
    }

    /// Table children directly under a container node
    pub fn direct_tables(&self, under: NodeId) -> Vec<NodeId> {
        self.container_children(under)
            .iter()
            .copied()
            .filter(|id| self.get(*id).and_then(Node::as_table).is_some())
            .collect()
    }

    fn container_children(&self, id: NodeId) -> &[NodeId] {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Database(d)) => &d.children,
            Some(NodeKind::Catalog(g)) | Some(NodeKind::Schema(g)) => &g.children,
            _ => &[],
        }
    }

    /// Find a table by its source coordinates, falling back to a
    /// case-insensitive match
    pub fn find_table(&self, catalog: Option<&str>, schema: Option<&str>, name: &str) -> Option<NodeId> {
        let candidates: Vec<(NodeId, TableCoordinates)> = self
            .tables(self.root)
            .into_iter()
            .filter_map(|id| self.table_coordinates(id).ok().map(|c| (id, c)))
            .collect();

        let exact = candidates.iter().find(|(_, c)| {
            c.name == name && c.schema.as_deref() == schema && c.catalog.as_deref() == catalog
        });
        if let Some((id, _)) = exact {
            return Some(*id);
        }

        let eq = |a: Option<&str>, b: Option<&str>| match (a, b) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };
        candidates
            .iter()
            .find(|(_, c)| {
                c.name.eq_ignore_ascii_case(name)
                    && eq(c.schema.as_deref(), schema)
                    && eq(c.catalog.as_deref(), catalog)
            })
            .map(|(id, _)| *id)
    }

    /// Find a column of `table` by name, ignoring case
    pub fn find_column(&self, table: NodeId, name: &str) -> Option<NodeId> {
        let table = self.table(table).ok()?;
        table.columns.iter().copied().find(|id| {
            self.get(*id)
                .map(|n| n.name().eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
    }

    pub fn table_coordinates(&self, table: NodeId) -> Result<TableCoordinates> {
        let t = self.table(table)?;
        Ok(TableCoordinates {
            catalog: t.catalog.and_then(|id| self.get(id)).map(|n| n.name().to_string()),
            schema: t.schema.and_then(|id| self.get(id)).map(|n| n.name().to_string()),
            name: t.name.clone(),
        })
    }

    /// Dot-separated name of any node, including its catalog and schema
    pub fn qualified_name(&self, id: NodeId) -> String {
        let Some(node) = self.get(id) else {
            return format!("<missing {}>", id);
        };
        match &node.kind {
            NodeKind::Table(_) => self
                .table_coordinates(id)
                .map(|c| c.to_string())
                .unwrap_or_else(|_| node.name().to_string()),
            NodeKind::Column(c) => match node.parent {
                Some(table) => format!("{}.{}", self.qualified_name(table), c.name),
                None => c.name.clone(),
            },
            NodeKind::Schema(g) => match node.parent.and_then(|p| self.get(p)) {
                Some(Node { kind: NodeKind::Catalog(cat), .. }) => {
                    to_qualified_name(Some(&cat.name), None, &g.name)
                }
                _ => g.name.clone(),
            },
            _ => node.name().to_string(),
        }
    }

    /// `schema.table (KIND)` style label for a table
    pub fn short_display_name(&self, table: NodeId) -> String {
        match self.table(table) {
            Ok(t) => match t.schema.and_then(|id| self.get(id)) {
                Some(schema) => format!("{}.{} ({})", schema.name(), t.name, t.kind),
                None => format!("{} ({})", t.name, t.kind),
            },
            Err(_) => self.qualified_name(table),
        }
    }

    /// Primary key columns of a table, ordered by key sequence
    pub fn primary_key_columns(&self, table: NodeId) -> Result<Vec<NodeId>> {
        let t = self.table(table)?;
        let mut keyed: Vec<(u32, usize, NodeId)> = t
            .columns
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| {
                self.column(*id)
                    .ok()
                    .and_then(|c| c.primary_key_seq)
                    .map(|seq| (seq, pos, *id))
            })
            .collect();
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, _, id)| id).collect())
    }

    pub fn has_primary_key(&self, table: NodeId) -> bool {
        self.primary_key_columns(table)
            .map(|cols| !cols.is_empty())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Generic node interface
    // ------------------------------------------------------------------

    pub fn name(&self, item: TreeItem) -> &str {
        match item {
            TreeItem::Node(id) => self.get(id).map(Node::name).unwrap_or(""),
            TreeItem::Folder(_, kind) => kind.name(),
        }
    }

    pub fn parent(&self, item: TreeItem) -> Option<TreeItem> {
        match item {
            TreeItem::Node(id) => {
                let node = self.get(id)?;
                let parent = node.parent?;
                let folder = match &node.kind {
                    NodeKind::Column(_) => Some(FolderKind::Columns),
                    _ => None,
                };
                Some(match folder {
                    Some(kind) => TreeItem::Folder(parent, kind),
                    None => TreeItem::Node(parent),
                })
            }
            TreeItem::Folder(owner, _) => Some(TreeItem::Node(owner)),
        }
    }

    /// Child items: container children, a table's three folders, or the
    /// contents of a folder
    pub fn children(&self, item: TreeItem) -> Vec<TreeItem> {
        match item {
            TreeItem::Node(id) => match self.get(id).map(|n| &n.kind) {
                Some(NodeKind::Table(_)) => FolderKind::all()
                    .into_iter()
                    .map(|kind| TreeItem::Folder(id, kind))
                    .collect(),
                Some(_) => self
                    .container_children(id)
                    .iter()
                    .map(|c| TreeItem::Node(*c))
                    .collect(),
                None => Vec::new(),
            },
            TreeItem::Folder(owner, kind) => self
                .folder(owner, kind)
                .map(|f| f.children().iter().map(|c| TreeItem::Node(*c)).collect())
                .unwrap_or_default(),
        }
    }

    pub fn is_populated(&self, item: TreeItem) -> bool {
        match item {
            TreeItem::Folder(..) => true,
            TreeItem::Node(id) => match self.get(id).map(|n| &n.kind) {
                Some(NodeKind::Database(d)) => d.state.is_populated(),
                Some(NodeKind::Table(t)) => t.is_populated(),
                Some(_) => true,
                None => false,
            },
        }
    }

    /// Fail unless the database and `under` have been swept
    pub fn ensure_populated(&self, under: NodeId, action: &str) -> Result<()> {
        if !self.database_state().is_populated() || !self.is_populated(TreeItem::Node(under)) {
            return Err(Error::precondition(format!(
                "{} must be populated before it is {}",
                self.qualified_name(under),
                action
            )));
        }
        Ok(())
    }

    pub fn folder(&self, table: NodeId, kind: FolderKind) -> Result<Folder<'_>> {
        let t = self.table(table)?;
        let list = match kind {
            FolderKind::Columns => &t.columns,
            FolderKind::ExportedKeys => &t.exported_keys,
            FolderKind::ImportedKeys => &t.imported_keys,
        };
        Ok(Folder {
            tree: self,
            owner: table,
            kind,
            list,
        })
    }

    // ------------------------------------------------------------------
    // Population state
    // ------------------------------------------------------------------

    pub fn database_state(&self) -> &PopulationState {
        match &self.nodes[self.root.0].kind {
            NodeKind::Database(d) => &d.state,
            _ => unreachable!("root is always a database"),
        }
    }

    pub(crate) fn set_database_state(&mut self, state: PopulationState) {
        if let NodeKind::Database(d) = &mut self.nodes[self.root.0].kind {
            d.state = state;
        }
    }

    pub(crate) fn set_columns_state(&mut self, table: NodeId, state: PopulationState) -> Result<()> {
        self.table_mut(table)?.columns_state = state;
        Ok(())
    }

    pub(crate) fn set_relationships_state(&mut self, table: NodeId, state: PopulationState) -> Result<()> {
        self.table_mut(table)?.relationships_state = state;
        Ok(())
    }

    /// Re-arm population of a node whose last fetch failed.
    ///
    /// Returns true when something was reset.
    pub fn reset_population(&mut self, item: NodeId) -> Result<bool> {
        let mut reset = false;
        match &mut self.node_mut(item)?.kind {
            NodeKind::Database(d) => {
                if d.state.failure().is_some() {
                    d.state = PopulationState::Unpopulated;
                    reset = true;
                }
            }
            NodeKind::Table(t) => {
                if t.columns_state.failure().is_some() {
                    t.columns_state = PopulationState::Unpopulated;
                    t.relationships_state = PopulationState::Unpopulated;
                    reset = true;
                } else if t.relationships_state.failure().is_some() {
                    t.relationships_state = PopulationState::Unpopulated;
                    reset = true;
                }
            }
            _ => {}
        }
        Ok(reset)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Take every notification recorded since the last call, in order
    pub fn drain_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit_inserted(&mut self, owner: TreeItem, indices: Vec<usize>, children: Vec<NodeId>) {
        if !children.is_empty() {
            self.events.push(TreeEvent::ChildrenInserted(ChildrenChanged {
                owner,
                indices,
                children,
            }));
        }
    }

    fn emit_removed(&mut self, owner: TreeItem, indices: Vec<usize>, children: Vec<NodeId>) {
        if !children.is_empty() {
            self.events.push(TreeEvent::ChildrenRemoved(ChildrenChanged {
                owner,
                indices,
                children,
            }));
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    fn push(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, parent, kind });
        id
    }

    /// Append `child` to a container's children, returning its index
    fn attach_child(&mut self, owner: NodeId, child: NodeId) -> Result<usize> {
        match &mut self.node_mut(owner)?.kind {
            NodeKind::Database(Database { children, .. })
            | NodeKind::Catalog(Group { children, .. })
            | NodeKind::Schema(Group { children, .. }) => {
                children.push(child);
                Ok(children.len() - 1)
            }
            other => Err(Error::precondition(format!(
                "a {} cannot own catalogs, schemas or tables",
                other.label()
            ))),
        }
    }

    fn find_group(&self, owner: NodeId, name: &str, catalog: bool) -> Option<NodeId> {
        self.container_children(owner).iter().copied().find(|id| {
            match self.get(*id).map(|n| &n.kind) {
                Some(NodeKind::Catalog(g)) if catalog => g.name == name,
                Some(NodeKind::Schema(g)) if !catalog => g.name == name,
                _ => false,
            }
        })
    }

    fn create_group(&mut self, owner: NodeId, name: &str, catalog: bool) -> Result<(NodeId, usize)> {
        let group = Group {
            name: name.to_string(),
            children: Vec::new(),
        };
        let kind = if catalog {
            NodeKind::Catalog(group)
        } else {
            NodeKind::Schema(group)
        };
        let id = self.push(Some(owner), kind);
        let index = self.attach_child(owner, id)?;
        Ok((id, index))
    }

    /// Add (or reuse) a catalog under the database
    pub fn add_catalog(&mut self, name: &str) -> Result<NodeId> {
        let root = self.root;
        if let Some(existing) = self.find_group(root, name, true) {
            return Ok(existing);
        }
        let (id, index) = self.create_group(root, name, true)?;
        self.emit_inserted(TreeItem::Node(root), vec![index], vec![id]);
        Ok(id)
    }

    /// Add (or reuse) a schema under the database or a catalog
    pub fn add_schema(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        match self.node(parent)?.kind {
            NodeKind::Database(_) | NodeKind::Catalog(_) => {}
            _ => {
                return Err(Error::precondition(
                    "a schema's parent must be a database or a catalog",
                ))
            }
        }
        if let Some(existing) = self.find_group(parent, name, false) {
            return Ok(existing);
        }
        let (id, index) = self.create_group(parent, name, false)?;
        self.emit_inserted(TreeItem::Node(parent), vec![index], vec![id]);
        Ok(id)
    }

    fn create_table(
        &mut self,
        parent: NodeId,
        name: &str,
        remarks: Option<String>,
        kind: TableKind,
        state: PopulationState,
    ) -> Result<(NodeId, usize)> {
        let (catalog, schema) = match &self.node(parent)?.kind {
            NodeKind::Database(_) => (None, None),
            NodeKind::Catalog(_) => (Some(parent), None),
            NodeKind::Schema(_) => {
                let catalog = self
                    .get(parent)
                    .and_then(|n| n.parent)
                    .filter(|p| matches!(self.get(*p).map(|n| &n.kind), Some(NodeKind::Catalog(_))));
                (catalog, Some(parent))
            }
            other => {
                return Err(Error::precondition(format!(
                    "a table cannot be created under a {}",
                    other.label()
                )))
            }
        };
        let id = self.push(
            Some(parent),
            NodeKind::Table(Table {
                name: name.to_string(),
                remarks,
                kind,
                primary_key_name: None,
                catalog,
                schema,
                columns: Vec::new(),
                exported_keys: Vec::new(),
                imported_keys: Vec::new(),
                columns_state: state.clone(),
                relationships_state: state,
            }),
        );
        let index = self.attach_child(parent, id)?;
        Ok((id, index))
    }

    /// Add a hand-built table. It counts as populated.
    pub fn add_table(&mut self, parent: NodeId, name: &str, kind: TableKind) -> Result<NodeId> {
        let (id, index) = self.create_table(parent, name, None, kind, PopulationState::Populated)?;
        self.emit_inserted(TreeItem::Node(parent), vec![index], vec![id]);
        Ok(id)
    }

    pub fn set_remarks(&mut self, table: NodeId, remarks: Option<String>) -> Result<()> {
        self.table_mut(table)?.remarks = remarks;
        Ok(())
    }

    pub fn set_primary_key_name(&mut self, table: NodeId, name: Option<String>) -> Result<()> {
        self.table_mut(table)?.primary_key_name = name;
        Ok(())
    }

    /// Record the tables found by one database sweep, reusing catalog and
    /// schema nodes by name
    pub(crate) fn insert_discovered_tables(&mut self, records: Vec<TableRecord>) -> Result<Vec<NodeId>> {
        let root = self.root;
        let mut batches: IndexMap<NodeId, (Vec<usize>, Vec<NodeId>)> = IndexMap::new();
        let mut created = Vec::new();

        for record in records {
            let mut parent = root;

            if let Some(cat_name) = record.coordinates.catalog.as_deref() {
                parent = match self.find_group(root, cat_name, true) {
                    Some(cat) => cat,
                    None => {
                        let (cat, index) = self.create_group(root, cat_name, true)?;
                        let batch = batches.entry(root).or_default();
                        batch.0.push(index);
                        batch.1.push(cat);
                        cat
                    }
                };
            }

            if let Some(schema_name) = record.coordinates.schema.as_deref() {
                let owner = parent;
                parent = match self.find_group(owner, schema_name, false) {
                    Some(schema) => schema,
                    None => {
                        let (schema, index) = self.create_group(owner, schema_name, false)?;
                        let batch = batches.entry(owner).or_default();
                        batch.0.push(index);
                        batch.1.push(schema);
                        schema
                    }
                };
            }

            let (table, index) = self.create_table(
                parent,
                &record.coordinates.name,
                record.remarks,
                record.kind,
                PopulationState::Unpopulated,
            )?;
            let batch = batches.entry(parent).or_default();
            batch.0.push(index);
            batch.1.push(table);
            created.push(table);
        }

        for (owner, (indices, children)) in batches {
            self.emit_inserted(TreeItem::Node(owner), indices, children);
        }
        Ok(created)
    }

    // ------------------------------------------------------------------
    // Columns
    // ------------------------------------------------------------------

    /// Append a column to a table
    pub fn add_column(&mut self, table: NodeId, column: Column) -> Result<NodeId> {
        let len = self.table(table)?.columns.len();
        self.insert_column(table, len, column)
    }

    /// Insert a column at `index` of a table's column list
    pub fn insert_column(&mut self, table: NodeId, index: usize, column: Column) -> Result<NodeId> {
        let ids = self.insert_columns(table, index, vec![column])?;
        Ok(ids[0])
    }

    fn insert_columns(&mut self, table: NodeId, index: usize, columns: Vec<Column>) -> Result<Vec<NodeId>> {
        let len = self.table(table)?.columns.len();
        if index > len {
            return Err(Error::precondition(format!(
                "column index {} out of bounds for table with {} columns",
                index, len
            )));
        }

        let ids: Vec<NodeId> = columns
            .into_iter()
            .map(|c| self.push(Some(table), NodeKind::Column(c)))
            .collect();
        let t = self.table_mut(table)?;
        for (offset, id) in ids.iter().enumerate() {
            t.columns.insert(index + offset, *id);
        }

        let indices = (index..index + ids.len()).collect();
        self.emit_inserted(TreeItem::Folder(table, FolderKind::Columns), indices, ids.clone());
        Ok(ids)
    }

    /// Detach the column at `index`. Columns used by a relationship cannot
    /// be removed.
    pub fn remove_column(&mut self, table: NodeId, index: usize) -> Result<Column> {
        let t = self.table(table)?;
        let id = *t.columns.get(index).ok_or_else(|| {
            Error::precondition(format!("no column at index {} of {}", index, t.name))
        })?;

        let in_use = t
            .imported_keys
            .iter()
            .chain(t.exported_keys.iter())
            .filter_map(|r| self.relationship(*r).ok())
            .find(|r| r.mappings.iter().any(|m| m.pk_column == id || m.fk_column == id));
        if let Some(rel) = in_use {
            return Err(Error::precondition(format!(
                "column {} is used by relationship {}",
                self.qualified_name(id),
                rel.name
            )));
        }

        self.table_mut(table)?.columns.remove(index);
        let node = self.node_mut(id)?;
        node.parent = None;
        let column = node.as_column().cloned().ok_or_else(|| {
            Error::precondition(format!("node {} is not a column", id))
        })?;
        self.emit_removed(TreeItem::Folder(table, FolderKind::Columns), vec![index], vec![id]);
        Ok(column)
    }

    /// Record columns fetched for a table and mark its column phase done
    pub(crate) fn apply_fetched_columns(
        &mut self,
        table: NodeId,
        columns: Vec<Column>,
        primary_key_name: Option<String>,
    ) -> Result<Vec<NodeId>> {
        let start = self.table(table)?.columns.len();
        let ids = self.insert_columns(table, start, columns)?;
        let t = self.table_mut(table)?;
        if primary_key_name.is_some() {
            t.primary_key_name = primary_key_name;
        }
        t.columns_state = PopulationState::Populated;
        Ok(ids)
    }

    /// Copy every column of `source` into `target`, at `pos` or at the end
    pub fn inherit_columns(&mut self, target: NodeId, pos: Option<usize>, source: NodeId) -> Result<Vec<NodeId>> {
        let columns = self.derived_columns(source)?;
        let index = pos.unwrap_or(self.table(target)?.columns.len());
        self.insert_columns(target, index, columns)
    }

    fn derived_columns(&self, source: NodeId) -> Result<Vec<Column>> {
        let t = self.table(source)?;
        if !t.columns_state.is_populated() {
            return Err(Error::precondition(format!(
                "table {} must be populated before its columns are copied",
                t.name
            )));
        }
        t.columns
            .iter()
            .map(|id| self.column(*id).cloned())
            .collect()
    }

    /// Make a copy of a table from another tree under `parent`.
    ///
    /// Leaf attributes and columns are copied; relationships are not. The
    /// source must already be populated.
    pub fn derive_table(&mut self, parent: NodeId, source_tree: &SchemaTree, source_table: NodeId) -> Result<NodeId> {
        let source = source_tree.table(source_table)?;
        if !source.is_populated() {
            return Err(Error::precondition(format!(
                "table {} must be populated before it is derived",
                source.name
            )));
        }
        let columns = source_tree.derived_columns(source_table)?;

        let (id, index) = self.create_table(
            parent,
            &source.name,
            source.remarks.clone(),
            source.kind,
            PopulationState::Populated,
        )?;
        self.table_mut(id)?.primary_key_name = source.primary_key_name.clone();
        self.emit_inserted(TreeItem::Node(parent), vec![index], vec![id]);
        self.insert_columns(id, 0, columns)?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    fn attach_relationship(&mut self, rel: NewRelationship) -> Result<(NodeId, usize, usize)> {
        if rel.mappings.is_empty() {
            return Err(Error::precondition(format!(
                "relationship {} needs at least one column mapping",
                rel.name
            )));
        }
        self.table(rel.pk_table)?;
        self.table(rel.fk_table)?;
        for (pk_col, fk_col) in &rel.mappings {
            if self.table_of_column(*pk_col) != Some(rel.pk_table) {
                return Err(Error::precondition(format!(
                    "column {} of relationship {} does not belong to its pk table",
                    self.qualified_name(*pk_col),
                    rel.name
                )));
            }
            if self.table_of_column(*fk_col) != Some(rel.fk_table) {
                return Err(Error::precondition(format!(
                    "column {} of relationship {} does not belong to its fk table",
                    self.qualified_name(*fk_col),
                    rel.name
                )));
            }
        }

        let id = self.push(
            Some(rel.fk_table),
            NodeKind::Relationship(Relationship {
                name: rel.name,
                pk_table: rel.pk_table,
                fk_table: rel.fk_table,
                mappings: rel
                    .mappings
                    .into_iter()
                    .map(|(pk_column, fk_column)| ColumnMapping { pk_column, fk_column })
                    .collect(),
                update_rule: rel.update_rule,
                delete_rule: rel.delete_rule,
            }),
        );

        let fk = self.table_mut(rel.fk_table)?;
        fk.imported_keys.push(id);
        let imported_index = fk.imported_keys.len() - 1;
        let pk = self.table_mut(rel.pk_table)?;
        pk.exported_keys.push(id);
        let exported_index = pk.exported_keys.len() - 1;
        Ok((id, imported_index, exported_index))
    }

    /// Add a relationship between two tables of this tree
    pub fn add_relationship(&mut self, rel: NewRelationship) -> Result<NodeId> {
        let (pk_table, fk_table) = (rel.pk_table, rel.fk_table);
        let (id, imported, exported) = self.attach_relationship(rel)?;
        self.emit_inserted(TreeItem::Folder(fk_table, FolderKind::ImportedKeys), vec![imported], vec![id]);
        self.emit_inserted(TreeItem::Folder(pk_table, FolderKind::ExportedKeys), vec![exported], vec![id]);
        Ok(id)
    }

    /// Record the imported keys fetched for `fk_table` and mark its
    /// relationship phase done. One batch per affected folder.
    pub(crate) fn apply_fetched_relationships(
        &mut self,
        fk_table: NodeId,
        relationships: Vec<NewRelationship>,
    ) -> Result<Vec<NodeId>> {
        let mut imported = (Vec::new(), Vec::new());
        let mut exported: IndexMap<NodeId, (Vec<usize>, Vec<NodeId>)> = IndexMap::new();
        let mut ids = Vec::new();

        for rel in relationships {
            let pk_table = rel.pk_table;
            let (id, imported_index, exported_index) = self.attach_relationship(rel)?;
            imported.0.push(imported_index);
            imported.1.push(id);
            let batch = exported.entry(pk_table).or_default();
            batch.0.push(exported_index);
            batch.1.push(id);
            ids.push(id);
        }

        self.table_mut(fk_table)?.relationships_state = PopulationState::Populated;
        self.emit_inserted(TreeItem::Folder(fk_table, FolderKind::ImportedKeys), imported.0, imported.1);
        for (pk_table, (indices, children)) in exported {
            self.emit_inserted(TreeItem::Folder(pk_table, FolderKind::ExportedKeys), indices, children);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::type_codes;
    use pretty_assertions::assert_eq;

    fn orders_and_lines() -> (SchemaTree, NodeId, NodeId) {
        let mut tree = SchemaTree::new("shop");
        let schema = tree.add_schema(tree.root(), "public").unwrap();
        let orders = tree.add_table(schema, "orders", TableKind::Table).unwrap();
        tree.add_column(orders, Column::new("id", type_codes::INTEGER).primary_key(1))
            .unwrap();
        tree.add_column(orders, Column::new("placed_at", type_codes::TIMESTAMP))
            .unwrap();
        let lines = tree.add_table(schema, "order_lines", TableKind::Table).unwrap();
        tree.add_column(lines, Column::new("order_id", type_codes::INTEGER))
            .unwrap();
        tree.drain_events();
        (tree, orders, lines)
    }

    #[test]
    fn test_table_folders_are_views_over_table_lists() {
        let (tree, orders, _) = orders_and_lines();

        let children = tree.children(TreeItem::Node(orders));
        assert_eq!(
            children,
            vec![
                TreeItem::Folder(orders, FolderKind::Columns),
                TreeItem::Folder(orders, FolderKind::ExportedKeys),
                TreeItem::Folder(orders, FolderKind::ImportedKeys),
            ]
        );

        let folder = tree.folder(orders, FolderKind::Columns).unwrap();
        assert_eq!(folder.name(), "Columns");
        assert!(folder.is_populated());
        assert_eq!(folder.children(), tree.table(orders).unwrap().columns.as_slice());
        let names: Vec<&str> = folder.iter().map(Node::name).collect();
        assert_eq!(names, vec!["id", "placed_at"]);
    }

    #[test]
    fn test_insert_and_remove_column_fire_events() {
        let (mut tree, orders, _) = orders_and_lines();

        let note = tree
            .insert_column(orders, 1, Column::new("note", type_codes::VARCHAR).nullable(true))
            .unwrap();
        let removed = tree.remove_column(orders, 0).unwrap();
        assert_eq!(removed.name, "id");

        let events = tree.drain_events();
        assert_eq!(
            events,
            vec![
                TreeEvent::ChildrenInserted(ChildrenChanged {
                    owner: TreeItem::Folder(orders, FolderKind::Columns),
                    indices: vec![1],
                    children: vec![note],
                }),
                TreeEvent::ChildrenRemoved(ChildrenChanged {
                    owner: TreeItem::Folder(orders, FolderKind::Columns),
                    indices: vec![0],
                    children: vec![tree.nodes.iter().find(|n| n.name() == "id").unwrap().id],
                }),
            ]
        );
        assert!(tree.drain_events().is_empty());
    }

    #[test]
    fn test_insert_column_out_of_bounds() {
        let (mut tree, orders, _) = orders_and_lines();
        let err = tree
            .insert_column(orders, 9, Column::new("x", type_codes::INTEGER))
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionViolation(_)));
    }

    #[test]
    fn test_relationship_requires_columns_of_declared_tables() {
        let (mut tree, orders, lines) = orders_and_lines();
        let order_id = tree.find_column(lines, "ORDER_ID").unwrap();
        let id = tree.find_column(orders, "id").unwrap();

        let wrong = NewRelationship::new("fk_bad", orders, lines).map(order_id, id);
        assert!(matches!(
            tree.add_relationship(wrong),
            Err(Error::PreconditionViolation(_))
        ));

        let empty = NewRelationship::new("fk_empty", orders, lines);
        assert!(tree.add_relationship(empty).is_err());

        let rel = tree
            .add_relationship(NewRelationship::new("fk_lines_order", orders, lines).map(id, order_id))
            .unwrap();
        assert_eq!(tree.table(orders).unwrap().exported_keys, vec![rel]);
        assert_eq!(tree.table(lines).unwrap().imported_keys, vec![rel]);
    }

    #[test]
    fn test_remove_column_used_by_relationship_is_rejected() {
        let (mut tree, orders, lines) = orders_and_lines();
        let id = tree.find_column(orders, "id").unwrap();
        let order_id = tree.find_column(lines, "order_id").unwrap();
        tree.add_relationship(NewRelationship::new("fk", orders, lines).map(id, order_id))
            .unwrap();

        assert!(matches!(
            tree.remove_column(lines, 0),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_inherit_columns_at_position() {
        let (mut tree, orders, lines) = orders_and_lines();
        let copied = tree.inherit_columns(lines, Some(0), orders).unwrap();

        assert_eq!(copied.len(), 2);
        let names: Vec<&str> = tree
            .folder(lines, FolderKind::Columns)
            .unwrap()
            .iter()
            .map(Node::name)
            .collect();
        assert_eq!(names, vec!["id", "placed_at", "order_id"]);

        let events = tree.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change().indices, vec![0, 1]);
        assert_eq!(events[0].change().start_index(), Some(0));
    }

    #[test]
    fn test_derive_table_copies_leaf_attributes() {
        let (mut source, orders, _) = orders_and_lines();
        source.set_remarks(orders, Some("customer orders".into())).unwrap();
        source.set_primary_key_name(orders, Some("orders_pk".into())).unwrap();

        let mut target = SchemaTree::new("warehouse");
        let copy = target.derive_table(target.root(), &source, orders).unwrap();

        let t = target.table(copy).unwrap();
        assert_eq!(t.name, "orders");
        assert_eq!(t.remarks.as_deref(), Some("customer orders"));
        assert_eq!(t.primary_key_name.as_deref(), Some("orders_pk"));
        assert!(t.is_populated());
        assert_eq!(target.primary_key_columns(copy).unwrap().len(), 1);
        assert!(t.exported_keys.is_empty());
    }

    #[test]
    fn test_derive_unpopulated_table_is_precondition_violation() {
        let mut source = SchemaTree::for_introspection("live");
        let ids = source
            .insert_discovered_tables(vec![TableRecord::new(None, None, "pending", TableKind::Table)])
            .unwrap();
        let mut target = SchemaTree::new("copy");
        assert!(matches!(
            target.derive_table(target.root(), &source, ids[0]),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_discovered_tables_reuse_groups() {
        let mut tree = SchemaTree::for_introspection("erp");
        tree.insert_discovered_tables(vec![
            TableRecord::new(Some("erp"), Some("sales"), "orders", TableKind::Table),
            TableRecord::new(Some("erp"), Some("sales"), "customers", TableKind::Table),
            TableRecord::new(Some("erp"), Some("hr"), "staff", TableKind::Table),
            TableRecord::new(None, None, "loose", TableKind::View),
        ])
        .unwrap();

        let catalogs = tree.groups(tree.root());
        assert_eq!(catalogs.len(), 1);
        let schemas = tree.groups(catalogs[0]);
        assert_eq!(schemas.len(), 2);
        assert_eq!(tree.direct_tables(schemas[0]).len(), 2);
        assert_eq!(tree.tables(tree.root()).len(), 4);

        let customers = tree.find_table(Some("erp"), Some("sales"), "CUSTOMERS").unwrap();
        assert_eq!(tree.qualified_name(customers), "erp.sales.customers");
        assert_eq!(tree.short_display_name(customers), "sales.customers (TABLE)");
        assert!(!tree.is_populated(TreeItem::Node(customers)));

        // root gets catalog + loose table; catalog gets two schemas; schemas get tables
        let events = tree.drain_events();
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_primary_key_columns_ordered_by_sequence() {
        let mut tree = SchemaTree::new("db");
        let t = tree.add_table(tree.root(), "pair", TableKind::Table).unwrap();
        let b = tree.add_column(t, Column::new("B", type_codes::INTEGER).primary_key(2)).unwrap();
        let a = tree.add_column(t, Column::new("A", type_codes::INTEGER).primary_key(1)).unwrap();
        tree.add_column(t, Column::new("C", type_codes::INTEGER)).unwrap();

        assert_eq!(tree.primary_key_columns(t).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_reset_population_only_rearms_failures() {
        let mut tree = SchemaTree::for_introspection("db");
        assert!(!tree.reset_population(tree.root()).unwrap());
        tree.set_database_state(PopulationState::Failed("refused".into()));
        assert!(tree.reset_population(tree.root()).unwrap());
        assert_eq!(tree.database_state(), &PopulationState::Unpopulated);
    }

    #[test]
    fn test_clone_gets_new_identity() {
        let (tree, _, _) = orders_and_lines();
        let copy = tree.clone();
        assert_ne!(tree.id(), copy.id());
        assert_eq!(copy.tables(copy.root()).len(), 2);
    }
}
