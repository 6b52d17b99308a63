//! Lazy population of a tree against a metadata source
//!
//! `LiveDatabase` owns a tree behind an async `RwLock` and fills it in on
//! demand. Every (node, phase) pair has its own async mutex, so concurrent
//! requests for one table fetch once, while unrelated tables proceed in
//! parallel. The tree lock is never held across a fetch.

use futures::future::try_join_all;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::schema::source::{ColumnRecord, ImportedKeyRecord, MetadataSource, TableFilter, TableRecord};
use crate::schema::tree::{SchemaTree, TreeEvent};
use crate::schema::types::{FolderKind, NewRelationship, NodeId, PopulationState, TableCoordinates, TreeItem};
use crate::utils::naming::generate_unique_name;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Database,
    Columns,
    Relationships,
}

/// A schema tree backed by a live metadata source
pub struct LiveDatabase {
    tree: RwLock<SchemaTree>,
    root: NodeId,
    source: Arc<dyn MetadataSource>,
    filter: TableFilter,
    locks: Mutex<HashMap<(NodeId, Phase), Arc<Mutex<()>>>>,
    events: broadcast::Sender<TreeEvent>,
}

impl LiveDatabase {
    pub fn new(name: &str, source: Arc<dyn MetadataSource>) -> Self {
        let tree = SchemaTree::for_introspection(name);
        let root = tree.root();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tree: RwLock::new(tree),
            root,
            source,
            filter: TableFilter::all(),
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Restrict the database sweep
    pub fn with_filter(mut self, filter: TableFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn source(&self) -> Arc<dyn MetadataSource> {
        Arc::clone(&self.source)
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, SchemaTree> {
        self.tree.read().await
    }

    /// Apply a structural edit and broadcast the resulting events
    pub async fn edit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SchemaTree) -> R,
    {
        let mut tree = self.tree.write().await;
        let result = f(&mut tree);
        self.publish(&mut tree);
        result
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// A detached copy of the tree as it is now
    pub async fn snapshot(&self) -> SchemaTree {
        self.tree.read().await.clone()
    }

    pub fn into_tree(self) -> SchemaTree {
        self.tree.into_inner()
    }

    fn publish(&self, tree: &mut SchemaTree) {
        for event in tree.drain_events() {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    async fn phase_lock(&self, node: NodeId, phase: Phase) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry((node, phase)).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        lock.lock_owned().await
    }

    /// Populate whatever `item` stands for. Folders delegate to their table.
    pub async fn populate(&self, item: TreeItem) -> Result<()> {
        match item {
            TreeItem::Node(id) if id == self.root => self.populate_database().await,
            TreeItem::Node(id) => {
                let is_table = self.tree.read().await.table(id).is_ok();
                if is_table {
                    self.populate_table(id).await
                } else {
                    Ok(())
                }
            }
            TreeItem::Folder(table, FolderKind::Columns) => self.populate_columns(table).await,
            TreeItem::Folder(table, _) => self.populate_table(table).await,
        }
    }

    /// Discover catalogs, schemas and tables in one sweep
    pub async fn populate_database(&self) -> Result<()> {
        let _guard = self.phase_lock(self.root, Phase::Database).await;
        let name = {
            let tree = self.tree.read().await;
            if tree.database_state().is_populated() {
                return Ok(());
            }
            tree.name(TreeItem::Node(self.root)).to_string()
        };

        debug!(database = %name, "Discovering tables");
        match self.source.list_tables(&self.filter).await {
            Ok(records) => {
                let records: Vec<TableRecord> = records.into_iter().map(normalize_record).collect();
                let count = records.len();
                let mut tree = self.tree.write().await;
                tree.insert_discovered_tables(records)?;
                tree.set_database_state(PopulationState::Populated);
                self.publish(&mut tree);
                info!(database = %name, tables = count, "Database populated");
                Ok(())
            }
            Err(e) => {
                warn!(database = %name, error = %e, "Table discovery failed");
                let mut tree = self.tree.write().await;
                tree.set_database_state(PopulationState::Failed(e.to_string()));
                Err(Error::fetch(name, e))
            }
        }
    }

    /// Fetch a table's columns, once
    pub async fn populate_columns(&self, table: NodeId) -> Result<()> {
        let _guard = self.phase_lock(table, Phase::Columns).await;
        let coords = {
            let tree = self.tree.read().await;
            if tree.table(table)?.columns_state.is_populated() {
                return Ok(());
            }
            tree.table_coordinates(table)?
        };

        debug!(table = %coords, "Fetching columns");
        match self.source.list_columns(&coords).await {
            Ok(records) => {
                let pk_name = records.iter().find_map(|r| r.pk_name.clone());
                let columns = records.into_iter().map(ColumnRecord::into_column).collect::<Vec<_>>();
                let mut tree = self.tree.write().await;
                tree.apply_fetched_columns(table, columns, pk_name)?;
                self.publish(&mut tree);
                Ok(())
            }
            Err(e) => {
                warn!(table = %coords, error = %e, "Column fetch failed");
                let mut tree = self.tree.write().await;
                tree.set_columns_state(table, PopulationState::Failed(e.to_string()))?;
                Err(Error::fetch(coords.to_string(), e))
            }
        }
    }

    /// Fetch the foreign keys a table imports, once. Columns must be
    /// populated first.
    pub async fn populate_relationships(&self, table: NodeId) -> Result<()> {
        let _guard = self.phase_lock(table, Phase::Relationships).await;
        let (coords, columns_state) = {
            let tree = self.tree.read().await;
            let t = tree.table(table)?;
            if t.relationships_state.is_populated() {
                return Ok(());
            }
            if t.columns_state == PopulationState::Unpopulated {
                return Err(Error::precondition(format!(
                    "columns of {} must be populated before its relationships",
                    tree.qualified_name(table)
                )));
            }
            (tree.table_coordinates(table)?, t.columns_state.clone())
        };

        if let Some(reason) = columns_state.failure() {
            let mut tree = self.tree.write().await;
            tree.set_relationships_state(
                table,
                PopulationState::Failed(format!("columns unavailable: {}", reason)),
            )?;
            return Ok(());
        }

        debug!(table = %coords, "Fetching imported keys");
        let records = match self.source.list_imported_keys(&coords).await {
            Ok(records) => records,
            Err(e) => {
                warn!(table = %coords, error = %e, "Imported key fetch failed");
                let mut tree = self.tree.write().await;
                tree.set_relationships_state(table, PopulationState::Failed(e.to_string()))?;
                return Err(Error::fetch(coords.to_string(), e));
            }
        };

        let keys = group_keys(records);

        // Resolve every referenced table and make sure its columns exist
        let mut resolved = Vec::with_capacity(keys.len());
        for (name, pairs) in keys {
            let pk_coords = normalize_coordinates(pairs[0].pk_table.clone());
            let pk_table = self.tree.read().await.find_table(
                pk_coords.catalog.as_deref(),
                pk_coords.schema.as_deref(),
                &pk_coords.name,
            );
            let Some(pk_table) = pk_table else {
                warn!(relationship = %name, pk_table = %pk_coords, "Referenced table not in tree; skipping");
                continue;
            };
            if pk_table != table {
                if let Err(e) = self.populate_columns(pk_table).await {
                    warn!(relationship = %name, error = %e, "Referenced table could not be populated; skipping");
                    continue;
                }
            }
            resolved.push((name, pk_table, pairs));
        }

        let mut tree = self.tree.write().await;
        let mut relationships = Vec::with_capacity(resolved.len());
        'keys: for (name, pk_table, pairs) in resolved {
            let mut rel = NewRelationship::new(&name, pk_table, table);
            rel.update_rule = pairs[0].update_rule.clone();
            rel.delete_rule = pairs[0].delete_rule.clone();
            for pair in &pairs {
                let pk_column = tree.find_column(pk_table, &pair.pk_column);
                let fk_column = tree.find_column(table, &pair.fk_column);
                match (pk_column, fk_column) {
                    (Some(pk), Some(fk)) => rel = rel.map(pk, fk),
                    _ => {
                        warn!(
                            relationship = %name,
                            pk_column = %pair.pk_column,
                            fk_column = %pair.fk_column,
                            "Relationship column not found; skipping"
                        );
                        continue 'keys;
                    }
                }
            }
            relationships.push(rel);
        }

        let count = relationships.len();
        tree.apply_fetched_relationships(table, relationships)?;
        self.publish(&mut tree);
        debug!(table = %coords, relationships = count, "Relationships populated");
        Ok(())
    }

    /// Columns, then relationships
    pub async fn populate_table(&self, table: NodeId) -> Result<()> {
        self.populate_columns(table).await?;
        self.populate_relationships(table).await
    }

    /// Populate the whole database: one sweep, then every table's columns
    /// concurrently, then every table's relationships concurrently
    pub async fn populate_all(&self) -> Result<()> {
        self.populate_database().await?;
        let tables = self.tree.read().await.tables(self.root);

        try_join_all(tables.iter().map(|t| self.populate_columns(*t))).await?;
        try_join_all(tables.iter().map(|t| self.populate_relationships(*t))).await?;

        info!(tables = tables.len(), "All tables populated");
        Ok(())
    }

    /// Re-arm a failed node so the next populate call fetches again
    pub async fn reset_population(&self, node: NodeId) -> Result<bool> {
        self.tree.write().await.reset_population(node)
    }

    /// Copy a table of this database into `target`, populating it first
    pub async fn derive_table(&self, target: &mut SchemaTree, parent: NodeId, table: NodeId) -> Result<NodeId> {
        self.populate_table(table).await?;
        let tree = self.tree.read().await;
        target.derive_table(parent, &tree, table)
    }
}

fn normalize_coordinates(mut coords: TableCoordinates) -> TableCoordinates {
    coords.catalog = coords.catalog.filter(|c| !c.is_empty());
    coords.schema = coords.schema.filter(|s| !s.is_empty());
    coords
}

fn normalize_record(mut record: TableRecord) -> TableRecord {
    record.coordinates = normalize_coordinates(record.coordinates);
    record
}

/// Group column pairs into keys by constraint name, each ordered by key
/// sequence. Unnamed keys are named after the referenced table; a new one
/// starts at every `key_seq == 1` or change of referenced table.
fn group_keys(records: Vec<ImportedKeyRecord>) -> IndexMap<String, Vec<ImportedKeyRecord>> {
    let mut keys: IndexMap<String, Vec<ImportedKeyRecord>> = IndexMap::new();
    let mut open_unnamed: Option<String> = None;
    for record in records {
        let name = match record.fk_name.clone().filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => {
                let continues = open_unnamed.as_ref().filter(|name| {
                    record.key_seq != 1
                        && keys
                            .get(name.as_str())
                            .and_then(|pairs| pairs.first())
                            .is_some_and(|first| first.pk_table == record.pk_table)
                });
                match continues {
                    Some(name) => name.clone(),
                    None => {
                        let taken: HashSet<String> = keys.keys().map(|k| k.to_lowercase()).collect();
                        let name = generate_unique_name(&format!("{}_fk", record.pk_table.name), &taken);
                        open_unnamed = Some(name.clone());
                        name
                    }
                }
            }
        };
        keys.entry(name).or_default().push(record);
    }
    for pairs in keys.values_mut() {
        pairs.sort_by_key(|p| p.key_seq);
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::source::InMemorySource;
    use crate::schema::types::{TableKind, TreeItem};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::schema::source::TypeInfoRecord;

    struct CountingSource {
        inner: InMemorySource,
        column_calls: AtomicUsize,
        fail_columns: bool,
    }

    #[async_trait]
    impl MetadataSource for CountingSource {
        async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<TableRecord>> {
            self.inner.list_tables(filter).await
        }

        async fn list_columns(&self, table: &TableCoordinates) -> Result<Vec<ColumnRecord>> {
            self.column_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_columns {
                return Err(Error::DatabaseError("connection reset".into()));
            }
            self.inner.list_columns(table).await
        }

        async fn list_imported_keys(&self, table: &TableCoordinates) -> Result<Vec<ImportedKeyRecord>> {
            self.inner.list_imported_keys(table).await
        }

        async fn type_info(&self) -> Result<Vec<TypeInfoRecord>> {
            self.inner.type_info().await
        }
    }

    fn parent_child_source() -> InMemorySource {
        let t = TableCoordinates::new(None, Some("app"), "T");
        let u = TableCoordinates::new(None, Some("app"), "U");
        InMemorySource::new()
            .with_table(TableRecord::new(None, Some("app"), "T", TableKind::Table))
            .with_table(TableRecord::new(None, Some("app"), "U", TableKind::Table))
            .with_column(&t, ColumnRecord::new("id", "integer").primary_key(1, "T_pk"))
            .with_column(&u, ColumnRecord::new("t_id", "integer"))
            .with_imported_key(&u, ImportedKeyRecord::new("U_T_fk", t.clone(), "id", "t_id", 1))
    }

    fn counting(fail_columns: bool) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            inner: parent_child_source(),
            column_calls: AtomicUsize::new(0),
            fail_columns,
        })
    }

    #[tokio::test]
    async fn test_concurrent_column_population_fetches_once() {
        let source = counting(false);
        let live = LiveDatabase::new("app", source.clone());
        live.populate_database().await.unwrap();
        let t = live.read().await.find_table(None, Some("app"), "T").unwrap();
        let mut events = live.subscribe();

        let (a, b, c) = tokio::join!(
            live.populate_columns(t),
            live.populate_columns(t),
            live.populate(TreeItem::Folder(t, FolderKind::Columns)),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(source.column_calls.load(Ordering::SeqCst), 1);
        assert_eq!(live.read().await.table(t).unwrap().columns.len(), 1);

        let event = events.try_recv().unwrap();
        assert_eq!(event.change().owner, TreeItem::Folder(t, FolderKind::Columns));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relationships_before_columns_is_precondition_violation() {
        let live = LiveDatabase::new("app", counting(false));
        live.populate_database().await.unwrap();
        let u = live.read().await.find_table(None, Some("app"), "U").unwrap();

        assert!(matches!(
            live.populate_relationships(u).await,
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_relationship_population_populates_referenced_table() {
        let source = counting(false);
        let live = LiveDatabase::new("app", source.clone());
        live.populate_database().await.unwrap();
        let (t, u) = {
            let tree = live.read().await;
            (
                tree.find_table(None, Some("app"), "T").unwrap(),
                tree.find_table(None, Some("app"), "U").unwrap(),
            )
        };

        live.populate_table(u).await.unwrap();

        let tree = live.read().await;
        let t_table = tree.table(t).unwrap();
        assert!(t_table.columns_state.is_populated());
        assert!(!t_table.relationships_state.is_populated());
        assert_eq!(t_table.exported_keys.len(), 1);
        assert_eq!(t_table.primary_key_name.as_deref(), Some("T_pk"));

        let rel = tree.relationship(t_table.exported_keys[0]).unwrap();
        assert_eq!(rel.name, "U_T_fk");
        assert_eq!(rel.fk_table, u);
        assert_eq!(source.column_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_reported_once_then_noop() {
        let source = counting(true);
        let live = LiveDatabase::new("app", source.clone());
        live.populate_database().await.unwrap();
        let t = live.read().await.find_table(None, Some("app"), "T").unwrap();

        let err = live.populate_columns(t).await.unwrap_err();
        assert!(matches!(err, Error::MetadataFetchError { .. }));
        assert!(live.read().await.is_populated(TreeItem::Folder(t, FolderKind::Columns)));
        assert!(live.read().await.table(t).unwrap().columns_state.failure().is_some());

        live.populate_columns(t).await.unwrap();
        assert_eq!(source.column_calls.load(Ordering::SeqCst), 1);

        assert!(live.reset_population(t).await.unwrap());
        assert!(live.populate_columns(t).await.is_err());
        assert_eq!(source.column_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_populate_all_and_derive() {
        let live = LiveDatabase::new("app", Arc::new(parent_child_source()));
        live.populate_all().await.unwrap();

        let tree = live.snapshot().await;
        assert!(tree.tables(tree.root()).iter().all(|t| tree.is_populated(TreeItem::Node(*t))));

        let t = tree.find_table(None, Some("app"), "T").unwrap();
        let mut target = SchemaTree::new("copy");
        let root = target.root();
        let copy = live.derive_table(&mut target, root, t).await.unwrap();
        assert_eq!(target.table(copy).unwrap().columns.len(), 1);
    }

    #[test]
    fn test_group_keys_orders_by_sequence() {
        let pk = TableCoordinates::new(None, None, "P");
        let keys = group_keys(vec![
            ImportedKeyRecord::new("fk_pair", pk.clone(), "b", "pb", 2),
            ImportedKeyRecord::new("fk_pair", pk.clone(), "a", "pa", 1),
            ImportedKeyRecord {
                fk_name: None,
                ..ImportedKeyRecord::new("", pk.clone(), "x", "px", 1)
            },
        ]);
        let names: Vec<&String> = keys.keys().collect();
        assert_eq!(names, vec!["fk_pair", "P_fk"]);
        assert_eq!(keys["fk_pair"][0].pk_column, "a");
    }

    #[test]
    fn test_unnamed_keys_to_one_table_stay_separate() {
        let pk = TableCoordinates::new(None, None, "P");
        let unnamed = |pk_column: &str, fk_column: &str, seq: u32| ImportedKeyRecord {
            fk_name: None,
            ..ImportedKeyRecord::new("", pk.clone(), pk_column, fk_column, seq)
        };
        let keys = group_keys(vec![
            unnamed("a", "billing_a", 1),
            unnamed("b", "billing_b", 2),
            unnamed("a", "shipping_a", 1),
            unnamed("b", "shipping_b", 2),
        ]);

        let names: Vec<&String> = keys.keys().collect();
        assert_eq!(names, vec!["P_fk", "P_fk_1"]);
        let fk_columns = |name: &str| keys[name].iter().map(|p| p.fk_column.as_str()).collect::<Vec<_>>();
        assert_eq!(fk_columns("P_fk"), vec!["billing_a", "billing_b"]);
        assert_eq!(fk_columns("P_fk_1"), vec!["shipping_a", "shipping_b"]);
    }
}
