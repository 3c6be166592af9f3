//! The advance loop.
//!
//! A [`PipelineDriver`] owns one [`Snapshotter`] over a replica, the table
//! sources its queries read from and one [`ArrayView`] per query. Each
//! [`advance`](PipelineDriver::advance) moves the snapshotter to the replica
//! head, pushes every changed row into its source and then flushes each view
//! once, so listeners see one notification per advance.

use crate::config::PipelineConfig;
use hashbrown::HashMap;
use rill_core::{Error, Result, Version};
use rill_incremental::{Input, SourceChange, TableSource};
use rill_reactive::{ArrayView, Format};
use rill_storage::{DiffEntry, Replica, Snapshotter};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info, trace};

/// Builds the operator pipeline of a query from the driver's sources.
pub type QueryBuilder = Rc<dyn Fn(&PipelineDriver) -> Result<Rc<dyn Input>>>;

struct Query {
    builder: QueryBuilder,
    format: Format,
    view: Rc<ArrayView>,
}

/// What an [`advance`](PipelineDriver::advance) did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The diff was pushed through the sources.
    Pushed {
        prev_version: Version,
        version: Version,
        /// Number of row changes pushed.
        changes: usize,
    },
    /// The diff exceeded the configured threshold; sources were rebuilt and
    /// queries re-hydrated at `version`.
    Reset {
        prev_version: Version,
        version: Version,
        /// Number of change-log entries in the skipped diff.
        changes: usize,
    },
}

impl AdvanceOutcome {
    /// The version the driver is at after the advance.
    pub fn version(&self) -> &Version {
        match self {
            AdvanceOutcome::Pushed { version, .. } | AdvanceOutcome::Reset { version, .. } => version,
        }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, AdvanceOutcome::Reset { .. })
    }
}

/// Keeps a set of materialized queries in sync with a replica.
pub struct PipelineDriver {
    replica: Replica,
    config: PipelineConfig,
    snapshotter: Snapshotter,
    sources: RefCell<HashMap<String, Rc<TableSource>>>,
    queries: BTreeMap<String, Query>,
}

impl PipelineDriver {
    pub fn new(replica: &Replica, config: PipelineConfig) -> Self {
        Self {
            replica: replica.clone(),
            snapshotter: Snapshotter::new(replica),
            config,
            sources: RefCell::new(HashMap::new()),
            queries: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Opens the first snapshot. Returns its version.
    pub fn init(&mut self) -> Result<Version> {
        let version = self.snapshotter.init()?.version().clone();
        info!(%version, "pipeline driver initialized");
        Ok(version)
    }

    /// The version sources and views currently reflect.
    pub fn current_version(&self) -> Result<Version> {
        Ok(self.snapshotter.current()?.version().clone())
    }

    /// Returns the source of `table`, loading it from the current snapshot
    /// on first use.
    pub fn source(&self, table: &str) -> Result<Rc<TableSource>> {
        if let Some(source) = self.sources.borrow().get(table) {
            return Ok(Rc::clone(source));
        }
        let snapshot = self.snapshotter.current()?;
        let spec = self.replica.table_spec(table)?;
        let source = Rc::new(TableSource::new(spec));
        let mut rows = 0usize;
        for row in snapshot.scan(table)? {
            source.push(SourceChange::Add(row?))?;
            rows += 1;
        }
        debug!(table, rows, version = %snapshot.version(), "loaded source");
        self.sources
            .borrow_mut()
            .insert(table.to_string(), Rc::clone(&source));
        Ok(source)
    }

    /// Number of loaded sources.
    pub fn source_count(&self) -> usize {
        self.sources.borrow().len()
    }

    /// Builds, materializes and hydrates a query.
    pub fn add_query<F>(&mut self, id: impl Into<String>, format: Format, builder: F) -> Result<Rc<ArrayView>>
    where
        F: Fn(&PipelineDriver) -> Result<Rc<dyn Input>> + 'static,
    {
        let id = id.into();
        if self.queries.contains_key(&id) {
            return Err(Error::invalid_operation(format!("query {id} already exists")));
        }
        let builder: QueryBuilder = Rc::new(builder);
        let view = self.materialize(&builder, &format)?;
        view.hydrate()?;
        info!(query = %id, "added query");
        self.queries.insert(
            id,
            Query {
                builder,
                format,
                view: Rc::clone(&view),
            },
        );
        Ok(view)
    }

    /// Destroys a query's view and pipeline. Returns false if the id is
    /// unknown.
    pub fn remove_query(&mut self, id: &str) -> bool {
        match self.queries.remove(id) {
            Some(query) => {
                query.view.destroy();
                info!(query = %id, "removed query");
                true
            }
            None => false,
        }
    }

    /// Returns the view of a query. Views are replaced when the driver
    /// resets; listeners move to the replacement.
    pub fn query(&self, id: &str) -> Option<Rc<ArrayView>> {
        self.queries.get(id).map(|q| Rc::clone(&q.view))
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Moves to the replica head and brings every view up to date.
    pub fn advance(&mut self) -> Result<AdvanceOutcome> {
        let diff = self.snapshotter.advance()?;
        let prev_version = diff.prev_version().clone();
        let version = diff.curr_version().clone();
        let changes = diff.changes();

        if let Some(max) = self.config.max_changes_per_advance {
            if changes > max {
                info!(%prev_version, %version, changes, max, "diff too large, resetting");
                drop(diff);
                self.reset()?;
                return Ok(AdvanceOutcome::Reset {
                    prev_version,
                    version,
                    changes,
                });
            }
        }

        let mut pushed = 0usize;
        for entry in diff.iter() {
            let entry = entry?;
            let source = match self.sources.borrow().get(&entry.table) {
                Some(source) => Rc::clone(source),
                None => continue,
            };
            if let Some(change) = source_change(entry) {
                trace!(table = %source.table_name(), "pushing diff entry");
                source.push(change)?;
                pushed += 1;
            }
        }
        for query in self.queries.values() {
            query.view.flush();
        }
        debug!(%prev_version, %version, changes = pushed, "advanced pipelines");
        Ok(AdvanceOutcome::Pushed {
            prev_version,
            version,
            changes: pushed,
        })
    }

    /// Reloads every source from the current snapshot and re-hydrates every
    /// query. Each view notifies its listeners once.
    pub fn reset(&mut self) -> Result<()> {
        let version = self.current_version()?;
        self.sources.borrow_mut().clear();
        let ids: Vec<String> = self.queries.keys().cloned().collect();
        for id in &ids {
            let (builder, format, old) = match self.queries.get(id) {
                Some(q) => (Rc::clone(&q.builder), q.format.clone(), Rc::clone(&q.view)),
                None => continue,
            };
            let view = self.materialize(&builder, &format)?;
            view.take_over(&old);
            old.destroy();
            view.hydrate()?;
            if let Some(query) = self.queries.get_mut(id) {
                query.view = view;
            }
        }
        info!(%version, queries = ids.len(), "pipeline driver reset");
        Ok(())
    }

    /// Destroys every query and releases the snapshots.
    pub fn destroy(mut self) {
        for (_, query) in core::mem::take(&mut self.queries) {
            query.view.destroy();
        }
        self.sources.borrow_mut().clear();
        self.snapshotter.destroy();
        debug!("pipeline driver destroyed");
    }

    fn materialize(&self, builder: &QueryBuilder, format: &Format) -> Result<Rc<ArrayView>> {
        let input = builder(self)?;
        ArrayView::new(input, format.clone())
    }
}

/// Maps a diff entry to the change its source sees.
fn source_change(entry: DiffEntry) -> Option<SourceChange> {
    match (entry.prev_value, entry.next_value) {
        (Some(old_row), Some(row)) => Some(SourceChange::Edit { old_row, row }),
        (Some(row), None) => Some(SourceChange::Remove(row)),
        (None, Some(row)) => Some(SourceChange::Add(row)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{row, Sort, TableBuilder, ValueType};
    use rill_incremental::Take;
    use rill_reactive::View;
    use rill_storage::StoredRow;
    use std::cell::Cell;

    fn replica() -> Replica {
        let replica = Replica::new();
        let spec = TableBuilder::new("users")
            .unwrap()
            .add_column("id", ValueType::Number)
            .unwrap()
            .add_column("name", ValueType::String)
            .unwrap()
            .add_primary_key(&["id"])
            .unwrap()
            .build()
            .unwrap();
        replica.create_table(spec).unwrap();
        replica
    }

    fn write(replica: &Replica, version: u64, f: impl FnOnce(&mut rill_storage::WriteTransaction)) {
        let mut tx = replica.begin(Version::from_u64(version)).unwrap();
        f(&mut tx);
        tx.commit().unwrap();
    }

    fn user(id: i64, name: &str) -> StoredRow {
        StoredRow::new().with("id", id).with("name", name)
    }

    fn names(view: &View) -> Vec<String> {
        view.iter()
            .map(|e| e.get("name").as_str().unwrap().to_string())
            .collect()
    }

    fn all_users(driver: &PipelineDriver) -> Result<Rc<dyn Input>> {
        let input: Rc<dyn Input> = driver.source("users")?.connect(Sort::asc(["id"]), None)?;
        Ok(input)
    }

    #[test]
    fn test_source_change_mapping() {
        let entry = |prev, next| DiffEntry {
            table: "users".to_string(),
            row_key: row! { "id" => 1 },
            prev_value: prev,
            next_value: next,
        };
        let a = row! { "id" => 1, "name" => "a" };
        let b = row! { "id" => 1, "name" => "b" };
        assert_eq!(
            source_change(entry(None, Some(a.clone()))),
            Some(SourceChange::Add(a.clone()))
        );
        assert_eq!(
            source_change(entry(Some(a.clone()), None)),
            Some(SourceChange::Remove(a.clone()))
        );
        assert_eq!(
            source_change(entry(Some(a.clone()), Some(b.clone()))),
            Some(SourceChange::Edit { old_row: a, row: b })
        );
        assert_eq!(source_change(entry(None, None)), None);
    }

    #[test]
    fn test_requires_init() {
        let replica = replica();
        let mut driver = PipelineDriver::new(&replica, PipelineConfig::default());
        assert!(matches!(driver.current_version(), Err(Error::NotInitialized)));
        let err = driver.add_query("q", Format::list(), all_users).unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        assert!(matches!(driver.advance(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_advance_notifies_once() {
        let replica = replica();
        write(&replica, 1, |tx| tx.set("users", user(1, "alice")).unwrap());

        let mut driver = PipelineDriver::new(&replica, PipelineConfig::default());
        driver.init().unwrap();
        let view = driver.add_query("users", Format::list(), all_users).unwrap();
        assert_eq!(names(&view.data()), vec!["alice"]);

        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        view.add_listener(move |_| c.set(c.get() + 1));
        assert_eq!(calls.get(), 1);

        write(&replica, 2, |tx| {
            tx.set("users", user(2, "bob")).unwrap();
            tx.set("users", user(1, "alicia")).unwrap();
            tx.set("users", user(3, "carol")).unwrap();
        });
        write(&replica, 3, |tx| {
            tx.delete("users", &StoredRow::new().with("id", 3)).unwrap();
        });

        let outcome = driver.advance().unwrap();
        assert!(!outcome.is_reset());
        assert_eq!(outcome.version(), &Version::from_u64(3));
        assert_eq!(calls.get(), 2);
        assert_eq!(names(&view.data()), vec!["alicia", "bob"]);
        assert_eq!(driver.current_version().unwrap(), Version::from_u64(3));

        // Nothing changed: no notification.
        driver.advance().unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_duplicate_and_removed_queries() {
        let replica = replica();
        let mut driver = PipelineDriver::new(&replica, PipelineConfig::default());
        driver.init().unwrap();
        driver.add_query("q", Format::list(), all_users).unwrap();
        let err = driver.add_query("q", Format::list(), all_users).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));

        let source = driver.source("users").unwrap();
        assert_eq!(source.connection_count(), 1);
        assert!(driver.remove_query("q"));
        assert!(!driver.remove_query("q"));
        assert_eq!(source.connection_count(), 0);
        assert!(driver.query("q").is_none());
    }

    #[test]
    fn test_unknown_table() {
        let replica = replica();
        let mut driver = PipelineDriver::new(&replica, PipelineConfig::default());
        driver.init().unwrap();
        let err = driver
            .add_query("q", Format::list(), |d: &PipelineDriver| {
                let input: Rc<dyn Input> = d.source("missing")?.connect(Sort::asc(["id"]), None)?;
                Ok(input)
            })
            .unwrap_err();
        assert!(matches!(err, Error::TableNotFound { .. }));
        assert_eq!(driver.query_count(), 0);
    }

    #[test]
    fn test_large_diff_resets() {
        let replica = replica();
        write(&replica, 1, |tx| tx.set("users", user(1, "alice")).unwrap());

        let config = PipelineConfig::default().with_max_changes_per_advance(2);
        let mut driver = PipelineDriver::new(&replica, config);
        driver.init().unwrap();
        driver
            .add_query("first_two", Format::list(), |d: &PipelineDriver| {
                let input: Rc<dyn Input> = Take::new(all_users(d)?, 2, None)?;
                Ok(input)
            })
            .unwrap();
        let old = driver.query("first_two").unwrap();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        old.add_listener(move |_| c.set(c.get() + 1));

        write(&replica, 2, |tx| tx.set("users", user(2, "bob")).unwrap());
        let outcome = driver.advance().unwrap();
        assert!(!outcome.is_reset());
        assert_eq!(calls.get(), 2);

        write(&replica, 3, |tx| {
            tx.set("users", user(0, "zed")).unwrap();
            tx.set("users", user(5, "eve")).unwrap();
            tx.delete("users", &StoredRow::new().with("id", 2)).unwrap();
        });
        let outcome = driver.advance().unwrap();
        assert!(outcome.is_reset());
        assert_eq!(calls.get(), 3);

        let view = driver.query("first_two").unwrap();
        assert!(!Rc::ptr_eq(&old, &view));
        assert_eq!(names(&view.data()), vec!["zed", "alice"]);
        assert_eq!(view.listener_count(), 1);

        // The rebuilt pipeline keeps receiving changes.
        write(&replica, 4, |tx| {
            tx.delete("users", &StoredRow::new().with("id", 0)).unwrap();
        });
        driver.advance().unwrap();
        assert_eq!(calls.get(), 4);
        assert_eq!(names(&view.data()), vec!["alice", "eve"]);
    }

    #[test]
    fn test_destroy_runs_view_callbacks() {
        let replica = replica();
        let mut driver = PipelineDriver::new(&replica, PipelineConfig::default());
        driver.init().unwrap();
        let view = driver.add_query("q", Format::list(), all_users).unwrap();
        let destroyed = Rc::new(Cell::new(false));
        let flag = destroyed.clone();
        view.set_on_destroy(move || flag.set(true));

        driver.destroy();
        assert!(destroyed.get());
        assert_eq!(replica.read_lock_count(), 0);
    }
}
