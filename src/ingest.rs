//! Ingestion context: the caches and store together, and the per-record
//! persistence primitives used both by the live store worker (with retry and
//! broadcast layered on top, see [`crate::worker`]) and by the archiver when
//! copying entries into a freshly created archive store.

use rusqlite::{params, Transaction};
use tracing::debug;

use crate::cache::dimension::{
    FunctionCache, GroupCache, PathCache, ProcessCache, ThreadCache, TracePointCache,
};
use crate::error::{classify_store_error, Result};
use crate::model::{MaxSize, ProcessShutdownEvent, StorageConfiguration, TraceEntry};
use crate::store::{Store, UNLIMITED_MAX_PAGE_COUNT};

/// Default configuration assumed before any producer sends a
/// `<storageconfiguration>` element.
pub fn default_storage_configuration() -> StorageConfiguration {
    StorageConfiguration {
        max_size: MaxSize::Unlimited,
        shrink_by: 10,
        archive_dir: "archive".to_string(),
    }
}

/// The caches and store for one store instance (live or, during archival, the
/// archive-in-progress). Owned exclusively by one worker at a time — see
/// spec.md §5 and §9's `IngestionContext` redesign note.
pub struct IngestionContext {
    store: Store,
    paths: PathCache,
    functions: FunctionCache,
    processes: ProcessCache,
    threads: ThreadCache,
    trace_points: TracePointCache,
    groups: GroupCache,
    config: StorageConfiguration,
}

impl IngestionContext {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            paths: PathCache::new(),
            functions: FunctionCache::new(),
            processes: ProcessCache::new(),
            threads: ThreadCache::new(),
            trace_points: TracePointCache::new(),
            groups: GroupCache::new(),
            config: default_storage_configuration(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn config(&self) -> &StorageConfiguration {
        &self.config
    }

    /// Resolve every dimension id for `entry` through the caches and insert
    /// its `trace_entry`, `variable`, and `stackframe` rows, within `tx`.
    /// This is spec.md §4.4 steps 2–4; the caller owns begin/commit.
    fn persist_entry(
        groups: &mut GroupCache,
        paths: &mut PathCache,
        functions: &mut FunctionCache,
        processes: &mut ProcessCache,
        threads: &mut ThreadCache,
        trace_points: &mut TracePointCache,
        tx: &Transaction<'_>,
        entry: &TraceEntry,
    ) -> Result<i64> {
        // Register producer-declared trace keys before resolving the entry's own group,
        // per spec.md §4.2.
        groups.register_declared(tx, &entry.trace_keys, entry.group.as_deref())?;

        let path_id = paths.store(tx, &entry.path)?;
        let function_id = functions.store(tx, &entry.function)?;
        let process_id =
            processes.store(tx, &entry.process_name, entry.pid, entry.process_start_time)?;
        let thread_id = threads.store(tx, process_id, entry.tid)?;
        let group_id = match entry.group.as_deref() {
            Some(g) => Some(groups.store(tx, g)?),
            None => None,
        };
        let trace_point_id = trace_points.store(
            tx,
            entry.entry_type.ordinal(),
            path_id,
            entry.line,
            function_id,
            group_id,
        )?;

        tx.execute(
            "INSERT INTO trace_entry (traced_thread_id, timestamp, trace_point_id, message, stack_position) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread_id,
                entry.timestamp,
                trace_point_id,
                entry.message,
                entry.stack_position as i64
            ],
        )
        .map_err(classify_store_error)?;
        let entry_id = tx.last_insert_rowid();

        for v in &entry.variables {
            tx.execute(
                "INSERT INTO variable (trace_entry_id, name, value, type) VALUES (?1, ?2, ?3, ?4)",
                params![entry_id, v.name, v.value, v.var_type.as_str()],
            )
            .map_err(classify_store_error)?;
        }
        for (depth, frame) in entry.backtrace.iter().enumerate() {
            tx.execute(
                "INSERT INTO stackframe \
                 (trace_entry_id, depth, module, function, function_offset, source_file, line_number) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry_id,
                    depth as i64,
                    frame.module,
                    frame.function,
                    frame.function_offset as i64,
                    frame.source_file,
                    frame.line_number
                ],
            )
            .map_err(classify_store_error)?;
        }

        Ok(entry_id)
    }

    /// Persist one entry in its own transaction. No retry, no broadcast: the
    /// storage-full handling and fan-out live in [`crate::worker`], which is
    /// the only caller that owns a GUI registry and an archiver.
    pub fn persist_entry_transactional(&mut self, entry: &TraceEntry) -> Result<i64> {
        let tx = self.store.transaction()?;
        let id = Self::persist_entry(
            &mut self.groups,
            &mut self.paths,
            &mut self.functions,
            &mut self.processes,
            &mut self.threads,
            &mut self.trace_points,
            &tx,
            entry,
        )?;
        tx.commit().map_err(classify_store_error)?;
        Ok(id)
    }

    pub fn ingest_shutdown(&mut self, event: &ProcessShutdownEvent) -> Result<()> {
        let tx = self.store.transaction()?;
        tx.execute(
            "UPDATE process SET end_time = ?1 WHERE pid = ?2 AND start_time = ?3",
            params![event.stop_time, event.pid, event.start_time],
        )
        .map_err(classify_store_error)?;
        tx.commit().map_err(classify_store_error)?;
        Ok(())
    }

    /// Idempotent per spec.md §4.4: returns `false` (no store command issued)
    /// if every field already matches.
    pub fn apply_storage_configuration(&mut self, cfg: StorageConfiguration) -> Result<bool> {
        let cfg = cfg.clamped();
        if cfg == self.config {
            return Ok(false);
        }
        match cfg.max_size {
            MaxSize::Unlimited => self.store.set_max_page_count(UNLIMITED_MAX_PAGE_COUNT)?,
            MaxSize::Bytes(bytes) => {
                let page_size = self.store.page_size()?.max(1);
                let current_pages = self.store.page_count()?;
                let wanted_pages = bytes / page_size;
                // Never shrink below current occupancy.
                let max_pages = current_pages.max(wanted_pages);
                self.store.set_max_page_count(max_pages)?;
            }
        }
        debug!(shrink_by = cfg.shrink_by, archive_dir = %cfg.archive_dir, "applied storage configuration");
        self.config = cfg;
        Ok(true)
    }

    pub fn clear_caches(&mut self) {
        self.paths.clear();
        self.functions.clear();
        self.processes.clear();
        self.threads.clear();
        self.trace_points.clear();
        self.groups.clear();
    }

    pub fn invalidate_trace_points(&mut self) {
        self.trace_points.clear();
    }
    pub fn invalidate_functions(&mut self) {
        self.functions.clear();
    }
    pub fn invalidate_paths(&mut self) {
        self.paths.clear();
    }
    pub fn invalidate_groups(&mut self) {
        self.groups.clear();
    }
    pub fn invalidate_threads(&mut self) {
        self.threads.clear();
    }
    pub fn invalidate_processes(&mut self) {
        self.processes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryType, Variable, VariableType};

    fn sample_entry() -> TraceEntry {
        TraceEntry {
            pid: 100,
            process_start_time: 1000,
            tid: 7,
            timestamp: 2000,
            entry_type: EntryType::Debug,
            path: "/a/b.cpp".into(),
            line: 42,
            function: "f".into(),
            process_name: "p".into(),
            group: None,
            message: "hi".into(),
            stack_position: 1,
            variables: vec![],
            backtrace: vec![],
            trace_keys: vec![],
        }
    }

    #[test]
    fn single_entry_populates_expected_tables_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut ctx = IngestionContext::new(store);
        ctx.persist_entry_transactional(&sample_entry()).unwrap();

        let conn = ctx.store().connection();
        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count("process"), 1);
        assert_eq!(count("traced_thread"), 1);
        assert_eq!(count("path_name"), 1);
        assert_eq!(count("function_name"), 1);
        assert_eq!(count("trace_point"), 1);
        assert_eq!(count("trace_entry"), 1);
        assert_eq!(count("variable"), 0);
        assert_eq!(count("stackframe"), 0);
        assert_eq!(count("trace_point_group"), 0);
    }

    #[test]
    fn normalization_shares_trace_point_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut ctx = IngestionContext::new(store);
        let mut a = sample_entry();
        a.tid = 1;
        let mut b = sample_entry();
        b.tid = 2;
        ctx.persist_entry_transactional(&a).unwrap();
        ctx.persist_entry_transactional(&b).unwrap();

        let conn = ctx.store().connection();
        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count("trace_point"), 1);
        assert_eq!(count("path_name"), 1);
        assert_eq!(count("function_name"), 1);
        assert_eq!(count("process"), 1);
        assert_eq!(count("traced_thread"), 2);
        assert_eq!(count("trace_entry"), 2);
    }

    #[test]
    fn variables_and_backtrace_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut ctx = IngestionContext::new(store);
        let mut e = sample_entry();
        e.variables = vec![
            Variable {
                name: "x".into(),
                var_type: VariableType::String,
                value: "hi".into(),
            },
            Variable {
                name: "y".into(),
                var_type: VariableType::Number,
                value: "3".into(),
            },
        ];
        e.backtrace = (0..3)
            .map(|i| crate::model::StackFrame {
                module: format!("mod{i}"),
                function: format!("fn{i}"),
                function_offset: i,
                source_file: "f.cpp".into(),
                line_number: i as u32,
            })
            .collect();
        let id = ctx.persist_entry_transactional(&e).unwrap();

        let conn = ctx.store().connection();
        let var_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM variable", [], |r| r.get(0))
            .unwrap();
        assert_eq!(var_count, 2);

        let mut stmt = conn
            .prepare("SELECT depth FROM stackframe WHERE trace_entry_id = ?1 ORDER BY depth")
            .unwrap();
        let depths: Vec<i64> = stmt
            .query_map([id], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(depths, vec![0, 1, 2]);
    }

    #[test]
    fn apply_storage_configuration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut ctx = IngestionContext::new(store);
        let cfg = StorageConfiguration {
            max_size: MaxSize::Bytes(1_000_000),
            shrink_by: 50,
            archive_dir: "/a".into(),
        };
        assert!(ctx.apply_storage_configuration(cfg.clone()).unwrap());
        assert!(!ctx.apply_storage_configuration(cfg).unwrap());
    }
}
