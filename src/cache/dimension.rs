//! Typed normalization caches. Each resolves a domain key to a surrogate
//! integer id, populating the backing dimension table on miss inside the
//! caller-supplied transaction (spec.md §4.2).
//!
//! All six caches share one shape: check the in-memory cache, fall back to a
//! `SELECT` on the natural key, `INSERT` on a further miss, memoize, return.
//! They differ only in the natural key and the table/columns involved, so the
//! shared step is factored into [`lookup_or_insert`].

use std::collections::HashMap;

use rusqlite::{OptionalExtension, Transaction};

use crate::error::{classify_store_error, Result, TraceHubError};
use crate::model::TraceKey;

use super::lru::{LruCache, DEFAULT_CAPACITY};

/// Coerce a row id read back from the store into a non-negative id, per
/// spec.md §4.2 step 4.
fn coerce_id(id: i64) -> Result<i64> {
    if id < 0 {
        Err(TraceHubError::CorruptStore(format!(
            "dimension id {id} is negative"
        )))
    } else {
        Ok(id)
    }
}

fn lookup_or_insert(
    tx: &Transaction<'_>,
    select_sql: &str,
    select_params: &[&dyn rusqlite::ToSql],
    insert_sql: &str,
    insert_params: &[&dyn rusqlite::ToSql],
) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(select_sql, select_params, |r| r.get(0))
        .optional()
        .map_err(classify_store_error)?;
    let id = match existing {
        Some(id) => id,
        None => {
            tx.execute(insert_sql, insert_params)
                .map_err(classify_store_error)?;
            tx.last_insert_rowid()
        }
    };
    coerce_id(id)
}

/// Path cache. Key: path string.
#[derive(Default)]
pub struct PathCache {
    cache: Option<LruCache<String, i64>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self {
            cache: Some(LruCache::new(DEFAULT_CAPACITY)),
        }
    }

    pub fn store(&mut self, tx: &Transaction<'_>, path: &str) -> Result<i64> {
        let cache = self.cache.get_or_insert_with(|| LruCache::new(DEFAULT_CAPACITY));
        if let Some(id) = cache.fetch(path) {
            return Ok(*id);
        }
        let id = lookup_or_insert(
            tx,
            "SELECT id FROM path_name WHERE name = ?1",
            &[&path],
            "INSERT INTO path_name (name) VALUES (?1)",
            &[&path],
        )?;
        cache.insert(path.to_string(), id);
        Ok(id)
    }

    pub fn clear(&mut self) {
        if let Some(c) = self.cache.as_mut() {
            c.clear();
        }
    }
}

/// Function name cache. Key: function name.
#[derive(Default)]
pub struct FunctionCache {
    cache: Option<LruCache<String, i64>>,
}

impl FunctionCache {
    pub fn new() -> Self {
        Self {
            cache: Some(LruCache::new(DEFAULT_CAPACITY)),
        }
    }

    pub fn store(&mut self, tx: &Transaction<'_>, name: &str) -> Result<i64> {
        let cache = self.cache.get_or_insert_with(|| LruCache::new(DEFAULT_CAPACITY));
        if let Some(id) = cache.fetch(name) {
            return Ok(*id);
        }
        let id = lookup_or_insert(
            tx,
            "SELECT id FROM function_name WHERE name = ?1",
            &[&name],
            "INSERT INTO function_name (name) VALUES (?1)",
            &[&name],
        )?;
        cache.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn clear(&mut self) {
        if let Some(c) = self.cache.as_mut() {
            c.clear();
        }
    }
}

/// Group (trace point group) cache. Unbounded: groups are few, per spec.md §4.2.
#[derive(Default)]
pub struct GroupCache {
    map: HashMap<String, i64>,
}

impl GroupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, tx: &Transaction<'_>, name: &str) -> Result<i64> {
        if let Some(id) = self.map.get(name) {
            return Ok(*id);
        }
        let id = lookup_or_insert(
            tx,
            "SELECT id FROM trace_point_group WHERE name = ?1",
            &[&name],
            "INSERT INTO trace_point_group (name) VALUES (?1)",
            &[&name],
        )?;
        self.map.insert(name.to_string(), id);
        Ok(id)
    }

    /// Pre-register every producer-declared trace key (enabled or not, per
    /// spec.md §4.2) ahead of resolving the entry's own group.
    pub fn register_declared(
        &mut self,
        tx: &Transaction<'_>,
        declared: &[TraceKey],
        entry_group: Option<&str>,
    ) -> Result<()> {
        for key in declared {
            if !self.map.contains_key(&key.name) {
                self.store(tx, &key.name)?;
            }
        }
        if let Some(group) = entry_group {
            if !self.map.contains_key(group) {
                self.store(tx, group)?;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Process cache. Key: `(name, pid, start_time)`; the SQL lookup selects on
/// `(pid, start_time)` only — see spec.md §4.2 and §9's note on the source's
/// latent `(name, pid)` inconsistency, resolved here by using the full triple
/// consistently in memory.
#[derive(Default)]
pub struct ProcessCache {
    cache: Option<LruCache<(String, u32, i64), i64>>,
}

impl ProcessCache {
    pub fn new() -> Self {
        Self {
            cache: Some(LruCache::new(DEFAULT_CAPACITY)),
        }
    }

    pub fn store(
        &mut self,
        tx: &Transaction<'_>,
        name: &str,
        pid: u32,
        start_time: i64,
    ) -> Result<i64> {
        let key = (name.to_string(), pid, start_time);
        let cache = self.cache.get_or_insert_with(|| LruCache::new(DEFAULT_CAPACITY));
        if let Some(id) = cache.fetch(&key) {
            return Ok(*id);
        }
        let id = lookup_or_insert(
            tx,
            "SELECT id FROM process WHERE pid = ?1 AND start_time = ?2",
            &[&pid, &start_time],
            "INSERT INTO process (name, pid, start_time) VALUES (?1, ?2, ?3)",
            &[&name, &pid, &start_time],
        )?;
        cache.insert(key, id);
        Ok(id)
    }

    pub fn clear(&mut self) {
        if let Some(c) = self.cache.as_mut() {
            c.clear();
        }
    }
}

/// Thread cache. Key: `(process_id, tid)`.
#[derive(Default)]
pub struct ThreadCache {
    cache: Option<LruCache<(i64, u32), i64>>,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            cache: Some(LruCache::new(DEFAULT_CAPACITY)),
        }
    }

    pub fn store(&mut self, tx: &Transaction<'_>, process_id: i64, tid: u32) -> Result<i64> {
        let key = (process_id, tid);
        let cache = self.cache.get_or_insert_with(|| LruCache::new(DEFAULT_CAPACITY));
        if let Some(id) = cache.fetch(&key) {
            return Ok(*id);
        }
        let id = lookup_or_insert(
            tx,
            "SELECT id FROM traced_thread WHERE process_id = ?1 AND tid = ?2",
            &[&process_id, &tid],
            "INSERT INTO traced_thread (process_id, tid) VALUES (?1, ?2)",
            &[&process_id, &tid],
        )?;
        cache.insert(key, id);
        Ok(id)
    }

    pub fn clear(&mut self) {
        if let Some(c) = self.cache.as_mut() {
            c.clear();
        }
    }
}

/// Trace point cache. Key: the 5-tuple `(type, path_id, line, function_id, group_id)`.
#[derive(Default)]
pub struct TracePointCache {
    cache: Option<LruCache<(u32, i64, u32, i64, Option<i64>), i64>>,
}

impl TracePointCache {
    pub fn new() -> Self {
        Self {
            cache: Some(LruCache::new(DEFAULT_CAPACITY)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        tx: &Transaction<'_>,
        entry_type: u32,
        path_id: i64,
        line: u32,
        function_id: i64,
        group_id: Option<i64>,
    ) -> Result<i64> {
        let key = (entry_type, path_id, line, function_id, group_id);
        let cache = self.cache.get_or_insert_with(|| LruCache::new(DEFAULT_CAPACITY));
        if let Some(id) = cache.fetch(&key) {
            return Ok(*id);
        }
        let id = if let Some(group_id) = group_id {
            lookup_or_insert(
                tx,
                "SELECT id FROM trace_point WHERE type = ?1 AND path_id = ?2 AND line = ?3 \
                 AND function_id = ?4 AND group_id = ?5",
                &[&entry_type, &path_id, &line, &function_id, &group_id],
                "INSERT INTO trace_point (type, path_id, line, function_id, group_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                &[&entry_type, &path_id, &line, &function_id, &group_id],
            )?
        } else {
            lookup_or_insert(
                tx,
                "SELECT id FROM trace_point WHERE type = ?1 AND path_id = ?2 AND line = ?3 \
                 AND function_id = ?4 AND group_id IS NULL",
                &[&entry_type, &path_id, &line, &function_id],
                "INSERT INTO trace_point (type, path_id, line, function_id, group_id) \
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                &[&entry_type, &path_id, &line, &function_id],
            )?
        };
        cache.insert(key, id);
        Ok(id)
    }

    pub fn clear(&mut self) {
        if let Some(c) = self.cache.as_mut() {
            c.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn path_cache_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut cache = PathCache::new();
        let tx = store.transaction().unwrap();
        let id1 = cache.store(&tx, "/a/b.cpp").unwrap();
        let id2 = cache.store(&tx, "/a/b.cpp").unwrap();
        assert_eq!(id1, id2);
        tx.commit().unwrap();
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM path_name", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn process_cache_keys_on_pid_and_start_time_in_sql() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut cache = ProcessCache::new();
        let tx = store.transaction().unwrap();
        let id1 = cache.store(&tx, "proc-a", 100, 1000).unwrap();
        // Same (pid, start_time) but a different cached name: the in-memory
        // cache key includes name (a cache miss), but the SQL lookup still
        // finds the existing row by (pid, start_time) alone.
        let id2 = cache.store(&tx, "proc-b", 100, 1000).unwrap();
        assert_eq!(id1, id2);
        tx.commit().unwrap();
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM process", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn group_cache_registers_declared_keys_even_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut cache = GroupCache::new();
        let tx = store.transaction().unwrap();
        let declared = vec![
            TraceKey {
                name: "verbose".into(),
                enabled: false,
            },
            TraceKey {
                name: "perf".into(),
                enabled: true,
            },
        ];
        cache.register_declared(&tx, &declared, Some("runtime")).unwrap();
        tx.commit().unwrap();
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM trace_point_group", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }
}
