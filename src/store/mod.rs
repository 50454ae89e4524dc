//! Schema & transaction layer: opens or creates the store, executes
//! statements inside transactions, and distinguishes the storage-full
//! condition from other failures.

pub mod schema;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::debug;

use crate::error::{classify_store_error, Result};

/// SQLite's page-count ceiling used as the "unlimited" sentinel, taken
/// verbatim from the original implementation (`2^30 - 1`).
pub const UNLIMITED_MAX_PAGE_COUNT: u64 = 1_073_741_823;

/// A single-file, paged, transactional relational store.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open the store at `path`, creating it (and applying the fixed schema)
    /// if it does not already exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(classify_store_error)?;
        conn.execute_batch(schema::CREATE_SCHEMA)
            .map_err(classify_store_error)?;
        // Ingestion throughput matters more than surviving a power loss mid-write;
        // the original sets this on every connection for the same reason.
        conn.execute_batch("PRAGMA synchronous=OFF;")
            .map_err(classify_store_error)?;
        debug!(path = %path.display(), "opened store");
        Ok(Self { conn, path })
    }

    /// Create a fresh store at `path` with the identical schema, used by the
    /// archiver. Fails if a file already exists at `path`.
    pub fn create_fresh(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(classify_store_error(rusqlite::Error::InvalidPath(
                path.to_path_buf(),
            )));
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Begin a transaction against the live connection.
    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>> {
        self.conn.transaction().map_err(classify_store_error)
    }

    pub fn page_size(&self) -> Result<u64> {
        self.conn
            .query_row("PRAGMA page_size;", [], |r| r.get::<_, i64>(0))
            .map(|v| v as u64)
            .map_err(classify_store_error)
    }

    pub fn page_count(&self) -> Result<u64> {
        self.conn
            .query_row("PRAGMA page_count;", [], |r| r.get::<_, i64>(0))
            .map(|v| v as u64)
            .map_err(classify_store_error)
    }

    /// Set the page-count ceiling. `max_pages` is never allowed to shrink
    /// below current occupancy by callers (see `apply_storage_configuration`).
    pub fn set_max_page_count(&self, max_pages: u64) -> Result<()> {
        self.conn
            .execute_batch(&format!("PRAGMA max_page_count={max_pages};"))
            .map_err(classify_store_error)
    }

    pub fn count_trace_entries(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM trace_entry;", [], |r| {
                r.get::<_, i64>(0)
            })
            .map(|v| v as u64)
            .map_err(classify_store_error)
    }
}
