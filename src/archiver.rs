//! Archival and bounded-size control: migrates the oldest percentage of
//! entries into a new rotating archive database, prunes now-orphaned
//! dimension rows in dependency order, and unconditional database nuke.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::params;
use tracing::{info, info_span};

use crate::error::{classify_store_error, Result, TraceHubError};
use crate::ingest::IngestionContext;
use crate::model::{EntryType, StackFrame, TraceEntry, Variable, VariableType};
use crate::store::Store;

/// Outcome of a successful archival pass.
pub struct ArchivalReport {
    pub archive_path: PathBuf,
    pub entries_archived: u64,
}

/// Scan `dir` for files matching `*-<basename>` and pick the next numbered
/// filename, exactly as spec.md §4.5 step 4 describes.
fn next_archive_path(dir: &Path, live_db_basename: &str) -> PathBuf {
    let suffix = format!("-{live_db_basename}");
    let count = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .ends_with(suffix.as_str())
                })
                .count()
        })
        .unwrap_or(0);
    dir.join(format!("{}{}", count + 1, suffix))
}

fn load_full_entry(conn: &rusqlite::Connection, entry_id: i64) -> Result<TraceEntry> {
    let (timestamp, stack_position, entry_type, line, path, function, group, process_name, pid, start_time, tid): (
        i64,
        i64,
        u32,
        u32,
        String,
        String,
        Option<String>,
        String,
        u32,
        i64,
        u32,
    ) = conn
        .query_row(
            "SELECT te.timestamp, te.stack_position, tp.type, tp.line, pn.name, fnm.name, gr.name, \
                    pr.name, pr.pid, pr.start_time, th.tid \
             FROM trace_entry te \
             JOIN trace_point tp ON te.trace_point_id = tp.id \
             JOIN path_name pn ON tp.path_id = pn.id \
             JOIN function_name fnm ON tp.function_id = fnm.id \
             LEFT JOIN trace_point_group gr ON tp.group_id = gr.id \
             JOIN traced_thread th ON te.traced_thread_id = th.id \
             JOIN process pr ON th.process_id = pr.id \
             WHERE te.id = ?1",
            params![entry_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                ))
            },
        )
        .map_err(classify_store_error)?;

    // The message lives directly on trace_entry, fetched separately to keep the
    // join above narrow.
    let message: String = conn
        .query_row(
            "SELECT message FROM trace_entry WHERE id = ?1",
            params![entry_id],
            |r| r.get(0),
        )
        .map_err(classify_store_error)?;

    let mut variable_stmt = conn
        .prepare("SELECT name, value, type FROM variable WHERE trace_entry_id = ?1 ORDER BY rowid")
        .map_err(classify_store_error)?;
    let variables = variable_stmt
        .query_map(params![entry_id], |r| {
            let name: String = r.get(0)?;
            let value: String = r.get(1)?;
            let ty: String = r.get(2)?;
            Ok((name, value, ty))
        })
        .map_err(classify_store_error)?
        .map(|row| {
            let (name, value, ty) = row.map_err(classify_store_error)?;
            let var_type = VariableType::parse(&ty).ok_or_else(|| {
                TraceHubError::CorruptStore(format!("unknown variable type {ty}"))
            })?;
            Ok(Variable {
                name,
                var_type,
                value,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut frame_stmt = conn
        .prepare(
            "SELECT module, function, function_offset, source_file, line_number \
             FROM stackframe WHERE trace_entry_id = ?1 ORDER BY depth",
        )
        .map_err(classify_store_error)?;
    let backtrace = frame_stmt
        .query_map(params![entry_id], |r| {
            Ok(StackFrame {
                module: r.get(0)?,
                function: r.get(1)?,
                function_offset: r.get::<_, i64>(2)? as u64,
                source_file: r.get(3)?,
                line_number: r.get(4)?,
            })
        })
        .map_err(classify_store_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(classify_store_error)?;

    let entry_type = EntryType::from_ordinal(entry_type)
        .ok_or_else(|| TraceHubError::CorruptStore(format!("unknown entry type {entry_type}")))?;

    Ok(TraceEntry {
        pid,
        process_start_time: start_time,
        tid,
        timestamp,
        entry_type,
        path,
        line,
        function,
        process_name,
        group,
        message,
        stack_position: stack_position as u64,
        variables,
        backtrace,
        trace_keys: Vec::new(),
    })
}

/// Archive the oldest `percentage`% of `trace_entry` rows from `ctx`'s live
/// store into a freshly created database under `archive_dir`, then prune the
/// migrated rows (and now-orphaned dimension rows) from the live store.
///
/// Returns `None` if `percentage == 0` (a no-op per spec.md §4.5 step 1).
pub fn archive_entries(
    ctx: &mut IngestionContext,
    percentage: u8,
    archive_dir: &str,
) -> Result<Option<ArchivalReport>> {
    let span = info_span!("archive_entries", percentage);
    let _g = span.enter();

    if percentage == 0 {
        return Ok(None);
    }

    let total = ctx.store().count_trace_entries()?;
    let n = ((total as f64) * (percentage as f64) / 100.0).round() as u64;
    if n == 0 {
        return Ok(None);
    }

    let archive_dir_path = Path::new(archive_dir);
    fs::create_dir_all(archive_dir_path).map_err(|e| {
        TraceHubError::ArchiveCreationFailed(format!(
            "failed to create archive directory {}: {e}",
            archive_dir_path.display()
        ))
    })?;

    let live_basename = ctx
        .store()
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "live.db".to_string());
    let archive_path = next_archive_path(archive_dir_path, &live_basename);

    let archive_store = Store::create_fresh(&archive_path).map_err(|e| {
        TraceHubError::ArchiveCreationFailed(format!(
            "failed to create archive database {}: {e}",
            archive_path.display()
        ))
    })?;
    let mut archive_ctx = IngestionContext::new(archive_store);

    let ids: Vec<i64> = {
        let conn = ctx.store().connection();
        let mut stmt = conn
            .prepare("SELECT id FROM trace_entry ORDER BY id ASC LIMIT ?1")
            .map_err(classify_store_error)?;
        let rows = stmt
            .query_map(params![n as i64], |r| r.get(0))
            .map_err(classify_store_error)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(classify_store_error)?;
        rows
    };

    for id in &ids {
        let entry = load_full_entry(ctx.store().connection(), *id)?;
        archive_ctx.persist_entry_transactional(&entry)?;
    }
    // The archive store's connection is dropped here, releasing the file.
    drop(archive_ctx);

    prune_archived_rows(ctx, n)?;

    info!(
        archived = ids.len(),
        path = %archive_path.display(),
        "archival complete"
    );

    Ok(Some(ArchivalReport {
        archive_path,
        entries_archived: ids.len() as u64,
    }))
}

/// Prune order matters: each later delete depends on the absence of earlier
/// dependents. See spec.md §4.5 step 8.
fn prune_archived_rows(ctx: &mut IngestionContext, n: u64) -> Result<()> {
    {
        let tx = ctx.store_mut().transaction()?;
        tx.execute(
            "DELETE FROM trace_entry WHERE id IN (SELECT id FROM trace_entry ORDER BY id LIMIT ?1)",
            params![n as i64],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM trace_point WHERE id NOT IN (SELECT trace_point_id FROM trace_entry)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM function_name WHERE id NOT IN (SELECT function_id FROM trace_point)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM path_name WHERE id NOT IN (SELECT path_id FROM trace_point)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM trace_point_group WHERE id NOT IN (SELECT group_id FROM trace_point)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM traced_thread WHERE id NOT IN (SELECT traced_thread_id FROM trace_entry)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM process WHERE id NOT IN (SELECT process_id FROM traced_thread)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM variable WHERE trace_entry_id NOT IN (SELECT id FROM trace_entry)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.execute(
            "DELETE FROM stackframe WHERE trace_entry_id NOT IN (SELECT id FROM trace_entry)",
            [],
        )
        .map_err(classify_store_error)?;
        tx.commit().map_err(classify_store_error)?;
    }
    ctx.invalidate_trace_points();
    ctx.invalidate_functions();
    ctx.invalidate_paths();
    ctx.invalidate_groups();
    ctx.invalidate_threads();
    ctx.invalidate_processes();
    Ok(())
}

/// Unconditionally delete all rows from all tables and clear every cache.
/// Bypasses the archiver entirely.
pub fn nuke_database(ctx: &mut IngestionContext) -> Result<()> {
    {
        let tx = ctx.store_mut().transaction()?;
        for table in [
            "variable",
            "stackframe",
            "trace_entry",
            "trace_point",
            "traced_thread",
            "process",
            "function_name",
            "path_name",
            "trace_point_group",
        ] {
            tx.execute(&format!("DELETE FROM {table}"), [])
                .map_err(classify_store_error)?;
        }
        tx.commit().map_err(classify_store_error)?;
    }
    ctx.clear_caches();
    info!("database nuked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryType, TraceEntry};

    fn entry(tid: u32, line: u32) -> TraceEntry {
        TraceEntry {
            pid: 1,
            process_start_time: 0,
            tid,
            timestamp: line as i64,
            entry_type: EntryType::Log,
            path: "/p.cpp".into(),
            line,
            function: "f".into(),
            process_name: "proc".into(),
            group: None,
            message: "m".into(),
            stack_position: 0,
            variables: vec![],
            backtrace: vec![],
            trace_keys: vec![],
        }
    }

    #[test]
    fn archive_conserves_total_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("live.db")).unwrap();
        let mut ctx = IngestionContext::new(store);
        for i in 0..10 {
            ctx.persist_entry_transactional(&entry(1, i)).unwrap();
        }
        let archive_dir = dir.path().join("archive");
        let report = archive_entries(&mut ctx, 50, archive_dir.to_str().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(report.entries_archived, 5);
        assert_eq!(ctx.store().count_trace_entries().unwrap(), 5);

        let archived_store = Store::open(&report.archive_path).unwrap();
        assert_eq!(archived_store.count_trace_entries().unwrap(), 5);
    }

    #[test]
    fn zero_percent_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("live.db")).unwrap();
        let mut ctx = IngestionContext::new(store);
        ctx.persist_entry_transactional(&entry(1, 0)).unwrap();
        let archive_dir = dir.path().join("archive");
        let report = archive_entries(&mut ctx, 0, archive_dir.to_str().unwrap()).unwrap();
        assert!(report.is_none());
        assert_eq!(ctx.store().count_trace_entries().unwrap(), 1);
    }

    #[test]
    fn nuke_empties_every_table_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("live.db")).unwrap();
        let mut ctx = IngestionContext::new(store);
        ctx.persist_entry_transactional(&entry(1, 0)).unwrap();
        nuke_database(&mut ctx).unwrap();
        assert_eq!(ctx.store().count_trace_entries().unwrap(), 0);
        let conn = ctx.store().connection();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM process", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
