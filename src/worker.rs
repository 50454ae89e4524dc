//! The single store-worker task (spec.md §5): owns the [`IngestionContext`]
//! and the GUI registry, and is the only code that ever touches the live
//! store. Every producer and GUI connection talks to it through
//! [`WorkerHandle`], never the store directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::archiver::{self, ArchivalReport};
use crate::error::Result;
use crate::ingest::IngestionContext;
use crate::model::{ProcessShutdownEvent, StorageConfiguration, TraceEntry};
use crate::wire::{self, ServerDatagram};

enum Command {
    Ingest(TraceEntry),
    Shutdown(ProcessShutdownEvent),
    ApplyStorageConfiguration(StorageConfiguration),
    Nuke,
    RegisterGui {
        id: u64,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    },
    UnregisterGui {
        id: u64,
    },
}

/// A cheap, cloneable sender handle used by connection tasks to submit work
/// to the store worker without touching the store themselves.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Command>,
    next_gui_id: Arc<AtomicU64>,
}

/// Registration returned to a GUI connection task: its handle id (used to
/// unregister on disconnect) and the receiving half of its send queue.
pub struct GuiRegistration {
    pub id: u64,
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl WorkerHandle {
    pub fn ingest(&self, entry: TraceEntry) {
        let _ = self.tx.send(Command::Ingest(entry));
    }

    pub fn shutdown_event(&self, event: ProcessShutdownEvent) {
        let _ = self.tx.send(Command::Shutdown(event));
    }

    pub fn apply_storage_configuration(&self, cfg: StorageConfiguration) {
        let _ = self.tx.send(Command::ApplyStorageConfiguration(cfg));
    }

    pub fn nuke(&self) {
        let _ = self.tx.send(Command::Nuke);
    }

    /// Register a new GUI connection's send queue and return its handle id,
    /// per spec.md §9's redesign note (GUIs are identified by an opaque
    /// handle, not a raw pointer).
    pub fn register_gui(&self) -> GuiRegistration {
        let id = self.next_gui_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = self.tx.send(Command::RegisterGui { id, sender });
        GuiRegistration { id, receiver }
    }

    pub fn unregister_gui(&self, id: u64) {
        let _ = self.tx.send(Command::UnregisterGui { id });
    }
}

/// Owns the store and the GUI registry. Runs until its command channel
/// closes (i.e. every `WorkerHandle` has been dropped).
pub struct Worker {
    ctx: IngestionContext,
    guis: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Worker {
    pub fn new(ctx: IngestionContext) -> (Worker, WorkerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            ctx,
            guis: HashMap::new(),
            rx,
        };
        let handle = WorkerHandle {
            tx,
            next_gui_id: Arc::new(AtomicU64::new(0)),
        };
        (worker, handle)
    }

    /// Drain commands until every handle has been dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            self.handle_command(cmd);
        }
        info!("store worker shutting down");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Ingest(entry) => self.handle_ingest(entry),
            Command::Shutdown(event) => {
                if let Err(e) = self.ctx.ingest_shutdown(&event) {
                    error!(error = %e, "failed to persist process shutdown event");
                }
                self.broadcast(&ServerDatagram::ProcessShutdownEvent(event));
            }
            Command::ApplyStorageConfiguration(cfg) => {
                if let Err(e) = self.ctx.apply_storage_configuration(cfg) {
                    error!(error = %e, "failed to apply storage configuration");
                }
            }
            Command::Nuke => {
                if let Err(e) = archiver::nuke_database(&mut self.ctx) {
                    error!(error = %e, "nuke failed");
                }
                self.broadcast(&ServerDatagram::DatabaseNukeFinished);
            }
            Command::RegisterGui { id, sender } => {
                let path = self.ctx.store().path().to_string_lossy().into_owned();
                match wire::encode(&ServerDatagram::TraceFileName(path)) {
                    Ok(frame) => {
                        let _ = sender.send(frame);
                    }
                    Err(e) => error!(error = %e, "failed to encode trace file name datagram"),
                }
                self.guis.insert(id, sender);
            }
            Command::UnregisterGui { id } => {
                self.guis.remove(&id);
            }
        }
    }

    /// Implements spec.md §4.4 step 6: on a storage-full commit failure,
    /// archive, notify every GUI, and retry exactly once.
    fn handle_ingest(&mut self, entry: TraceEntry) {
        match self.ctx.persist_entry_transactional(&entry) {
            Ok(_) => self.broadcast(&ServerDatagram::TraceEntry(entry)),
            Err(e) if e.is_store_full() => {
                warn!("store full, archiving before retry");
                if let Err(archive_err) = self.run_archival() {
                    error!(error = %archive_err, "archival failed, entry dropped");
                    return;
                }
                self.broadcast(&ServerDatagram::DatabaseNukeFinished);
                match self.ctx.persist_entry_transactional(&entry) {
                    Ok(_) => self.broadcast(&ServerDatagram::TraceEntry(entry)),
                    Err(retry_err) => {
                        error!(error = %retry_err, "entry dropped after retry");
                    }
                }
            }
            Err(e) => error!(error = %e, "entry dropped"),
        }
    }

    fn run_archival(&mut self) -> Result<Option<ArchivalReport>> {
        let shrink_by = self.ctx.config().shrink_by;
        let archive_dir = self.ctx.config().archive_dir.clone();
        archiver::archive_entries(&mut self.ctx, shrink_by, &archive_dir)
    }

    fn broadcast(&mut self, datagram: &ServerDatagram) {
        let frame = match wire::encode(datagram) {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "failed to encode broadcast datagram");
                return;
            }
        };
        self.guis.retain(|_, sender| sender.send(frame.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryType;
    use crate::store::Store;

    fn entry() -> TraceEntry {
        TraceEntry {
            pid: 1,
            process_start_time: 0,
            tid: 1,
            timestamp: 0,
            entry_type: EntryType::Log,
            path: "a".into(),
            line: 1,
            function: "f".into(),
            process_name: "p".into(),
            group: None,
            message: "m".into(),
            stack_position: 0,
            variables: vec![],
            backtrace: vec![],
            trace_keys: vec![],
        }
    }

    #[tokio::test]
    async fn ingest_broadcasts_to_registered_gui() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("live.db")).unwrap();
        let ctx = IngestionContext::new(store);
        let (worker, handle) = Worker::new(ctx);
        let join = tokio::spawn(worker.run());

        let mut gui = handle.register_gui();
        // First frame is always the trace file name.
        let _name_frame = gui.receiver.recv().await.unwrap();

        handle.ingest(entry());
        let frame = gui.receiver.recv().await.unwrap();
        assert!(!frame.is_empty());

        drop(handle);
        join.await.unwrap();
    }
}
