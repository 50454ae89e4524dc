//! Producer connection handling: one task per socket, each owning its own
//! parser buffer (spec.md §4.6).

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::model::ParsedRecord;
use crate::parser::StreamingParser;
use crate::worker::WorkerHandle;

const READ_CHUNK: usize = 8192;

pub async fn listen(listener: TcpListener, worker: WorkerHandle) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!(%addr, "producer connected");
                let worker = worker.clone();
                tokio::spawn(async move {
                    handle_connection(socket, worker).await;
                    debug!(%addr, "producer disconnected");
                });
            }
            Err(e) => warn!(error = %e, "failed to accept producer connection"),
        }
    }
}

async fn handle_connection(mut socket: TcpStream, worker: WorkerHandle) {
    let mut parser = StreamingParser::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) => return, // EOF: any partial entry in the buffer is discarded.
            Ok(n) => n,
            Err(e) => {
                info!(error = %e, "producer connection read error");
                return;
            }
        };
        parser.feed(&buf[..n]);
        while let Some(record) = parser.next_record() {
            dispatch(&worker, record);
        }
    }
}

fn dispatch(worker: &WorkerHandle, record: ParsedRecord) {
    match record {
        ParsedRecord::Entry(entry) => worker.ingest(entry),
        ParsedRecord::Shutdown(event) => worker.shutdown_event(event),
        ParsedRecord::StorageConfig(cfg) => worker.apply_storage_configuration(cfg),
    }
}
