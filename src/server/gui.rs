//! GUI connection handling: one task per socket, each owning a send queue
//! fed by the store worker's broadcasts and an inbound control-datagram
//! decoder (spec.md §4.6).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::Result;
use crate::wire::{self, ClientDatagram};
use crate::worker::WorkerHandle;

pub async fn listen(listener: TcpListener, worker: WorkerHandle) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!(%addr, "gui connected");
                let worker = worker.clone();
                tokio::spawn(async move {
                    handle_connection(socket, worker).await;
                    debug!(%addr, "gui disconnected");
                });
            }
            Err(e) => warn!(error = %e, "failed to accept gui connection"),
        }
    }
}

async fn handle_connection(socket: TcpStream, worker: WorkerHandle) {
    let registration = worker.register_gui();
    let id = registration.id;
    let mut receiver = registration.receiver;
    let (mut read_half, mut write_half) = socket.into_split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = read_control_datagrams(&mut read_half, &worker).await {
        debug!(error = %e, "gui control channel closed");
    }

    writer.abort();
    worker.unregister_gui(id);
}

async fn read_control_datagrams(socket: &mut OwnedReadHalf, worker: &WorkerHandle) -> Result<()> {
    loop {
        let mut header = [0u8; 2];
        socket.read_exact(&mut header).await?;
        let payload_size = wire::decode_payload_size(&header);

        let mut body = vec![0u8; payload_size as usize];
        socket.read_exact(&mut body).await?;

        match wire::decode_client_body(&body) {
            Ok(ClientDatagram::DatabaseNuke) => worker.nuke(),
            Err(e) => return Err(e),
        }
    }
}
