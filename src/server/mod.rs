//! The two listening sockets (spec.md §4.6): producer ingestion on
//! `0.0.0.0:<producer_port>` and GUI fan-out/control on
//! `localhost:<gui_port>`.

mod gui;
mod producer;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::Result;
use crate::worker::WorkerHandle;

/// Bind both listeners and run them to completion (i.e. forever, barring a
/// bind failure). Each accepted connection is handed its own task. The
/// startup diagnostic naming both addresses is logged once by the caller
/// before binding.
pub async fn run(config: &Config, worker: WorkerHandle) -> Result<()> {
    let producer_listener = TcpListener::bind(config.producer_addr()).await?;
    let gui_listener = TcpListener::bind(config.gui_addr()).await?;

    tokio::join!(
        producer::listen(producer_listener, worker.clone()),
        gui::listen(gui_listener, worker),
    );
    Ok(())
}
