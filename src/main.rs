//! Entry point: parses configuration, opens the live store, and runs the
//! store worker alongside the producer and GUI listeners until shutdown.

mod archiver;
mod cache;
mod config;
mod error;
mod ingest;
mod model;
mod parser;
mod server;
mod store;
mod wire;
mod worker;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use ingest::IngestionContext;
use store::Store;
use worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(
        store_path = %config.store_path.display(),
        producer_addr = %config.producer_addr(),
        gui_addr = %config.gui_addr(),
        "starting tracehub"
    );

    let store = Store::open(&config.store_path)?;
    let mut ctx = IngestionContext::new(store);
    ctx.apply_storage_configuration(config.initial_storage_configuration())?;

    let (worker, handle) = Worker::new(ctx);
    let worker_task = tokio::spawn(worker.run());

    let result = server::run(&config, handle).await;
    if let Err(e) = &result {
        error!(error = %e, "listener task exited with an error");
    }
    worker_task.abort();
    result.map_err(Into::into)
}
