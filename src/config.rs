//! Process configuration, parsed from the command line.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::model::{MaxSize, StorageConfiguration};

/// Central collector for producer trace entries.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Path to the live store. Created with the fixed schema if it does not
    /// already exist.
    #[arg(long, default_value = "trace.db")]
    pub store_path: PathBuf,

    /// Port producers connect to. Bound on all interfaces.
    #[arg(long, default_value_t = 7464)]
    pub producer_port: u16,

    /// Port GUI clients connect to. Bound to localhost only.
    #[arg(long, default_value_t = 7465)]
    pub gui_port: u16,

    /// Directory archive databases are written into, relative to the
    /// current working directory unless absolute.
    #[arg(long, default_value = "archive")]
    pub archive_dir: String,

    /// Percentage of oldest entries migrated to an archive on a storage-full
    /// event.
    #[arg(long, default_value_t = 10)]
    pub shrink_by: u8,

    /// Maximum store size in bytes. Omit for unlimited.
    #[arg(long)]
    pub max_size_bytes: Option<u64>,

    /// Log verbosity filter, in `tracing_subscriber::EnvFilter` syntax.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn producer_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.producer_port)
    }

    pub fn gui_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.gui_port)
    }

    pub fn initial_storage_configuration(&self) -> StorageConfiguration {
        StorageConfiguration {
            max_size: self.max_size_bytes.map(MaxSize::Bytes).unwrap_or(MaxSize::Unlimited),
            shrink_by: self.shrink_by,
            archive_dir: self.archive_dir.clone(),
        }
        .clamped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gui_addr_is_loopback_only() {
        let cfg = Config::parse_from(["tracehub"]);
        assert!(cfg.gui_addr().ip().is_loopback());
    }

    #[test]
    fn producer_addr_is_unspecified() {
        let cfg = Config::parse_from(["tracehub"]);
        assert_eq!(cfg.producer_addr().ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn unlimited_by_default() {
        let cfg = Config::parse_from(["tracehub"]);
        assert_eq!(cfg.initial_storage_configuration().max_size, MaxSize::Unlimited);
    }
}
