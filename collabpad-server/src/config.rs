//! Command-line configuration surface.

use std::path::PathBuf;

use clap::Parser;

/// Collaborative text-editing coordination server.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Address to bind the listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the listener to.
    #[arg(long, default_value_t = 5055)]
    pub port: u16,

    /// TCP accept backlog.
    #[arg(long, default_value_t = 128)]
    pub backlog: u32,

    /// Directory holding per-document snapshot files.
    #[arg(long, default_value = "snapshots")]
    pub snapshot_dir: PathBuf,

    /// Directory holding per-document append-only oplogs.
    #[arg(long, default_value = "oplogs")]
    pub oplog_dir: PathBuf,

    /// Write a snapshot every N successfully applied edits (minimum 1).
    #[arg(long, default_value_t = 50)]
    pub snapshot_interval: u64,

    /// Evict a session after this many idle seconds; 0 disables the check.
    #[arg(long, default_value_t = 120)]
    pub heartbeat_timeout: u64,

    /// Default tracing filter directive, used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
