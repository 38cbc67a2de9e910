use crate::types::StorageMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// TeamCache deploy - provision cache storage and activate a TeamCache node
#[derive(Parser)]
#[command(name = "teamcache-deploy")]
#[command(about = "Provisions storage and activates a TeamCache (Varnish Enterprise + MSE4) node")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Read-only queries (lsblk, blkid, systemctl status) still run so the
    /// preview reflects the host. Formatting, mounting, fstab edits, file
    /// writes and service activation are skipped and logged.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Also write the log to this file (no ANSI colors)
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Unmount selected devices that are mounted outside the managed root
    #[arg(long, global = true)]
    pub unmount_foreign: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision storage, generate configuration and start the service
    Deploy {
        /// Path to the key=value configuration file
        #[arg(short, long, default_value = ".env")]
        env_file: PathBuf,
    },
    /// Check a configuration file and the host environment
    Validate {
        #[arg(short, long, default_value = ".env")]
        env_file: PathBuf,
    },
    /// List storage that would qualify for the cache
    Discover {
        #[arg(long, default_value_t = StorageMode::RawDevice)]
        storage_mode: StorageMode,

        /// Directories to check in filepath mode (comma-separated)
        #[arg(long, value_delimiter = ',')]
        paths: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the storage layout and generated files without changing anything
    Plan {
        #[arg(short, long, default_value = ".env")]
        env_file: PathBuf,
    },
    /// Poll the service until it is active and probe its endpoint
    Status {
        /// Port probed after the service is active
        #[arg(short, long, default_value_t = crate::config_file::DEFAULT_VARNISH_PORT)]
        port: u16,

        /// Maximum number of status checks
        #[arg(short, long, default_value_t = crate::activation::DEFAULT_MAX_ATTEMPTS)]
        attempts: u32,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
