//! CLI argument definitions using clap
//!
//! Commands:
//! - dualcam serve --config <path>
//! - dualcam status --config <path>
//! - dualcam reclaim --config <path>
//! - dualcam client [--url <ws-url>] <action> [--params <json>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// dualcam - camera arbitration and recording lifecycle coordinator
#[derive(Parser, Debug)]
#[command(name = "dualcam")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Recover state, start maintenance and serve the command plane
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./dualcam.json")]
        config: PathBuf,

        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the persisted token and session records
    Status {
        /// Path to configuration file
        #[arg(long, default_value = "./dualcam.json")]
        config: PathBuf,
    },

    /// Run one stale-token reclaim pass
    Reclaim {
        /// Path to configuration file
        #[arg(long, default_value = "./dualcam.json")]
        config: PathBuf,
    },

    /// Send one command over the command plane and print its result
    Client {
        /// Remote action, e.g. recording.start or status.get
        action: String,

        /// Action params as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Command id; resending with the same id never re-executes
        #[arg(long)]
        id: Option<String>,

        /// WebSocket URL; defaults to the configured local server
        #[arg(long)]
        url: Option<String>,

        /// Path to configuration file, used for the URL and reconnect policy
        #[arg(long, default_value = "./dualcam.json")]
        config: PathBuf,

        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 15_000)]
        timeout_ms: u64,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
