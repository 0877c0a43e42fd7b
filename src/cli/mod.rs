//! CLI module for dualcam
//!
//! Provides command-line interface for:
//! - serve: recover, start maintenance and serve the command plane
//! - status: print persisted token and session records
//! - reclaim: one stale-token reclaim pass
//! - client: send one command over the command plane

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{client, load_config, reclaim, run, run_command, serve, status};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
