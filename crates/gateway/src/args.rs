//! Command-line argument parsing
//!
//! Options given on the command line override the matching settings from the
//! configuration file.

use clap::{Parser, Subcommand};
use gateway_event_loop::Backend;
use std::path::PathBuf;

/// Which process role to run.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Accept clients and relay their frames to workers
    #[default]
    Gateway,
    /// Link to every registered Gateway and run the chat application
    Worker,
}

/// Command-line arguments of the gateway binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// If the file doesn't exist, a default configuration is written there.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Client listen address
    ///
    /// Overrides `gateway.listen`. Format: "IP:PORT".
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Event loop backend (poll or task)
    #[arg(short, long)]
    pub backend: Option<Backend>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub role: Role,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            listen: None,
            backend: None,
            debug: false,
            json_logs: false,
            role: Role::Gateway,
        }
    }
}
