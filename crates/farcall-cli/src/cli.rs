//! Clap CLI definitions for farcall.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// farcall: call into objects living on the other side of a message channel.
#[derive(Parser)]
#[command(name = "farcall", version)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Expose a sample object graph in-process and drive it through a remote handle.
    Demo,
    /// Print the effective configuration as TOML.
    Config,
}
