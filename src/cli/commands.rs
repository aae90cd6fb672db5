//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - worker: run delivery workers and the scheduler until Ctrl-C
//! - enqueue: push one message onto a backlog
//! - depth: show backlog lengths

use clap::{Parser, Subcommand};
use signal_courier::queue::Priority;
use std::path::PathBuf;

/// signal-courier - rate-limited market-signal delivery
#[derive(Parser, Debug)]
#[command(name = "signal-courier")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run delivery workers and the scheduler until Ctrl-C
    Worker {
        /// Number of workers (overrides delivery.workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Enqueue a message for delivery
    Enqueue {
        /// Recipient chat ID
        #[arg(long)]
        chat_id: String,

        /// Message text
        #[arg(short, long)]
        text: String,

        /// Backlog tier (high, normal, low)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Reply markup as JSON
        #[arg(short, long)]
        keyboard: Option<String>,
    },

    /// Show backlog lengths
    Depth,
}
