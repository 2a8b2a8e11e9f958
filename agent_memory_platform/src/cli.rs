//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Agent Memory Platform CLI
#[derive(Parser)]
#[command(name = "amp-cli")]
#[command(about = "Tiered agent memory with resilient multi-agent orchestration")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to; defaults to server.host:server.port
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run a batch of tasks from a TOML file
    Run {
        /// Path to the batch file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Store a text memory and print its id
    Remember {
        text: String,
        /// Pin the item in the process-local tier
        #[arg(long)]
        hot: bool,
    },
    /// Recall memories similar to a query
    Recall {
        #[arg(short, long)]
        query: String,
        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
    },
    /// Print circuit state for every known agent
    Circuits,
}
