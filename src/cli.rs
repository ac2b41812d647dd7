use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "workspace-host")]
#[command(version)]
#[command(about = "Run and supervise per-user workspace containers on this host")]
pub struct Cli {
    /// Config file path (defaults to workspace-host.yaml in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the host: recover, supervise, and serve control requests on stdin/stdout
    Serve,

    /// Show the registry
    Status {
        /// Only this workspace
        workspace: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the state transitions of one workspace
    History {
        workspace: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reconcile the registry with the container engine once and exit
    Prune {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,
}
