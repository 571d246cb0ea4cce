//! `backup`: coordinator, sidecar and control client in one binary.
//!
//! # Usage
//!
//! ```text
//! backup coordinator                      # PORT, BACKUP_DATA_PATH, ...
//! backup sidecar                          # PORT, SCRATCH_DIR, ...
//! backup node add <name> --address <host> --port <port>
//! backup node delete <name>
//! backup task add <name> <path> --frequency <minutes>
//! backup task delete <name> <path>
//! backup backups <name> <path> [--json]
//! backup send --command <command> [--args <json>]
//! ```
//!
//! Client commands talk to `--server` (or `BACKUP_SERVER`, default
//! `127.0.0.1:8080`) and exit non-zero unless the reply is `OK`.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    backups::BackupsArgs, coordinator::CoordinatorArgs, node::NodeCommand, send::SendArgs,
    sidecar::SidecarArgs, task::TaskCommand, worker::WorkerArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "backup",
    version,
    about = "Pull-based backups: coordinator, sidecar agent and control client",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the backup coordinator in the foreground.
    Coordinator(CoordinatorArgs),

    /// Run the sidecar agent that archives local paths on request.
    Sidecar(SidecarArgs),

    /// Run a single backup attempt (spawned by the coordinator).
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Register or remove nodes.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Schedule or unschedule paths on a node.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// List the backups recorded for a node path.
    Backups(BackupsArgs),

    /// Send a raw control request and print the raw response.
    Send(SendArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Coordinator(args) => args.run(),
        Commands::Sidecar(args) => args.run(),
        Commands::Worker(args) => args.run(),
        Commands::Node { command } => commands::node::run(command),
        Commands::Task { command } => commands::task::run(command),
        Commands::Backups(args) => args.run(),
        Commands::Send(args) => args.run(),
    }
}
