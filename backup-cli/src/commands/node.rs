//! `backup node add` and `backup node delete`

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use super::{args, ServerArgs};

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// Register a node, or update its address. Scheduled paths are kept.
    Add(AddArgs),
    /// Forget a node and its schedule. Recorded backups stay on disk.
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub name: String,

    /// Host the node's sidecar listens on.
    #[arg(long)]
    pub address: String,

    /// Sidecar port.
    #[arg(long)]
    pub port: u16,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub name: String,

    #[command(flatten)]
    pub server: ServerArgs,
}

pub fn run(command: NodeCommand) -> Result<()> {
    match command {
        NodeCommand::Add(add) => {
            add.server.call(
                "add_node",
                args([
                    ("name", json!(add.name)),
                    ("address", json!(add.address)),
                    ("port", json!(add.port)),
                ]),
            )?;
            println!("✓ Node '{}' registered at {}:{}", add.name, add.address, add.port);
        }
        NodeCommand::Delete(delete) => {
            delete
                .server
                .call("delete_node", args([("name", json!(delete.name))]))?;
            println!("✓ Node '{}' deleted", delete.name);
        }
    }
    Ok(())
}
