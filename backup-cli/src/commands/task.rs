//! `backup task add` and `backup task delete`

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use super::{args, ServerArgs};

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Back up `path` on node `name` every `--frequency` minutes.
    Add(AddArgs),
    /// Stop backing up `path`. Its history is kept.
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub name: String,
    pub path: String,

    /// Minutes between backups.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub frequency: u32,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub name: String,
    pub path: String,

    #[command(flatten)]
    pub server: ServerArgs,
}

pub fn run(command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Add(add) => {
            add.server.call(
                "add_task",
                args([
                    ("name", json!(add.name)),
                    ("path", json!(add.path)),
                    ("frequency", json!(add.frequency)),
                ]),
            )?;
            println!(
                "✓ Scheduled {}:{} every {} min",
                add.name, add.path, add.frequency
            );
        }
        TaskCommand::Delete(delete) => {
            delete.server.call(
                "delete_scheduled_task",
                args([("name", json!(delete.name)), ("path", json!(delete.path))]),
            )?;
            println!("✓ Unscheduled {}:{}", delete.name, delete.path);
        }
    }
    Ok(())
}
