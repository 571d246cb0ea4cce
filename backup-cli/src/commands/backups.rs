//! `backup backups <name> <path>`: recorded history, newest first.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use backup_core::FinishedTask;

use super::{args, ServerArgs};

#[derive(Args, Debug)]
pub struct BackupsArgs {
    pub name: String,
    pub path: String,

    /// Print the raw JSON history.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "taken")]
    taken: String,
    #[tabled(rename = "size")]
    size: String,
    #[tabled(rename = "checksum")]
    checksum: String,
    #[tabled(rename = "archive")]
    archive: String,
}

impl BackupsArgs {
    pub fn run(self) -> Result<()> {
        let data = self.server.call(
            "query_backups",
            args([("name", json!(self.name)), ("path", json!(self.path))]),
        )?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&data)?);
            return Ok(());
        }

        let entries = match data {
            Value::Array(entries) => entries,
            other => anyhow::bail!("unexpected query_backups reply: {other}"),
        };
        let tasks = entries
            .into_iter()
            .map(FinishedTask::from_value)
            .collect::<Result<Vec<_>, _>>()
            .context("malformed backup entry")?;

        println!("{} {}:{}", "Backups".bold(), self.name, self.path);
        if tasks.is_empty() {
            println!("{}", "No backups recorded.".bright_black());
            return Ok(());
        }

        let rows: Vec<BackupRow> = tasks.iter().enumerate().map(row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn row((index, task): (usize, &FinishedTask)) -> BackupRow {
    BackupRow {
        index: index + 1,
        taken: task.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        size: format!("{:.1} KB", task.kb_size),
        checksum: task.checksum.chars().take(12).collect(),
        archive: task.result_path.display().to_string(),
    }
}
