use anyhow::{Context, Result};
use clap::Args;

use backup_coordinator::{run_worker_blocking, WorkerJob};

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// JSON-encoded job description.
    #[arg(long)]
    pub job: String,
}

impl WorkerArgs {
    pub fn run(self) -> Result<()> {
        let job: WorkerJob = serde_json::from_str(&self.job).context("invalid worker job")?;
        let code = run_worker_blocking(job).context("worker runtime failed")?;
        if code != 0 {
            std::process::exit(code);
        }
        Ok(())
    }
}
