use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::{Map, Value};

use backup_wire::ControlRequest;

use super::ServerArgs;

#[derive(Args, Debug)]
pub struct SendArgs {
    #[arg(long)]
    pub command: String,

    /// Arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    pub args: String,

    #[command(flatten)]
    pub server: ServerArgs,
}

impl SendArgs {
    pub fn run(self) -> Result<()> {
        let args: Map<String, Value> =
            serde_json::from_str(&self.args).context("--args must be a JSON object")?;
        let response = self.server.send(&ControlRequest::new(&self.command, args))?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        if !response.is_ok() {
            bail!("coordinator replied {}", response.message);
        }
        Ok(())
    }
}
