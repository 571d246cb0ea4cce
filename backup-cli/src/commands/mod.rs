pub mod backups;
pub mod coordinator;
pub mod node;
pub mod send;
pub mod sidecar;
pub mod task;
pub mod worker;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Map, Value};

use backup_wire::{ControlRequest, ControlResponse, WireError};

/// Where the coordinator's control port lives.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Coordinator control address (`host:port`).
    #[arg(long, env = "BACKUP_SERVER", default_value = "127.0.0.1:8080")]
    pub server: String,
}

impl ServerArgs {
    /// Send one request and return the raw response, whatever its status.
    pub fn send(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let runtime = client_runtime()?;
        runtime
            .block_on(backup_wire::send_request(&self.server, request))
            .with_context(|| format!("failed to reach coordinator at {}", self.server))
    }

    /// Send `command` and return the `data` of an `OK` reply.
    pub fn call(&self, command: &str, args: Map<String, Value>) -> Result<Value> {
        let runtime = client_runtime()?;
        match runtime.block_on(backup_wire::request(&self.server, command, args)) {
            Ok(data) => Ok(data),
            Err(WireError::Rejected { message, data }) => {
                let detail = match data {
                    Value::Null => message,
                    Value::String(reason) => format!("{message}: {reason}"),
                    other => format!("{message}: {other}"),
                };
                Err(anyhow::anyhow!("coordinator refused `{command}`: {detail}"))
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed to reach coordinator at {}", self.server)),
        }
    }
}

fn client_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start client runtime")
}

/// Build an argument object from `(key, value)` pairs.
pub fn args<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
