//! Control commands: parse a `(command, args)` pair, apply it to the catalog.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use backup_core::{CatalogError, DiskCatalog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddNode {
        name: String,
        address: String,
        port: u16,
    },
    AddTask {
        name: String,
        path: String,
        frequency: u32,
    },
    DeleteScheduledTask {
        name: String,
        path: String,
    },
    DeleteNode {
        name: String,
    },
    QueryBackups {
        name: String,
        path: String,
    },
}

/// Result of a successfully applied command.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub data: Value,
    /// The scheduler must rebuild its schedule from the catalog.
    pub schedule_changed: bool,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid arguments for '{command}': {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("{0}")]
    Catalog(#[from] CatalogError),
}

// ---------------------------------------------------------------------------
// Argument shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeArgs {
    name: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddNodeArgs {
    name: String,
    address: String,
    port: i64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskArgs {
    name: String,
    path: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddTaskArgs {
    name: String,
    path: String,
    frequency: i64,
}

impl Command {
    pub fn parse(command: &str, args: Map<String, Value>) -> Result<Self, DispatchError> {
        let invalid = |reason: String| DispatchError::InvalidArguments {
            command: command.to_string(),
            reason,
        };
        let parsed = match command {
            "add_node" => {
                let args: AddNodeArgs = decode(args).map_err(invalid)?;
                let port = u16::try_from(args.port)
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| invalid(format!("port {} is outside 1..65535", args.port)))?;
                if args.address.trim().is_empty() {
                    return Err(invalid("address must not be empty".to_string()));
                }
                Command::AddNode {
                    name: node_name(args.name).map_err(invalid)?,
                    address: args.address,
                    port,
                }
            }
            "add_task" => {
                let args: AddTaskArgs = decode(args).map_err(invalid)?;
                let frequency = u32::try_from(args.frequency)
                    .ok()
                    .filter(|minutes| *minutes > 0)
                    .ok_or_else(|| {
                        invalid(format!(
                            "frequency {} must be a positive number of minutes",
                            args.frequency
                        ))
                    })?;
                Command::AddTask {
                    name: node_name(args.name).map_err(invalid)?,
                    path: remote_path(args.path).map_err(invalid)?,
                    frequency,
                }
            }
            "delete_scheduled_task" => {
                let args: TaskArgs = decode(args).map_err(invalid)?;
                Command::DeleteScheduledTask {
                    name: args.name,
                    path: args.path,
                }
            }
            "delete_node" => {
                let args: NodeArgs = decode(args).map_err(invalid)?;
                Command::DeleteNode { name: args.name }
            }
            "query_backups" => {
                let args: TaskArgs = decode(args).map_err(invalid)?;
                Command::QueryBackups {
                    name: args.name,
                    path: args.path,
                }
            }
            other => return Err(DispatchError::UnknownCommand(other.to_string())),
        };
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::AddNode { .. } => "add_node",
            Command::AddTask { .. } => "add_task",
            Command::DeleteScheduledTask { .. } => "delete_scheduled_task",
            Command::DeleteNode { .. } => "delete_node",
            Command::QueryBackups { .. } => "query_backups",
        }
    }
}

fn decode<T: DeserializeOwned>(args: Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(args)).map_err(|err| err.to_string())
}

/// Node names end up inside archive file names.
fn node_name(name: String) -> Result<String, String> {
    if name.is_empty() {
        Err("name must not be empty".to_string())
    } else if name.contains('/') || name.contains('\0') {
        Err(format!("name {name:?} must not contain '/' or NUL"))
    } else {
        Ok(name)
    }
}

fn remote_path(path: String) -> Result<String, String> {
    if path.is_empty() {
        Err("path must not be empty".to_string())
    } else {
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Apply `command` to the catalog.
pub fn apply(command: Command, catalog: &mut DiskCatalog) -> Result<Dispatch, DispatchError> {
    let dispatch = match command {
        Command::AddNode {
            name,
            address,
            port,
        } => {
            let had_tasks = !catalog.tasks_for_node(&name).is_empty();
            catalog.register_node(&name, &address, port)?;
            changed(had_tasks)
        }
        Command::AddTask {
            name,
            path,
            frequency,
        } => {
            catalog.add_scheduled_task(&name, &path, frequency)?;
            changed(true)
        }
        Command::DeleteScheduledTask { name, path } => {
            catalog.delete_scheduled_task(&name, &path)?;
            changed(true)
        }
        Command::DeleteNode { name } => {
            catalog.delete_node(&name)?;
            changed(true)
        }
        Command::QueryBackups { name, path } => {
            let history = catalog
                .node_finished_tasks(&name, &path)
                .iter()
                .map(|task| task.to_value())
                .collect();
            Dispatch {
                data: Value::Array(history),
                schedule_changed: false,
            }
        }
    };
    Ok(dispatch)
}

fn changed(schedule_changed: bool) -> Dispatch {
    Dispatch {
        data: Value::Null,
        schedule_changed,
    }
}
