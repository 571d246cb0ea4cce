//! Backup core library: domain types, the durable catalog, errors.
//!
//! - [`types`]: nodes, scheduled paths, finished backups
//! - [`catalog`]: write-ahead-logged store of all of the above
//! - [`digest`]: streaming SHA-256 over archive files
//! - [`error`]: [`CatalogError`]

pub mod catalog;
pub mod digest;
pub mod error;
pub mod types;

pub use catalog::{CatalogOptions, CatalogState, DiskCatalog};
pub use error::CatalogError;
pub use types::{FinishedTask, NodeEntry, TaskKey, TaskSpec};
