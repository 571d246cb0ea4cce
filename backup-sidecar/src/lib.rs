//! Sidecar agent: archives a local path on request and streams it to a
//! coordinator worker.

pub mod archive;
pub mod config;
mod error;
pub mod server;

pub use archive::Archive;
pub use config::SidecarConfig;
pub use error::SidecarError;
pub use server::{run, run_until, start_blocking};
