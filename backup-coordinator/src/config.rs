use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use backup_core::CatalogOptions;

use crate::scheduler::SchedulerOptions;

pub const DEFAULT_LISTEN_BACKLOG: u32 = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// How long the control server waits for a client's request frame.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a coordinator process needs to start.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Holds `database`, `log` and the `data/` archive directory.
    pub data_root: PathBuf,
    pub bind: SocketAddr,
    pub listen_backlog: u32,
    pub poll_interval: Duration,
    /// Workers alive past this are terminated and count as failed.
    pub worker_timeout: Option<Duration>,
    pub control_read_timeout: Duration,
    pub catalog: CatalogOptions,
}

impl CoordinatorConfig {
    /// Defaults for everything but the state directory and control port.
    pub fn new(data_root: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            data_root: data_root.into(),
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker_timeout: None,
            control_read_timeout: CONTROL_READ_TIMEOUT,
            catalog: CatalogOptions::default(),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: self.poll_interval,
            worker_timeout: self.worker_timeout,
        }
    }
}
