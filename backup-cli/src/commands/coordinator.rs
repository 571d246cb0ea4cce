//! `backup coordinator`: the scheduler, workers and control server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use backup_coordinator::{start_blocking, CoordinatorConfig};

#[derive(Args, Debug)]
pub struct CoordinatorArgs {
    /// Control port.
    #[arg(long, env = "PORT")]
    pub port: u16,

    /// Directory holding the catalog and the `data/` archive store.
    #[arg(long = "data-path", env = "BACKUP_DATA_PATH")]
    pub data_path: PathBuf,

    #[arg(long, env = "BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_address: IpAddr,

    #[arg(long, env = "LISTEN_BACKLOG", default_value_t = 10)]
    pub listen_backlog: u32,

    /// Seconds between scheduler passes when no request arrives.
    #[arg(
        long,
        env = "POLL_INTERVAL_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval_secs: u64,

    /// Finished backups kept per scheduled path.
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = 10)]
    pub history_limit: usize,

    /// Kill workers that run longer than this many seconds.
    #[arg(long, env = "WORKER_TIMEOUT_SECS")]
    pub worker_timeout_secs: Option<u64>,
}

impl CoordinatorArgs {
    pub fn config(&self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::new(&self.data_path, self.port);
        config.bind = SocketAddr::new(self.bind_address, self.port);
        config.listen_backlog = self.listen_backlog;
        config.poll_interval = Duration::from_secs(self.poll_interval_secs);
        config.worker_timeout = self.worker_timeout_secs.map(Duration::from_secs);
        config.catalog.history_limit = self.history_limit.max(1);
        config
    }

    pub fn run(self) -> Result<()> {
        start_blocking(self.config()).context("coordinator exited with error")
    }
}
