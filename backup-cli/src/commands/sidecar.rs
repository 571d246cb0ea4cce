//! `backup sidecar`: serve archives of local paths to coordinator workers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use backup_sidecar::{start_blocking, SidecarConfig};

#[derive(Args, Debug)]
pub struct SidecarArgs {
    #[arg(long, env = "PORT")]
    pub port: u16,

    #[arg(long, env = "BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_address: IpAddr,

    #[arg(long, env = "LISTEN_BACKLOG", default_value_t = 10)]
    pub listen_backlog: u32,

    /// Where archives are staged while they are sent. Defaults to the
    /// system temp directory.
    #[arg(long, env = "SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,
}

impl SidecarArgs {
    pub fn run(self) -> Result<()> {
        let mut config = SidecarConfig::new(self.port);
        config.bind = SocketAddr::new(self.bind_address, self.port);
        config.listen_backlog = self.listen_backlog;
        if let Some(dir) = self.scratch_dir {
            config.scratch_dir = dir;
        }
        backup_coordinator::init_tracing();
        start_blocking(config).context("sidecar exited with error")
    }
}
