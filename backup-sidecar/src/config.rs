use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

pub const DEFAULT_LISTEN_BACKLOG: u32 = 10;

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub bind: SocketAddr,
    pub listen_backlog: u32,
    /// Archives are built here and removed once sent.
    pub scratch_dir: PathBuf,
}

impl SidecarConfig {
    pub fn new(port: u16) -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            scratch_dir: std::env::temp_dir(),
        }
    }
}
