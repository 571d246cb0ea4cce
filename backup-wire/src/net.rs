use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket};

use crate::error::WireError;

/// Bind a listener with an explicit accept backlog and `SO_REUSEADDR`.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, WireError> {
    let bind_err = |source| WireError::Bind { addr, source };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(backlog).map_err(bind_err)
}
