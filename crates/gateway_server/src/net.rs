//! Listening sockets.

use crate::error::{GatewayError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use tracing::info;

const LISTEN_BACKLOG: i32 = 1024;

/// Creates a non-blocking TCP listener with `SO_REUSEADDR`.
///
/// # Arguments
///
/// * `addr` - Address to bind; port `0` picks a free port
///
/// # Returns
///
/// The listener, bound and listening.
pub fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| GatewayError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();
    socket
        .bind(&addr.into())
        .map_err(|e| GatewayError::Network(format!("Bind failed on {addr}: {e}")))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| GatewayError::Network(format!("Listen failed on {addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| GatewayError::Network(format!("Failed to set non-blocking: {e}")))?;

    let listener: TcpListener = socket.into();
    info!("✅ TCP listener bound on {}", listener.local_addr()?);
    Ok(listener)
}

/// Creates a non-blocking UDP socket bound to `addr`.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| GatewayError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();
    socket
        .bind(&addr.into())
        .map_err(|e| GatewayError::Network(format!("Bind failed on {addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| GatewayError::Network(format!("Failed to set non-blocking: {e}")))?;

    let socket: UdpSocket = socket.into();
    info!("✅ UDP socket bound on {}", socket.local_addr()?);
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_zero_gets_a_real_port() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let udp = bind_udp(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();
        assert_eq!(udp.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_bind_conflict_is_a_network_error() {
        let first = bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr().unwrap();
        // SO_REUSEADDR does not allow two live listeners on one port.
        assert!(matches!(bind_tcp(taken), Err(GatewayError::Network(_))));
    }
}
