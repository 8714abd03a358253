//! UDP socket setup

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::NodeConfig;
use crate::error::NetworkError;

/// Create and bind the socket of a node.
///
/// Address reuse stays off: a port held by another process must fail the
/// bind instead of silently splitting the traffic.
pub fn create_socket(port: u16, config: &NodeConfig) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| {
        if e.kind() == ErrorKind::AddrInUse {
            NetworkError::PortInUse(port)
        } else {
            NetworkError::BindFailed { port, reason: e.to_string() }
        }
    };

    let (domain, addr) = if config.ipv6 {
        (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
    } else {
        (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;

    if config.ipv6 {
        // Dual stack so IPv4 peers can reach us too
        socket.set_only_v6(false).map_err(bind_err)?;
    }

    if config.send_buffer_size > 0 {
        if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
            tracing::warn!("Could not set send buffer size: {}", e);
        }
    }
    if config.recv_buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
            tracing::warn!("Could not set receive buffer size: {}", e);
        }
    }

    socket.bind(&addr.into()).map_err(bind_err)?;

    // Blocking receive; the node wakes the receive thread with a datagram to itself
    Ok(socket.into())
}

/// Undo IPv4-mapped IPv6 addresses reported by a dual stack socket
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

/// Make `addr` sendable from a socket bound to `local`
pub fn outgoing_addr(local: &SocketAddr, addr: SocketAddr) -> SocketAddr {
    match (local, addr) {
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        _ => addr,
    }
}

/// Address at which a socket bound to `local` can reach itself
pub fn loopback_addr(local: &SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let socket = create_socket(0, &NodeConfig::default()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_receive_blocks_without_timeout() {
        let socket = create_socket(0, &NodeConfig::default()).unwrap();
        assert_eq!(socket.read_timeout().unwrap(), None);

        // Woken by a datagram to itself, the way a node stops its receive thread
        let wake = loopback_addr(&socket.local_addr().unwrap());
        socket.send_to(&[0u8], wake).unwrap();
        let mut buf = [0u8; 8];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_port_in_use() {
        let taken = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(matches!(
            create_socket(port, &NodeConfig::default()),
            Err(NetworkError::PortInUse(p)) if p == port
        ));
    }

    #[test]
    fn test_address_helpers() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:5000".parse().unwrap();
        assert_eq!(canonical_addr(mapped), "10.0.0.1:5000".parse().unwrap());

        let local: SocketAddr = "[::]:7000".parse().unwrap();
        let v4: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(outgoing_addr(&local, v4), mapped);

        assert_eq!(loopback_addr(&"0.0.0.0:7000".parse().unwrap()), "127.0.0.1:7000".parse().unwrap());
    }
}
