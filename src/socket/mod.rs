use std::io;
use std::net::SocketAddr;

use socket2::Protocol;

pub(crate) fn bind_udp_ops(addr: SocketAddr) -> io::Result<socket2::Socket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_only_v6(true)?;
        socket
    };
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Bind a nonblocking UDP socket and register it with the tokio reactor.
///
/// Must be called from within a tokio runtime.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<tokio::net::UdpSocket> {
    let socket: std::net::UdpSocket = bind_udp_ops(addr)?.into();
    tokio::net::UdpSocket::from_std(socket)
}
