use anyhow::{Context as _, Result};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use teredo_proto::{DISCOVERY_IPV4, TEREDO_PORT};
use tokio::net::UdpSocket;

/// One IPv4 UDP endpoint of the tunnel.
///
/// Thread-safe for concurrent send and receive; `recv_from` surfaces the
/// actual datagram source, never anything from the encapsulation.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&socket2::SockAddr::from(addr))
            .with_context(|| format!("Failed to bind UDP socket on {addr}"))?;

        let socket = UdpSocket::try_from(std::net::UdpSocket::from(socket))?;

        Ok(Self { socket })
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        loop {
            let (n, src) = self.socket.recv_from(buf).await?;

            match src {
                SocketAddr::V4(src) => return Ok((n, src)),
                SocketAddr::V6(_) => continue,
            }
        }
    }

    pub async fn send_to(&self, buf: &[u8], dst: SocketAddrV4) -> io::Result<()> {
        self.socket.send_to(buf, SocketAddr::V4(dst)).await?;

        Ok(())
    }

    /// Non-blocking send for synchronous callers (the solicitation hook).
    /// UDP sends do not block in practice; a full socket buffer drops the
    /// datagram, which the protocol tolerates.
    pub fn try_send_to(&self, buf: &[u8], dst: SocketAddrV4) {
        if let Err(e) = self.socket.try_send_to(buf, SocketAddr::V4(dst)) {
            tracing::debug!(%dst, "Failed to send datagram: {e}");
        }
    }

    /// Subscribes to the local-discovery multicast group on the given
    /// interface.
    pub fn join_discovery_group(&self, interface: Ipv4Addr) -> io::Result<()> {
        self.socket.join_multicast_v4(DISCOVERY_IPV4, interface)
    }

    /// Sends a discovery announcement out of a specific interface.
    pub fn send_multicast_via(&self, interface: Ipv4Addr, buf: &[u8]) {
        let dst = SocketAddrV4::new(DISCOVERY_IPV4, TEREDO_PORT);

        // Selecting the outgoing multicast interface is per-socket state;
        // the socket sends multicast only from here, so no reset is needed.
        if let Err(e) = socket2::SockRef::from(&self.socket).set_multicast_if_v4(&interface) {
            tracing::debug!(%interface, "Failed to select multicast interface: {e}");
        }

        self.try_send_to(buf, dst);
    }
}
