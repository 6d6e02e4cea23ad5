use crate::maintain::RaError;
use crate::{Clock, Maintenance, PeerList, TokenKeys};
use crate::{PeerRef, TeredoState};
use parking_lot::RwLock;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, OnceLock};
use teredo_proto::{
    bubble, echo_reply_cookie, echo_request, is_ipv4_global_unicast, is_ipv4_private_unicast,
    is_teredo, matches_teredo_client, teredo_client_ipv4, teredo_client_port, teredo_server,
    ParseError, TeredoPacket, ALL_NODES, TEREDO_PORT,
};

/// Bubble pairs (and pings) sent before a peer is declared unreachable.
const MAX_ATTEMPTS: u8 = 3;
/// Minimum spacing between bubble pairs (and pings) to one peer.
const ATTEMPT_INTERVAL_SECS: u64 = 2;

/// An I/O action requested by the datapath; the caller performs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmit {
    Udp {
        dst: SocketAddrV4,
        payload: Vec<u8>,
    },
    /// Deliver an IPv6 packet to the tunnel device.
    Tunnel {
        packet: Vec<u8>,
    },
}

/// Why a packet was dropped. None of these propagate; the pumps log them at
/// debug level and move on.
#[derive(Debug, thiserror::Error)]
pub enum Rejected {
    #[error(transparent)]
    Malformed(#[from] ParseError),
    #[error("tunnel is down")]
    Down,
    #[error("authenticated packet outside qualification")]
    UnexpectedAuth,
    #[error(transparent)]
    Advertisement(#[from] RaError),
    #[error("local discovery is disabled")]
    DiscoveryDisabled,
    #[error("source address does not match its UDP endpoint")]
    Spoofed,
    #[error("not addressed to us")]
    NotForUs,
    #[error("no trusted relay path for this source")]
    NoTrustedPath,
    #[error("peer list is full")]
    PeerListFull,
    #[error("unroutable destination")]
    BadDestination,
    #[error("peer did not answer any bubbles or pings")]
    Unreachable,
    #[error("no server to relay through")]
    NoServer,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Accept link-local peers found through local discovery (and their
    /// private mapped addresses).
    pub discovery: bool,
    pub peer_capacity: usize,
    /// Per-peer byte budget for payloads pending path establishment.
    pub queue_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery: false,
            peer_capacity: 500,
            queue_bytes: 4096,
        }
    }
}

/// The client/relay datapath.
///
/// Sans-IO: [`Relay::handle_tunnel_input`] takes IPv6 packets read from the
/// tunnel, [`Relay::handle_udp_input`] takes datagrams received on the UDP
/// socket; both return the transmissions to perform. The peer list is the
/// only shared state, so the two pumps may run concurrently.
pub struct Relay {
    clock: Clock,
    keys: Arc<TokenKeys>,
    peers: PeerList,
    state: RwLock<TeredoState>,
    maintenance: OnceLock<Arc<Maintenance>>,
    discovery_enabled: bool,
}

impl Relay {
    pub fn new(clock: Clock, keys: Arc<TokenKeys>, cfg: RelayConfig) -> Self {
        Self {
            clock,
            keys,
            peers: PeerList::new(cfg.peer_capacity, cfg.queue_bytes),
            state: RwLock::new(TeredoState::down()),
            maintenance: OnceLock::new(),
            discovery_enabled: cfg.discovery,
        }
    }

    /// Routes qualification traffic to the maintenance procedure. Client
    /// role only; at most once.
    pub fn attach_maintenance(&self, maintenance: Arc<Maintenance>) {
        if self.maintenance.set(maintenance).is_err() {
            tracing::warn!("Maintenance procedure attached twice");
        }
    }

    pub fn state(&self) -> TeredoState {
        *self.state.read()
    }

    /// Publishes a state transition (the maintenance callback, or the static
    /// state of the relay role).
    pub fn set_state(&self, state: TeredoState) {
        *self.state.write() = state;
    }

    pub fn peers(&self) -> &PeerList {
        &self.peers
    }

    /// Handles one IPv6 packet read from the tunnel device.
    pub fn handle_tunnel_input(&self, packet: &[u8]) -> Result<Vec<Transmit>, Rejected> {
        let now = self.clock.now();
        let state = self.state();

        if !state.up {
            return Err(Rejected::Down);
        }

        let view = TeredoPacket::parse(packet)?;
        let dst = view.destination();

        if view.hop_limit() == 0
            || dst.is_unspecified()
            || dst.is_loopback()
            || dst.is_multicast()
        {
            return Err(Rejected::BadDestination);
        }

        if is_teredo(&dst) && !self.reachable_mapped_address(teredo_client_ipv4(&dst)) {
            return Err(Rejected::BadDestination);
        }

        let peer = self
            .peers
            .lookup(now, dst)
            .ok_or(Rejected::PeerListFull)?;
        let mut entry = peer.lock();

        // Established path: send straight to the mapped endpoint.
        if let (true, Some(mapped)) = (entry.trusted, entry.mapped) {
            entry.last_tx = now;
            drop(entry);
            peer.touch(now);

            return Ok(vec![Transmit::Udp {
                dst: mapped,
                payload: packet.to_vec(),
            }]);
        }

        // No path yet: hold the payload and prod the peer.
        entry.enqueue(packet, self.peers.queue_limit());

        let attempts = if is_teredo(&dst) {
            entry.bubbles_sent
        } else {
            entry.pings_sent
        };
        let due =
            attempts == 0 || now.saturating_sub(entry.last_xmit) >= ATTEMPT_INTERVAL_SECS;

        if !due {
            drop(entry);
            peer.touch(now);
            return Ok(Vec::new());
        }

        if attempts >= MAX_ATTEMPTS {
            // The peer never answered; give up and forget it.
            drop(entry);
            self.peers.remove(dst);
            return Err(Rejected::Unreachable);
        }

        let out;

        if is_teredo(&dst) {
            entry.bubbles_sent += 1;
            entry.last_xmit = now;

            // One bubble straight to the peer's mapped endpoint, one via its
            // server in case its NAT has no binding for us yet.
            let direct = SocketAddrV4::new(teredo_client_ipv4(&dst), teredo_client_port(&dst));
            let via_server = SocketAddrV4::new(teredo_server(&dst), TEREDO_PORT);

            out = vec![
                Transmit::Udp {
                    dst: direct,
                    payload: bubble(state.addr, dst),
                },
                Transmit::Udp {
                    dst: via_server,
                    payload: bubble(state.addr, dst),
                },
            ];
        } else {
            // Reaching a native IPv6 host requires confirming a relay path
            // with an echo exchange through our server.
            let Some(server) = our_server(&state) else {
                return Err(Rejected::NoServer);
            };

            entry.pings_sent += 1;
            entry.last_xmit = now;

            let cookie = self.keys.ping_cookie(now, state.addr, dst);

            out = vec![Transmit::Udp {
                dst: SocketAddrV4::new(server, TEREDO_PORT),
                payload: echo_request(state.addr, dst, cookie),
            }];
        }

        drop(entry);
        peer.touch(now);

        Ok(out)
    }

    /// Handles one datagram received on the UDP socket.
    pub fn handle_udp_input(
        &self,
        buf: &[u8],
        src: SocketAddrV4,
    ) -> Result<Vec<Transmit>, Rejected> {
        let now = self.clock.now();
        let packet = TeredoPacket::parse(buf)?;

        // Authenticated packets carry qualification traffic from the server.
        if packet.auth.is_some() {
            let maintenance = self.maintenance.get().ok_or(Rejected::UnexpectedAuth)?;
            maintenance.process_ra(&packet, src)?;

            return Ok(Vec::new());
        }

        let state = self.state();
        if !state.up {
            return Err(Rejected::Down);
        }

        let src6 = packet.source();

        // Local discovery bubbles announce peers on our own link.
        if packet.is_bubble() && packet.destination() == ALL_NODES {
            if !self.discovery_enabled {
                return Err(Rejected::DiscoveryDisabled);
            }
            if !is_teredo(&src6) || src6 == state.addr {
                // Not a peer announcement (or our own multicast looped back).
                return Ok(Vec::new());
            }

            return self.register_discovered_peer(now, src6, src);
        }

        let is_client = our_server(&state).is_some();
        let from_server = is_client
            && our_server(&state)
                .is_some_and(|server| src == SocketAddrV4::new(server, TEREDO_PORT));

        // Packets relayed by our own server carry the sender's real endpoint
        // in the origin indication; anyone else claiming one is lying.
        let source = match packet.origin {
            Some(origin) if from_server => origin,
            _ => src,
        };

        if is_teredo(&src6) && !matches_teredo_client(&src6, *source.ip(), source.port()) {
            return Err(Rejected::Spoofed);
        }

        if is_client && packet.destination() != state.addr {
            return Err(Rejected::NotForUs);
        }

        if packet.is_bubble() {
            if !is_teredo(&src6) {
                return Err(Rejected::Spoofed);
            }

            let peer = self
                .peers
                .lookup(now, src6)
                .ok_or(Rejected::PeerListFull)?;
            let mut out = self.establish(&peer, now, source);

            // A bubble that came through the server is a hole-punch request;
            // answer it directly to open our side of the path.
            if from_server && packet.origin.is_some() {
                out.push(Transmit::Udp {
                    dst: source,
                    payload: bubble(state.addr, src6),
                });
            }

            return Ok(out);
        }

        // An echo reply with a valid cookie proves the relay path to a
        // native IPv6 peer.
        if let Some(cookie) = echo_reply_cookie(&packet) {
            if self.keys.check_ping_cookie(cookie, now, state.addr, src6) {
                let peer = self
                    .peers
                    .lookup(now, src6)
                    .ok_or(Rejected::PeerListFull)?;

                return Ok(self.establish(&peer, now, source));
            }
            // Stale or unsolicited; deliver it like any other payload below.
        }

        if is_teredo(&src6) {
            // The source survived the endpoint check, so the direct path
            // works; remember it and release anything we held back.
            let mut out = match self.peers.lookup(now, src6) {
                Some(peer) => self.establish(&peer, now, source),
                None => Vec::new(),
            };

            out.push(Transmit::Tunnel {
                packet: packet.ipv6_packet().to_vec(),
            });

            return Ok(out);
        }

        // Native IPv6 source: only accepted over the relay path we
        // confirmed with a ping.
        let peer = self
            .peers
            .find(now, src6)
            .ok_or(Rejected::NoTrustedPath)?;
        {
            let mut entry = peer.lock();
            if !entry.trusted || entry.mapped != Some(source) {
                return Err(Rejected::NoTrustedPath);
            }
            entry.last_rx = now;
        }
        peer.touch(now);

        Ok(vec![Transmit::Tunnel {
            packet: packet.ipv6_packet().to_vec(),
        }])
    }

    /// Registers a peer discovered on the local link as trusted on its
    /// observed endpoint, so traffic to it skips the server detour.
    fn register_discovered_peer(
        &self,
        now: u64,
        peer6: std::net::Ipv6Addr,
        src: SocketAddrV4,
    ) -> Result<Vec<Transmit>, Rejected> {
        let peer = self
            .peers
            .lookup(now, peer6)
            .ok_or(Rejected::PeerListFull)?;

        Ok(self.establish(&peer, now, src))
    }

    /// Marks a peer trusted on `mapped` and flushes its pending queue, in
    /// FIFO order.
    fn establish(&self, peer: &PeerRef, now: u64, mapped: SocketAddrV4) -> Vec<Transmit> {
        let mut entry = peer.lock();

        entry.mapped = Some(mapped);
        entry.trusted = true;
        entry.bubbles_sent = 0;
        entry.pings_sent = 0;
        entry.last_rx = now;

        let queue = entry.take_queue();
        if !queue.is_empty() {
            entry.last_tx = now;
        }
        drop(entry);
        peer.touch(now);

        queue
            .into_iter()
            .map(|payload| Transmit::Udp {
                dst: mapped,
                payload,
            })
            .collect()
    }

    fn reachable_mapped_address(&self, mapped: Ipv4Addr) -> bool {
        is_ipv4_global_unicast(mapped)
            || (self.discovery_enabled && is_ipv4_private_unicast(mapped))
    }
}

/// The server we qualified through, if any; relays without one cannot use
/// the server-assisted paths.
fn our_server(state: &TeredoState) -> Option<Ipv4Addr> {
    let server = teredo_server(&state.addr);

    (server != Ipv4Addr::UNSPECIFIED).then_some(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MaintenanceConfig;
    use std::net::Ipv6Addr;
    use std::time::Duration;
    use teredo_proto::{TeredoAddr, TEREDO_PREFIX};

    const OUR_SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
    const PEER_SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 2);

    fn our_addr() -> Ipv6Addr {
        TeredoAddr {
            prefix: TEREDO_PREFIX,
            server: OUR_SERVER,
            flags: 0x1234 & teredo_proto::RANDOM_MASK,
            port: 40000,
            client: Ipv4Addr::new(198, 51, 100, 7),
        }
        .to_ipv6()
    }

    fn peer_addr() -> Ipv6Addr {
        TeredoAddr {
            prefix: TEREDO_PREFIX,
            server: PEER_SERVER,
            flags: 0,
            port: 9000,
            client: Ipv4Addr::new(192, 0, 2, 1),
        }
        .to_ipv6()
    }

    fn client_relay(discovery: bool) -> Relay {
        let relay = Relay::new(
            Clock::new(),
            Arc::new(TokenKeys::new()),
            RelayConfig {
                discovery,
                peer_capacity: 16,
                queue_bytes: 4096,
            },
        );
        relay.set_state(TeredoState {
            up: true,
            mtu: 1280,
            addr: our_addr(),
            ipv4: Ipv4Addr::new(198, 51, 100, 7),
        });

        relay
    }

    /// Some payload-carrying IPv6 packet from us to `dst`.
    fn data_packet(src: Ipv6Addr, dst: Ipv6Addr, marker: u8) -> Vec<u8> {
        echo_request(src, dst, [marker; 4])
    }

    fn udp_destinations(transmits: &[Transmit]) -> Vec<SocketAddrV4> {
        transmits
            .iter()
            .map(|t| match t {
                Transmit::Udp { dst, .. } => *dst,
                Transmit::Tunnel { .. } => panic!("expected UDP transmit"),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn down_relay_drops_everything() {
        let relay = client_relay(false);
        relay.set_state(TeredoState::down());

        assert!(matches!(
            relay.handle_tunnel_input(&data_packet(our_addr(), peer_addr(), 1)),
            Err(Rejected::Down)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn first_packet_triggers_bubble_pair() {
        let relay = client_relay(false);

        let transmits = relay
            .handle_tunnel_input(&data_packet(our_addr(), peer_addr(), 1))
            .unwrap();

        assert_eq!(
            udp_destinations(&transmits),
            vec![
                SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9000),
                SocketAddrV4::new(PEER_SERVER, TEREDO_PORT),
            ]
        );

        for transmit in &transmits {
            let Transmit::Udp { payload, .. } = transmit else {
                panic!("expected UDP transmit");
            };
            let packet = TeredoPacket::parse(payload).unwrap();
            assert!(packet.is_bubble());
            assert_eq!(packet.source(), our_addr());
            assert_eq!(packet.destination(), peer_addr());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_bubble_establishes_path_and_flushes_fifo() {
        let relay = client_relay(false);
        let mapped = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9000);

        for marker in 1..=3 {
            relay
                .handle_tunnel_input(&data_packet(our_addr(), peer_addr(), marker))
                .unwrap();
        }

        let transmits = relay
            .handle_udp_input(&bubble(peer_addr(), our_addr()), mapped)
            .unwrap();

        // All queued payloads are released to the peer, oldest first.
        assert_eq!(udp_destinations(&transmits), vec![mapped; 3]);
        let markers = transmits
            .iter()
            .map(|t| match t {
                Transmit::Udp { payload, .. } => {
                    let packet = TeredoPacket::parse(payload).unwrap();
                    packet.payload()[8]
                }
                Transmit::Tunnel { .. } => panic!("expected UDP transmit"),
            })
            .collect::<Vec<_>>();
        assert_eq!(markers, vec![1, 2, 3]);

        // Follow-up traffic goes straight to the mapped endpoint.
        let transmits = relay
            .handle_tunnel_input(&data_packet(our_addr(), peer_addr(), 4))
            .unwrap();
        assert_eq!(udp_destinations(&transmits), vec![mapped]);
    }

    #[tokio::test(start_paused = true)]
    async fn indirect_bubble_is_answered_directly() {
        let relay = client_relay(false);
        let peer_mapped = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9000);

        // Bubble relayed by our server, origin indication attached.
        let mut buf = teredo_proto::origin_indication(peer_mapped).to_vec();
        buf.extend_from_slice(&bubble(peer_addr(), our_addr()));

        let transmits = relay
            .handle_udp_input(&buf, SocketAddrV4::new(OUR_SERVER, TEREDO_PORT))
            .unwrap();

        assert_eq!(udp_destinations(&transmits), vec![peer_mapped]);
        let Transmit::Udp { payload, .. } = &transmits[0] else {
            panic!("expected UDP transmit");
        };
        let reply = TeredoPacket::parse(payload).unwrap();
        assert!(reply.is_bubble());
        assert_eq!(reply.destination(), peer_addr());
    }

    #[tokio::test(start_paused = true)]
    async fn spoofed_source_is_dropped() {
        let relay = client_relay(false);

        // IPv6 source embeds 198.51.100.7:40000 but the datagram arrived
        // from a different host.
        let src6 = TeredoAddr {
            prefix: TEREDO_PREFIX,
            server: PEER_SERVER,
            flags: 0,
            port: 40000,
            client: Ipv4Addr::new(198, 51, 100, 7),
        }
        .to_ipv6();

        let result = relay.handle_udp_input(
            &bubble(src6, our_addr()),
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 200), 40000),
        );

        assert!(matches!(result, Err(Rejected::Spoofed)));
        assert!(relay.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bubbles_are_paced_and_capped() {
        let relay = client_relay(false);
        let packet = data_packet(our_addr(), peer_addr(), 1);

        // First attempt fires immediately.
        assert_eq!(relay.handle_tunnel_input(&packet).unwrap().len(), 2);

        // Within the 2 s pacing window nothing more is sent.
        assert_eq!(relay.handle_tunnel_input(&packet).unwrap().len(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(relay.handle_tunnel_input(&packet).unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(relay.handle_tunnel_input(&packet).unwrap().len(), 2);

        // The fourth due attempt gives up and drops the peer.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            relay.handle_tunnel_input(&packet),
            Err(Rejected::Unreachable)
        ));
        assert!(relay.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn native_destination_is_pinged_via_server() {
        let relay = client_relay(false);
        let native: Ipv6Addr = "2001:db8::1".parse().unwrap();

        let transmits = relay
            .handle_tunnel_input(&data_packet(our_addr(), native, 1))
            .unwrap();

        assert_eq!(
            udp_destinations(&transmits),
            vec![SocketAddrV4::new(OUR_SERVER, TEREDO_PORT)]
        );

        let Transmit::Udp { payload, .. } = &transmits[0] else {
            panic!("expected UDP transmit");
        };
        let ping = TeredoPacket::parse(payload).unwrap();
        assert!(ping.is_icmpv6());
        assert_eq!(ping.destination(), native);

        // Mirror the request into a reply arriving from some relay.
        let mut reply = payload.clone();
        // Swap source and destination, flip the ICMPv6 type.
        reply[8..24].copy_from_slice(&native.octets());
        reply[24..40].copy_from_slice(&our_addr().octets());
        reply[40] = 129;

        let relay_endpoint = SocketAddrV4::new(Ipv4Addr::new(198, 18, 0, 1), 3545);
        relay.handle_udp_input(&reply, relay_endpoint).unwrap();

        // The relay path is now trusted; payloads flow to the relay.
        let transmits = relay
            .handle_tunnel_input(&data_packet(our_addr(), native, 2))
            .unwrap();
        assert_eq!(udp_destinations(&transmits), vec![relay_endpoint]);

        // And traffic from the native peer over that path is delivered.
        let inbound = data_packet(native, our_addr(), 3);
        let transmits = relay.handle_udp_input(&inbound, relay_endpoint).unwrap();
        assert_eq!(
            transmits,
            vec![Transmit::Tunnel { packet: inbound }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn native_source_without_trusted_path_is_dropped() {
        let relay = client_relay(false);
        let native: Ipv6Addr = "2001:db8::1".parse().unwrap();

        let result = relay.handle_udp_input(
            &data_packet(native, our_addr(), 1),
            SocketAddrV4::new(Ipv4Addr::new(198, 18, 0, 1), 3545),
        );

        assert!(matches!(result, Err(Rejected::NoTrustedPath)));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_bubble_registers_trusted_peer() {
        let relay = client_relay(true);

        let neighbor = TeredoAddr {
            prefix: TEREDO_PREFIX,
            server: PEER_SERVER,
            flags: 0,
            port: 3545,
            client: Ipv4Addr::new(192, 168, 1, 7),
        }
        .to_ipv6();
        let lan_endpoint = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 3545);

        relay
            .handle_udp_input(&bubble(neighbor, ALL_NODES), lan_endpoint)
            .unwrap();

        // The neighbor's private mapped address is acceptable because it was
        // learned on the local link.
        let transmits = relay
            .handle_tunnel_input(&data_packet(our_addr(), neighbor, 1))
            .unwrap();
        assert_eq!(udp_destinations(&transmits), vec![lan_endpoint]);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_bubble_ignored_when_disabled() {
        let relay = client_relay(false);

        let result = relay.handle_udp_input(
            &bubble(peer_addr(), ALL_NODES),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 3545),
        );

        assert!(matches!(result, Err(Rejected::DiscoveryDisabled)));
    }

    #[tokio::test(start_paused = true)]
    async fn advertisements_reach_the_maintenance_procedure() {
        let relay = client_relay(false);
        let maintenance = Arc::new(Maintenance::new(
            Clock::new(),
            Arc::new(TokenKeys::new()),
            MaintenanceConfig::new("teredo.example.net"),
            Box::new(|_, _| {}),
            Box::new(|_| {}),
        ));
        relay.attach_maintenance(maintenance);

        let buf = teredo_proto::router_solicitation([7; 8]);

        // An authenticated packet is routed to maintenance, which rejects it
        // here because no solicitation is pending.
        let result = relay.handle_udp_input(&buf, SocketAddrV4::new(OUR_SERVER, TEREDO_PORT));

        assert!(matches!(
            result,
            Err(Rejected::Advertisement(RaError::NotSoliciting))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_packet_without_maintenance_is_dropped() {
        let relay = client_relay(false);

        let result = relay.handle_udp_input(
            &teredo_proto::router_solicitation([7; 8]),
            SocketAddrV4::new(OUR_SERVER, TEREDO_PORT),
        );

        assert!(matches!(result, Err(Rejected::UnexpectedAuth)));
    }
}
