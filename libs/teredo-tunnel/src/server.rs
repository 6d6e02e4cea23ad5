use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};
use teredo_proto::{
    is_ipv4_global_unicast, is_teredo, matches_teredo_client, origin_indication,
    router_advertisement, teredo_client_ipv4, teredo_client_port, teredo_flags, teredo_server,
    ParseError, RouterAdvertParams, TeredoPacket, ALL_ROUTERS, FLAG_CONE,
};

/// An I/O action requested by the server datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTx {
    Udp {
        dst: SocketAddrV4,
        /// Send from the secondary server address.
        secondary: bool,
        payload: Vec<u8>,
    },
    /// Hand the packet to the native IPv6 side.
    Tunnel {
        packet: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ServerDrop {
    #[error(transparent)]
    Malformed(#[from] ParseError),
    #[error("client source address is not global unicast")]
    NonGlobalSource,
    #[error("only bubbles and ICMPv6 pass through the server")]
    DisallowedProtocol,
    #[error("solicitation carries no authentication header")]
    UnauthenticatedSolicitation,
    #[error("source address does not match the observed endpoint")]
    Spoofed,
    #[error("destination embeds a non-global client address")]
    UnroutableClient,
}

/// Server-side handling of one Teredo datagram.
///
/// The server qualifies clients (Router Solicitation in, Router
/// Advertisement out) and forwards bubbles and ICMPv6 between its clients,
/// other Teredo peers and the native IPv6 Internet. It keeps no per-client
/// state at all.
pub struct ServerState {
    server_ip: Ipv4Addr,
    prefix: u32,
    mtu: u16,
}

impl ServerState {
    pub fn new(server_ip: Ipv4Addr, prefix: u32, mtu: u16) -> Self {
        Self {
            server_ip,
            prefix,
            mtu,
        }
    }

    pub fn handle_datagram(
        &self,
        buf: &[u8],
        src: SocketAddrV4,
        on_secondary: bool,
    ) -> Result<Vec<ServerTx>, ServerDrop> {
        if !is_ipv4_global_unicast(*src.ip()) {
            return Err(ServerDrop::NonGlobalSource);
        }

        let packet = TeredoPacket::parse(buf)?;

        if !packet.is_bubble() && !packet.is_icmpv6() {
            return Err(ServerDrop::DisallowedProtocol);
        }

        let src6 = packet.source();
        let dst6 = packet.destination();

        // A Router Solicitation from a link-local source earns a Router
        // Advertisement telling the client its mapped endpoint.
        if is_link_local(&src6) && dst6 == ALL_ROUTERS && packet.is_router_solicitation() {
            let nonce = packet
                .auth
                .ok_or(ServerDrop::UnauthenticatedSolicitation)?
                .nonce;

            // Cone clients probe by expecting the reply from the other
            // server address.
            let use_secondary = on_secondary ^ (teredo_flags(&src6) & FLAG_CONE != 0);

            let advert = router_advertisement(&RouterAdvertParams {
                nonce,
                dest: src6,
                client: src,
                prefix: self.prefix,
                server_ip: self.server_ip,
                mtu: self.mtu,
            });

            tracing::debug!(client = %src, "Router Advertisement sent");

            return Ok(vec![ServerTx::Udp {
                dst: src,
                secondary: use_secondary,
                payload: advert,
            }]);
        }

        // Anything else must either originate from the endpoint its Teredo
        // source claims, or target one of our own clients from the outside.
        if !matches_teredo_client(&src6, *src.ip(), src.port())
            && (is_teredo(&src6) || !(is_teredo(&dst6) && teredo_server(&dst6) == self.server_ip))
        {
            return Err(ServerDrop::Spoofed);
        }

        if is_teredo(&dst6) {
            let client = SocketAddrV4::new(teredo_client_ipv4(&dst6), teredo_client_port(&dst6));

            if !is_ipv4_global_unicast(*client.ip()) {
                return Err(ServerDrop::UnroutableClient);
            }

            // Our own clients learn the sender's endpoint from an origin
            // indication so they can answer directly.
            let mut payload = Vec::with_capacity(8 + packet.ipv6_packet().len());
            if teredo_server(&dst6) == self.server_ip {
                payload.extend_from_slice(&origin_indication(src));
            }
            payload.extend_from_slice(packet.ipv6_packet());

            tracing::debug!(%client, "Forwarding packet over Teredo");

            return Ok(vec![ServerTx::Udp {
                dst: client,
                secondary: false,
                payload,
            }]);
        }

        Ok(vec![ServerTx::Tunnel {
            packet: packet.ipv6_packet().to_vec(),
        }])
    }
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use teredo_proto::{
        bubble, parse_router_advertisement, router_solicitation, TeredoAddr, CLIENT_LINK_LOCAL,
        TEREDO_PREFIX,
    };

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

    fn server() -> ServerState {
        ServerState::new(SERVER_IP, TEREDO_PREFIX, 1280)
    }

    fn client_addr(ip: [u8; 4], port: u16) -> Ipv6Addr {
        TeredoAddr {
            prefix: TEREDO_PREFIX,
            server: SERVER_IP,
            flags: 0,
            port,
            client: Ipv4Addr::from(ip),
        }
        .to_ipv6()
    }

    #[test]
    fn solicitation_earns_advertisement() {
        let client = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);

        let out = server()
            .handle_datagram(&router_solicitation(*b"noncenon"), client, false)
            .unwrap();

        let [ServerTx::Udp {
            dst,
            secondary,
            payload,
        }] = &out[..]
        else {
            panic!("expected a single UDP reply");
        };
        assert_eq!(*dst, client);
        assert!(!secondary);

        let packet = TeredoPacket::parse(payload).unwrap();
        assert_eq!(packet.auth.unwrap().nonce, *b"noncenon");
        assert_eq!(packet.origin, Some(client));
        assert_eq!(packet.destination(), CLIENT_LINK_LOCAL);

        let ra = parse_router_advertisement(&packet).unwrap();
        assert_eq!(ra.addr.server, SERVER_IP);
        assert_eq!(ra.addr.client, *client.ip());
        assert_eq!(ra.addr.port, client.port());
        assert_eq!(ra.mtu, 1280);
    }

    #[test]
    fn cone_flag_flips_the_reply_address() {
        // A solicitation whose link-local source carries the cone flag.
        let mut rs = router_solicitation([1; 8]);
        let flags_at = 13 + 8 + 8; // auth header, then IPv6 src octets 8-9
        rs[flags_at] |= 0x80;

        let client = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);
        let out = server().handle_datagram(&rs, client, false).unwrap();

        let [ServerTx::Udp { secondary, .. }] = &out[..] else {
            panic!("expected a single UDP reply");
        };
        assert!(*secondary);
    }

    #[test]
    fn rejects_non_global_sources() {
        let result = server().handle_datagram(
            &router_solicitation([1; 8]),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 40000),
            false,
        );

        assert!(matches!(result, Err(ServerDrop::NonGlobalSource)));
    }

    #[test]
    fn only_bubbles_and_icmpv6_pass() {
        // A bubble whose next-header field claims UDP is neither.
        let mut packet = bubble(
            client_addr([198, 51, 100, 7], 40000),
            client_addr([198, 51, 100, 9], 40001),
        );
        packet[6] = 17;

        let result = server().handle_datagram(
            &packet,
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000),
            false,
        );

        assert!(matches!(result, Err(ServerDrop::DisallowedProtocol)));
    }

    #[test]
    fn forwards_between_clients_with_origin_indication() {
        let sender = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);
        let sender6 = client_addr([198, 51, 100, 7], 40000);
        let receiver6 = client_addr([198, 51, 100, 9], 40001);

        let out = server()
            .handle_datagram(&bubble(sender6, receiver6), sender, false)
            .unwrap();

        let [ServerTx::Udp { dst, payload, .. }] = &out[..] else {
            panic!("expected a single UDP forward");
        };
        assert_eq!(
            *dst,
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 40001)
        );

        let forwarded = TeredoPacket::parse(payload).unwrap();
        assert_eq!(forwarded.origin, Some(sender));
        assert!(forwarded.is_bubble());
    }

    #[test]
    fn foreign_clients_get_no_origin_indication() {
        let sender = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);
        let sender6 = client_addr([198, 51, 100, 7], 40000);

        // Destination is served by some other Teredo server.
        let receiver6 = TeredoAddr {
            prefix: TEREDO_PREFIX,
            server: Ipv4Addr::new(203, 0, 113, 9),
            flags: 0,
            port: 40001,
            client: Ipv4Addr::new(198, 51, 100, 9),
        }
        .to_ipv6();

        let out = server()
            .handle_datagram(&bubble(sender6, receiver6), sender, false)
            .unwrap();

        let [ServerTx::Udp { payload, .. }] = &out[..] else {
            panic!("expected a single UDP forward");
        };
        assert!(TeredoPacket::parse(payload).unwrap().origin.is_none());
    }

    #[test]
    fn spoofed_client_source_is_dropped() {
        let sender6 = client_addr([198, 51, 100, 7], 40000);
        let receiver6 = client_addr([198, 51, 100, 9], 40001);

        // Claimed endpoint does not match the observed one.
        let result = server().handle_datagram(
            &bubble(sender6, receiver6),
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 200), 40000),
            false,
        );

        assert!(matches!(result, Err(ServerDrop::Spoofed)));
    }

    #[test]
    fn outside_packets_may_reach_our_clients() {
        // A native host pings one of our clients through us; the source is
        // not Teredo, the destination is ours.
        let native: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let receiver6 = client_addr([198, 51, 100, 9], 40001);

        let ping = teredo_proto::echo_request(native, receiver6, [0; 4]);
        let out = server()
            .handle_datagram(
                &ping,
                SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 44), 3545),
                false,
            )
            .unwrap();

        let [ServerTx::Udp { dst, payload, .. }] = &out[..] else {
            panic!("expected a single UDP forward");
        };
        assert_eq!(
            *dst,
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 40001)
        );
        assert!(TeredoPacket::parse(payload).unwrap().origin.is_some());
    }

    #[test]
    fn teredo_traffic_to_native_hosts_reaches_the_tunnel() {
        let sender = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);
        let sender6 = client_addr([198, 51, 100, 7], 40000);
        let native: Ipv6Addr = "2001:db8::1".parse().unwrap();

        let ping = teredo_proto::echo_request(sender6, native, [0; 4]);
        let out = server().handle_datagram(&ping, sender, false).unwrap();

        assert_eq!(out, vec![ServerTx::Tunnel { packet: ping }]);
    }
}
