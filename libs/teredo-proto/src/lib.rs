#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Wire-level types for the Teredo tunneling protocol (RFC 4380): address
//! composition and extraction, IPv4 scope predicates and the UDP
//! encapsulation codec.

mod addr;
mod packet;

pub use addr::{
    is_ipv4_global_unicast, is_ipv4_private_unicast, is_teredo, is_valid_teredo_prefix,
    matches_teredo_client, teredo_client_ipv4, teredo_client_port, teredo_flags, teredo_server,
    TeredoAddr, FLAG_CONE, RANDOM_MASK, TEREDO_PREFIX, TEREDO_PREFIX_OBSOLETE,
};
pub use packet::{
    bubble, echo_reply_cookie, echo_request, origin_indication, parse_router_advertisement,
    router_advertisement, router_solicitation, AuthHeader, ParseError, RouterAdvert,
    RouterAdvertParams, TeredoPacket, ND_ROUTER_ADVERT, ND_ROUTER_SOLICIT,
};

use std::net::{Ipv4Addr, Ipv6Addr};

/// UDP port on which Teredo servers listen.
pub const TEREDO_PORT: u16 = 3544;

/// IPv4 multicast group for local client discovery.
pub const DISCOVERY_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 253);

/// All-nodes link-local multicast address, the destination of discovery
/// bubbles.
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// All-routers link-local multicast address, the destination of Router
/// Solicitations.
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Link-local source address used in our Router Solicitations.
///
/// The server addresses the matching Router Advertisement back to it.
pub const CLIENT_LINK_LOCAL: Ipv6Addr =
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0xffff, 0xffff, 0xfffe);

/// Link-local source address of server-emitted Router Advertisements.
pub const SERVER_LINK_LOCAL: Ipv6Addr =
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0x8000, 0xf227, 0xbffb, 0xe6ad);
