use crate::addr::{is_valid_teredo_prefix, TeredoAddr};
use crate::{ALL_ROUTERS, CLIENT_LINK_LOCAL, SERVER_LINK_LOCAL};
use etherparse::{Icmpv6Type, IpNumber, Ipv6FlowLabel, Ipv6Header, Ipv6HeaderSlice, PacketBuilder};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;

const ICMP6_ECHO_REPLY: u8 = 129;

/// Encapsulation header codes; each header starts with a zero byte followed
/// by its code.
const AUTH_HDR: u8 = 0x01;
const ORIGIN_HDR: u8 = 0x00;

/// Default IPv6 MTU, also the minimum a Router Advertisement may announce.
const MIN_MTU: u16 = 1280;

/// IPv6 "no next header" protocol number; bubbles carry nothing else.
const NO_NEXT_HEADER: IpNumber = IpNumber(59);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated authentication header")]
    TruncatedAuthHeader,
    #[error("no valid IPv6 header after the encapsulation headers")]
    BadIpv6Header,
    #[error("IPv6 payload length does not match the datagram")]
    LengthMismatch,
}

/// Authentication encapsulation header, as found on Router Advertisements
/// (and echoed on our Router Solicitations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHeader {
    pub nonce: [u8; 8],
    pub confirmation: u8,
    /// Set when the header carries client-id / authentication data we are not
    /// configured to verify, or a non-zero confirmation byte.
    pub fail: bool,
}

/// Parsed view over one Teredo UDP payload.
///
/// The encapsulation may start with an authentication header and/or an
/// origin-indication header, followed by a plain IPv6 packet.
#[derive(Debug)]
pub struct TeredoPacket<'a> {
    pub auth: Option<AuthHeader>,
    /// De-obfuscated origin indication: the mapped endpoint of whoever sent
    /// this packet through the server.
    pub origin: Option<SocketAddrV4>,
    ipv6: Ipv6HeaderSlice<'a>,
    payload: &'a [u8],
    ipv6_bytes: &'a [u8],
}

impl<'a> TeredoPacket<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, ParseError> {
        let mut rest = buf;

        let auth = if rest.len() >= 2 && rest[0] == 0 && rest[1] == AUTH_HDR {
            let [_, _, id_len, au_len, ..] = *rest else {
                return Err(ParseError::TruncatedAuthHeader);
            };
            let skip = 4 + usize::from(id_len) + usize::from(au_len);

            let Some(nonce) = rest.get(skip..skip + 8) else {
                return Err(ParseError::TruncatedAuthHeader);
            };
            let nonce = <[u8; 8]>::try_from(nonce).expect("slice is 8 bytes");
            let Some(&confirmation) = rest.get(skip + 8) else {
                return Err(ParseError::TruncatedAuthHeader);
            };

            rest = &rest[skip + 9..];

            Some(AuthHeader {
                nonce,
                confirmation,
                fail: id_len != 0 || au_len != 0 || confirmation != 0,
            })
        } else {
            None
        };

        let origin = if rest.len() >= 8 && rest[0] == 0 && rest[1] == ORIGIN_HDR {
            let port = !u16::from_be_bytes([rest[2], rest[3]]);
            let ip = !u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);

            rest = &rest[8..];

            Some(SocketAddrV4::new(Ipv4Addr::from(ip), port))
        } else {
            None
        };

        let ipv6 = Ipv6HeaderSlice::from_slice(rest).map_err(|_| ParseError::BadIpv6Header)?;
        let payload = &rest[Ipv6Header::LEN..];

        if payload.len() != usize::from(ipv6.payload_length()) {
            return Err(ParseError::LengthMismatch);
        }

        Ok(Self {
            auth,
            origin,
            ipv6,
            payload,
            ipv6_bytes: rest,
        })
    }

    pub fn source(&self) -> Ipv6Addr {
        self.ipv6.source_addr()
    }

    pub fn destination(&self) -> Ipv6Addr {
        self.ipv6.destination_addr()
    }

    pub fn hop_limit(&self) -> u8 {
        self.ipv6.hop_limit()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// The IPv6 packet (header plus payload), with all Teredo encapsulation
    /// headers stripped.
    pub fn ipv6_packet(&self) -> &'a [u8] {
        self.ipv6_bytes
    }

    /// A bubble is an IPv6 packet with no payload and no next header.
    pub fn is_bubble(&self) -> bool {
        self.ipv6.next_header() == NO_NEXT_HEADER && self.payload.is_empty()
    }

    pub fn is_icmpv6(&self) -> bool {
        self.ipv6.next_header() == IpNumber::IPV6_ICMP
    }

    fn icmpv6_type(&self) -> Option<u8> {
        if self.ipv6.next_header() != IpNumber::IPV6_ICMP {
            return None;
        }

        // Type and code, then the checksum; anything shorter is not ICMPv6.
        if self.payload.len() < 4 || self.payload[1] != 0 {
            return None;
        }

        Some(self.payload[0])
    }

    pub fn is_router_advertisement(&self) -> bool {
        self.icmpv6_type() == Some(ND_ROUTER_ADVERT)
    }

    pub fn is_router_solicitation(&self) -> bool {
        self.icmpv6_type() == Some(ND_ROUTER_SOLICIT) && self.payload.len() >= 8
    }
}

/// Contents of an accepted Router Advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterAdvert {
    /// Our Teredo address as advertised: prefix and server from the prefix
    /// information option, mapped endpoint from the origin indication. Flags
    /// are zero; the caller randomizes them.
    pub addr: TeredoAddr,
    pub mtu: u16,
}

/// Extracts address and MTU from a Router Advertisement.
///
/// Requires an origin indication (without it we cannot learn our mapped
/// endpoint) and a prefix information option announcing a /64 under a valid
/// Teredo prefix. An absent MTU option means the default of 1280; an invalid
/// one rejects the advertisement.
pub fn parse_router_advertisement(packet: &TeredoPacket) -> Option<RouterAdvert> {
    if !packet.is_router_advertisement() {
        return None;
    }

    let origin = packet.origin?;

    // 16 bytes of RA header (ICMPv6 header, hop limit/flags/lifetimes).
    let mut options = packet.payload().get(16..)?;

    let mut prefix_and_server = None;
    let mut mtu = MIN_MTU;

    while !options.is_empty() {
        let &[kind, len, ..] = options else {
            return None;
        };
        let len = usize::from(len) * 8;
        if len == 0 || options.len() < len {
            return None;
        }

        match (kind, len) {
            // Prefix information: prefix length must cover exactly the
            // 64-bit Teredo client part.
            (3, 32) => {
                if options[2] != 64 {
                    return None;
                }

                let prefix = u32::from_be_bytes([
                    options[16],
                    options[17],
                    options[18],
                    options[19],
                ]);
                if !is_valid_teredo_prefix(prefix) {
                    return None;
                }

                let server = Ipv4Addr::new(options[20], options[21], options[22], options[23]);
                prefix_and_server = Some((prefix, server));
            }
            // MTU option; values below the IPv6 minimum are nonsense.
            (5, 8) => {
                let advertised = u32::from_be_bytes([
                    options[4],
                    options[5],
                    options[6],
                    options[7],
                ]);
                mtu = u16::try_from(advertised).ok().filter(|m| *m >= MIN_MTU)?;
            }
            _ => {}
        }

        options = &options[len..];
    }

    let (prefix, server) = prefix_and_server?;

    Some(RouterAdvert {
        addr: TeredoAddr {
            prefix,
            server,
            flags: 0,
            port: origin.port(),
            client: *origin.ip(),
        },
        mtu,
    })
}

/// Builds a bubble: an IPv6 header with no payload, used to open NAT
/// bindings.
pub fn bubble(src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
    let header = Ipv6Header {
        traffic_class: 0,
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length: 0,
        next_header: NO_NEXT_HEADER,
        hop_limit: 64,
        source: src.octets(),
        destination: dst.octets(),
    };

    let mut out = Vec::with_capacity(Ipv6Header::LEN);
    header.write(&mut out).expect("writing to a Vec never fails");

    out
}

/// Builds the origin-indication encapsulation header for `origin`.
pub fn origin_indication(origin: SocketAddrV4) -> [u8; 8] {
    let port = (!origin.port()).to_be_bytes();
    let ip = (!u32::from(*origin.ip())).to_be_bytes();

    [0, ORIGIN_HDR, port[0], port[1], ip[0], ip[1], ip[2], ip[3]]
}

fn auth_header(nonce: [u8; 8]) -> [u8; 13] {
    let mut hdr = [0u8; 13];
    hdr[1] = AUTH_HDR;
    // Bytes 2 and 3: empty client-id and authentication-data fields.
    hdr[4..12].copy_from_slice(&nonce);
    // Trailing confirmation byte stays zero.

    hdr
}

/// Builds a Router Solicitation bound to `nonce` by its authentication
/// header.
pub fn router_solicitation(nonce: [u8; 8]) -> Vec<u8> {
    let builder = PacketBuilder::ipv6(CLIENT_LINK_LOCAL.octets(), ALL_ROUTERS.octets(), 255)
        .icmpv6(Icmpv6Type::Unknown {
            type_u8: ND_ROUTER_SOLICIT,
            code_u8: 0,
            bytes5to8: [0; 4],
        });

    let mut out = Vec::with_capacity(13 + builder.size(0));
    out.extend_from_slice(&auth_header(nonce));
    builder
        .write(&mut out, &[])
        .expect("writing to a Vec never fails");

    out
}

pub struct RouterAdvertParams {
    /// Nonce echoed from the solicitation's authentication header.
    pub nonce: [u8; 8],
    /// IPv6 source of the solicitation; the advertisement is addressed back
    /// to it.
    pub dest: Ipv6Addr,
    /// Observed UDP endpoint of the soliciting client.
    pub client: SocketAddrV4,
    pub prefix: u32,
    pub server_ip: Ipv4Addr,
    pub mtu: u16,
}

/// Builds a server-side Router Advertisement: authentication echo, origin
/// indication, then an RA carrying a prefix-information option with
/// `prefix ‖ server_ip` and an MTU option.
pub fn router_advertisement(params: &RouterAdvertParams) -> Vec<u8> {
    let mut icmp_payload = Vec::with_capacity(8 + 32 + 8);

    // Reachable time and retransmission timer.
    icmp_payload.extend_from_slice(&0u32.to_be_bytes());
    icmp_payload.extend_from_slice(&2000u32.to_be_bytes());

    // Prefix information option: /64, autonomous, infinite lifetimes.
    icmp_payload.extend_from_slice(&[3, 4, 64, 0x40]);
    icmp_payload.extend_from_slice(&u32::MAX.to_be_bytes());
    icmp_payload.extend_from_slice(&u32::MAX.to_be_bytes());
    icmp_payload.extend_from_slice(&0u32.to_be_bytes());
    icmp_payload.extend_from_slice(&params.prefix.to_be_bytes());
    icmp_payload.extend_from_slice(&params.server_ip.octets());
    icmp_payload.extend_from_slice(&[0u8; 8]);

    // MTU option.
    icmp_payload.extend_from_slice(&[5, 1, 0, 0]);
    icmp_payload.extend_from_slice(&u32::from(params.mtu).to_be_bytes());

    let builder = PacketBuilder::ipv6(SERVER_LINK_LOCAL.octets(), params.dest.octets(), 255)
        .icmpv6(Icmpv6Type::Unknown {
            type_u8: ND_ROUTER_ADVERT,
            code_u8: 0,
            bytes5to8: [0; 4],
        });

    let mut out = Vec::with_capacity(13 + 8 + builder.size(icmp_payload.len()));
    out.extend_from_slice(&auth_header(params.nonce));
    out.extend_from_slice(&origin_indication(params.client));
    builder
        .write(&mut out, &icmp_payload)
        .expect("writing to a Vec never fails");

    out
}

/// Builds an ICMPv6 Echo Request carrying `cookie` as its whole payload.
pub fn echo_request(src: Ipv6Addr, dst: Ipv6Addr, cookie: [u8; 4]) -> Vec<u8> {
    let builder = PacketBuilder::ipv6(src.octets(), dst.octets(), 64).icmpv6_echo_request(0, 0);

    let mut out = Vec::with_capacity(builder.size(cookie.len()));
    builder
        .write(&mut out, &cookie)
        .expect("writing to a Vec never fails");

    out
}

/// If `packet` is an ICMPv6 Echo Reply, returns the leading 4 bytes of its
/// echo payload (where [`echo_request`] put the cookie).
pub fn echo_reply_cookie(packet: &TeredoPacket) -> Option<[u8; 4]> {
    if packet.icmpv6_type()? != ICMP6_ECHO_REPLY {
        return None;
    }

    // 4 bytes ICMPv6 header, 4 bytes identifier and sequence number.
    let cookie = packet.payload().get(8..12)?;

    Some(<[u8; 4]>::try_from(cookie).expect("slice is 4 bytes"))
}
