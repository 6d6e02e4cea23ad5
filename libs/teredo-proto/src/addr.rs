use std::net::{Ipv4Addr, Ipv6Addr};

/// Canonical Teredo service prefix, `2001:0000::/32`.
pub const TEREDO_PREFIX: u32 = 0x2001_0000;
/// Obsolete (6bone-era) Teredo prefix, `3ffe:831f::/32`.
pub const TEREDO_PREFIX_OBSOLETE: u32 = 0x3ffe_831f;

/// Deprecated cone-NAT flag; never set by this implementation.
pub const FLAG_CONE: u16 = 0x8000;
/// Bits of the flags field available for randomization.
pub const RANDOM_MASK: u16 = 0x3cff;

/// A Teredo endpoint, decomposed from its IPv6 address form.
///
/// The address packs five components:
///
/// ```text
/// +-------------+-------------+-------+------+-------------+
/// | Prefix      | Server IPv4 | Flags | Port | Client IPv4 |
/// +-------------+-------------+-------+------+-------------+
/// ```
///
/// The mapped UDP port and mapped client IPv4 are stored obfuscated (each bit
/// inverted) so that naive NATs do not rewrite them in transit. This struct
/// always holds the de-obfuscated values; [`TeredoAddr::to_ipv6`] and
/// [`TeredoAddr::from_ipv6`] apply and remove the obfuscation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeredoAddr {
    pub prefix: u32,
    pub server: Ipv4Addr,
    pub flags: u16,
    pub port: u16,
    pub client: Ipv4Addr,
}

impl TeredoAddr {
    pub fn from_ipv6(ip: Ipv6Addr) -> Option<Self> {
        if !is_teredo(&ip) {
            return None;
        }

        Some(Self {
            prefix: u32::from_be_bytes(first_chunk(&ip.octets(), 0)),
            server: teredo_server(&ip),
            flags: teredo_flags(&ip),
            port: teredo_client_port(&ip),
            client: teredo_client_ipv4(&ip),
        })
    }

    pub fn to_ipv6(self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0..4].copy_from_slice(&self.prefix.to_be_bytes());
        octets[4..8].copy_from_slice(&self.server.octets());
        octets[8..10].copy_from_slice(&self.flags.to_be_bytes());
        octets[10..12].copy_from_slice(&(!self.port).to_be_bytes());
        octets[12..16].copy_from_slice(&(!u32::from(self.client)).to_be_bytes());

        Ipv6Addr::from(octets)
    }
}

pub fn is_valid_teredo_prefix(prefix: u32) -> bool {
    prefix == TEREDO_PREFIX || prefix == TEREDO_PREFIX_OBSOLETE
}

pub fn is_teredo(ip: &Ipv6Addr) -> bool {
    is_valid_teredo_prefix(u32::from_be_bytes(first_chunk(&ip.octets(), 0)))
}

/// Teredo server embedded in `ip` (octets 4-8, not obfuscated).
pub fn teredo_server(ip: &Ipv6Addr) -> Ipv4Addr {
    Ipv4Addr::from(first_chunk(&ip.octets(), 4))
}

pub fn teredo_flags(ip: &Ipv6Addr) -> u16 {
    let octets = ip.octets();
    u16::from_be_bytes([octets[8], octets[9]])
}

/// Mapped UDP port embedded in `ip`, de-obfuscated.
pub fn teredo_client_port(ip: &Ipv6Addr) -> u16 {
    let octets = ip.octets();
    !u16::from_be_bytes([octets[10], octets[11]])
}

/// Mapped client IPv4 embedded in `ip`, de-obfuscated.
pub fn teredo_client_ipv4(ip: &Ipv6Addr) -> Ipv4Addr {
    Ipv4Addr::from(!u32::from_be_bytes(first_chunk(&ip.octets(), 12)))
}

/// Does `ip` embed exactly the mapped endpoint `(ipv4, port)`?
pub fn matches_teredo_client(ip: &Ipv6Addr, ipv4: Ipv4Addr, port: u16) -> bool {
    teredo_client_ipv4(ip) == ipv4 && teredo_client_port(ip) == port
}

fn first_chunk<const N: usize>(octets: &[u8; 16], at: usize) -> [u8; N] {
    let mut chunk = [0u8; N];
    chunk.copy_from_slice(&octets[at..at + N]);
    chunk
}

/// Is `ip` usable as a public Internet unicast address?
///
/// Rejects the unspecified/loopback nets, RFC 1918 and link-local space, the
/// 6to4 anycast net and all of the class D (multicast) and E ranges.
pub fn is_ipv4_global_unicast(ip: Ipv4Addr) -> bool {
    let ip = u32::from(ip);

    if ip & 0x8000_0000 == 0 {
        // Forbidden class A nets: 0.0.0.0/8, 10.0.0.0/8 and 127.0.0.0/8.
        let net = ip & 0xff00_0000;
        return net != 0x0a00_0000 && net != 0x7f00_0000 && net != 0;
    }

    if ip & 0x4000_0000 == 0 {
        // Forbidden class B nets: 169.254.0.0/16, 172.16.0.0/12.
        return (ip & 0xffff_0000) != 0xa9fe_0000 && (ip & 0xfff0_0000) != 0xac10_0000;
    }

    if ip & 0x2000_0000 == 0 {
        // Forbidden class C nets: 192.168.0.0/16, 192.88.99.0/24.
        return (ip & 0xffff_0000) != 0xc0a8_0000 && (ip & 0xffff_ff00) != 0xc058_6200;
    }

    // Class D (multicast) and class E.
    false
}

/// Is `ip` in one of the private or link-local IPv4 ranges?
pub fn is_ipv4_private_unicast(ip: Ipv4Addr) -> bool {
    let ip = u32::from(ip);

    (ip & 0xff00_0000) == 0x0a00_0000
        || (ip & 0xfff0_0000) == 0xac10_0000
        || (ip & 0xffff_0000) == 0xc0a8_0000
        || (ip & 0xffff_0000) == 0xa9fe_0000
}
