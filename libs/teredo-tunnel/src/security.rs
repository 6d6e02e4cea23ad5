use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::net::{Ipv4Addr, Ipv6Addr};

type HmacSha256 = Hmac<Sha256>;

/// Width of one ping-cookie validity window.
const COOKIE_WINDOW_SECS: u64 = 30;

/// The process-wide keyed token generator.
///
/// One instance is created at startup from the OS random source and shared by
/// every component; tokens cannot be predicted or replayed across processes.
pub struct TokenKeys {
    key: [u8; 32],
}

impl TokenKeys {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        Self { key }
    }

    /// Nonce binding a Router Solicitation to the Router Advertisement we
    /// expect back from `(server, port)`.
    pub fn nonce(&self, timestamp: u64, server: Ipv4Addr, port: u16) -> [u8; 8] {
        let mut mac = self.mac(b"solicit");
        mac.update(&timestamp.to_be_bytes());
        mac.update(&server.octets());
        mac.update(&port.to_be_bytes());

        truncate(&mac.finalize().into_bytes())
    }

    /// Cookie carried in an ICMPv6 Echo Request so the returning reply can be
    /// validated without per-peer state.
    pub fn ping_cookie(&self, now: u64, local: Ipv6Addr, peer: Ipv6Addr) -> [u8; 4] {
        self.cookie_for_window(now / COOKIE_WINDOW_SECS, local, peer)
    }

    /// Accepts cookies from the current and the immediately preceding
    /// window, giving them a lifetime of 30 to 60 seconds.
    pub fn check_ping_cookie(
        &self,
        cookie: [u8; 4],
        now: u64,
        local: Ipv6Addr,
        peer: Ipv6Addr,
    ) -> bool {
        let window = now / COOKIE_WINDOW_SECS;

        if cookie == self.cookie_for_window(window, local, peer) {
            return true;
        }

        window > 0 && cookie == self.cookie_for_window(window - 1, local, peer)
    }

    /// Keyed pseudo-random bits derived from a coarse timestamp; used for
    /// the Teredo flag randomization and the discovery interval jitter.
    pub fn flag_bits(&self, timestamp: u64) -> u16 {
        let mut mac = self.mac(b"flags");
        mac.update(&timestamp.to_be_bytes());

        let bits: [u8; 2] = truncate(&mac.finalize().into_bytes());
        u16::from_be_bytes(bits)
    }

    fn cookie_for_window(&self, window: u64, local: Ipv6Addr, peer: Ipv6Addr) -> [u8; 4] {
        let mut mac = self.mac(b"ping");
        mac.update(&window.to_be_bytes());
        mac.update(&local.octets());
        mac.update(&peer.octets());

        truncate(&mac.finalize().into_bytes())
    }

    fn mac(&self, label: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(label);

        mac
    }
}

impl Default for TokenKeys {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate<const N: usize>(digest: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&digest[..N]);

    out
}
