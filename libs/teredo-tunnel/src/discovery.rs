use crate::{Clock, Relay, TokenKeys};
use std::net::Ipv4Addr;
use std::sync::Arc;
use teredo_proto::{bubble, is_ipv4_private_unicast, ALL_NODES};

/// One network interface as reported by the OS collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub multicast: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Only announce on interfaces whose name matches.
    pub ifname: Option<regex::Regex>,
    /// Announce even on interfaces without a private IPv4 address.
    pub forced: bool,
}

/// Interfaces suitable for local discovery: multicast-capable, matching the
/// optional name filter and (unless forced) carrying a private IPv4 address,
/// which is the usual sign of sitting behind the same NAT as our neighbors.
pub fn eligible_interfaces(
    interfaces: Vec<NetInterface>,
    cfg: &DiscoveryConfig,
) -> Vec<NetInterface> {
    interfaces
        .into_iter()
        .filter(|iface| {
            iface.multicast
                && cfg
                    .ifname
                    .as_ref()
                    .is_none_or(|re| re.is_match(&iface.name))
                && (cfg.forced || is_ipv4_private_unicast(iface.ipv4))
        })
        .collect()
}

/// Sends one multicast datagram to the discovery group out of the given
/// interface.
pub type MulticastSend = Box<dyn Fn(&NetInterface, Vec<u8>) + Send + Sync>;

/// Handle on the local-discovery announcer; dropping it stops the task.
///
/// Reception needs no task of its own: discovery bubbles arrive on the
/// shared UDP reader, which registers their senders with the relay.
pub struct Discovery {
    sender: tokio::task::JoinHandle<()>,
}

impl Discovery {
    /// Announces our presence with a discovery bubble on every eligible
    /// interface, at a jittered interval of 200 to 299 seconds.
    pub fn spawn(
        clock: Clock,
        keys: Arc<TokenKeys>,
        relay: Arc<Relay>,
        interfaces: Vec<NetInterface>,
        send: MulticastSend,
    ) -> Self {
        let sender = tokio::spawn(async move {
            loop {
                let state = relay.state();

                // Nothing to announce until qualification gives us an
                // address.
                if state.up {
                    for iface in &interfaces {
                        send(iface, bubble(state.addr, ALL_NODES));
                    }
                }

                let interval = announce_interval(keys.flag_bits(clock.now()));
                clock.sleep(std::time::Duration::from_secs(interval)).await;
            }
        });

        Self { sender }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.sender.abort();
    }
}

fn announce_interval(bits: u16) -> u64 {
    200 + u64::from(bits % 100)
}
