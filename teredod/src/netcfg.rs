use std::net::Ipv6Addr;

/// Interface configuration normally delegated to a privileged helper:
/// assigning the qualified Teredo address and routing IPv6 through the
/// tunnel.
pub trait NetConfigurator: Send + Sync {
    fn set_address(&self, addr: Ipv6Addr);
    fn set_route(&self, prefix: Ipv6Addr, prefix_len: u8);
}

/// Logs the intended configuration instead of applying it, for running
/// unprivileged or when an out-of-band hook owns the interface.
pub struct LogConfigurator {
    ifname: String,
}

impl LogConfigurator {
    pub fn new(ifname: String) -> Self {
        Self { ifname }
    }
}

impl NetConfigurator for LogConfigurator {
    fn set_address(&self, addr: Ipv6Addr) {
        tracing::info!(ifname = %self.ifname, %addr, "Assign the Teredo address");
    }

    fn set_route(&self, prefix: Ipv6Addr, prefix_len: u8) {
        tracing::info!(
            ifname = %self.ifname,
            route = %format_args!("{prefix}/{prefix_len}"),
            "Route IPv6 through the tunnel"
        );
    }
}
