//! OS-specific lookups that the engines treat as collaborators.

use teredo_tunnel::NetInterface;

/// Enumerates interfaces carrying an IPv4 address, with their multicast
/// capability. Interfaces with several addresses appear once per address.
#[cfg(target_os = "linux")]
pub fn list_interfaces() -> Vec<NetInterface> {
    use nix::net::if_::InterfaceFlags;

    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {e}");
            return Vec::new();
        }
    };

    addrs
        .filter_map(|ifaddr| {
            let ipv4 = ifaddr.address?.as_sockaddr_in()?.ip();

            Some(NetInterface {
                name: ifaddr.interface_name,
                ipv4,
                multicast: ifaddr.flags.contains(InterfaceFlags::IFF_MULTICAST),
            })
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn list_interfaces() -> Vec<NetInterface> {
    Vec::new()
}
