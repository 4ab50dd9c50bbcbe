//! Helpers for looking up the addresses of local network interfaces.

use std::collections::HashSet;
use std::net::IpAddr;

/// Interface flag for "administratively up", identical across unixes.
const IFF_UP: u32 = 0x1;

/// The regular and loopback addresses of the local interfaces that are up.
#[derive(Debug, Clone, Default)]
pub struct LocalAddresses {
    /// Loopback addresses.
    pub loopback: Vec<IpAddr>,
    /// Non-loopback addresses of interfaces that are up.
    pub regular: Vec<IpAddr>,
}

impl LocalAddresses {
    /// Enumerates the addresses of the currently configured interfaces.
    pub fn new() -> Self {
        let ifaces = default_net::get_interfaces();

        let mut loopback = Vec::new();
        let mut regular = Vec::new();
        let mut seen = HashSet::new();

        for iface in ifaces {
            if iface.flags & IFF_UP == 0 {
                continue;
            }
            let addrs = iface
                .ipv4
                .iter()
                .map(|a| IpAddr::V4(a.addr))
                .chain(iface.ipv6.iter().map(|a| IpAddr::V6(a.addr)));
            for ip in addrs {
                if !seen.insert(ip) {
                    continue;
                }
                if ip.is_loopback() {
                    loopback.push(ip);
                } else if ip.is_unspecified() || ip.is_multicast() {
                    continue;
                } else if let IpAddr::V6(v6) = ip {
                    if crate::net::ip::is_unicast_link_local(v6) {
                        // Not dialable without a zone id.
                        continue;
                    }
                    regular.push(ip);
                } else {
                    regular.push(ip);
                }
            }
        }

        LocalAddresses { loopback, regular }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_addresses() {
        let addrs = LocalAddresses::new();
        // Every machine has at least a loopback interface.
        assert!(!addrs.loopback.is_empty() || !addrs.regular.is_empty());
        for ip in &addrs.regular {
            assert!(!ip.is_loopback(), "loopback {ip} in regular set");
        }
    }
}
