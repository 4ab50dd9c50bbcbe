//! IP address helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Converts a v4-mapped IPv6 address into its IPv4 form, leaving everything
/// else untouched.
pub fn to_canonical(ip: IpAddr) -> IpAddr {
    match ip {
        ip @ IpAddr::V4(_) => ip,
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(ip) => IpAddr::V4(ip),
            None => IpAddr::V6(ip),
        },
    }
}

/// Maps any address into the 16-byte IPv6 form used on the wire.
pub fn to_mapped_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    }
}

/// Whether this is a unicast link-local IPv6 address (fe80::/10).
///
/// These cannot be dialed without a zone identifier, so candidate lists
/// drop them.
pub const fn is_unicast_link_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Whether the address is the unspecified address of either family.
pub fn is_unspecified(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip == Ipv4Addr::UNSPECIFIED,
        IpAddr::V6(ip) => ip == Ipv6Addr::UNSPECIFIED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_canonical() {
        let v4: IpAddr = "10.1.2.3".parse().unwrap();
        let mapped: IpAddr = "::ffff:10.1.2.3".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(to_canonical(mapped), v4);
        assert_eq!(to_canonical(v4), v4);
        assert_eq!(to_canonical(v6), v6);
    }

    #[test]
    fn test_link_local() {
        assert!(is_unicast_link_local("fe80::1".parse().unwrap()));
        assert!(!is_unicast_link_local("2001:db8::1".parse().unwrap()));
    }
}
