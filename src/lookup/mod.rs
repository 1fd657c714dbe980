pub mod asn;
pub mod cache;
pub mod cloud;
pub mod external;
pub mod facility;
pub mod geo;
pub mod geofeed;
pub mod ix;
pub mod rdns;
pub mod trie;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Sanitize a string taken from a third-party registry by removing control characters.
///
/// PeeringDB and AS-Rank names end up in CSV exports and terminal output, so
/// escape sequences are stripped at load time.
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

/// Whether `ip` is a globally routable unicast address.
///
/// Private, shared, loopback, link-local, documentation, benchmarking,
/// reserved and multicast space is excluded. IPv4-mapped IPv6 addresses are
/// judged by their embedded IPv4 address.
pub fn is_global(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    !(a == 0
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 100.64.0.0/10 shared address space
        || (a == 100 && (b & 0xc0) == 64)
        // 192.0.0.0/24 protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240)
}

fn is_global_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_global_v4(v4);
    }
    let seg = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (seg[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (seg[0] & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (seg[0] == 0x2001 && seg[1] == 0x0db8)
        // 100::/64 discard-only
        || (seg[0] == 0x0100 && seg[1] == 0 && seg[2] == 0 && seg[3] == 0)
        // 64:ff9b:1::/48 local-use translation
        || (seg[0] == 0x0064 && seg[1] == 0xff9b && seg[2] == 0x0001))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(s: &str) -> bool {
        is_global(s.parse().unwrap())
    }

    #[test]
    fn test_public_addresses_are_global() {
        assert!(global("8.8.8.8"));
        assert!(global("80.249.210.217"));
        assert!(global("2001:4860:4860::8888"));
        assert!(global("::ffff:8.8.8.8"));
    }

    #[test]
    fn test_special_purpose_addresses_are_not_global() {
        for ip in [
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "100.64.0.1",
            "127.0.0.1",
            "169.254.1.1",
            "192.0.2.1",
            "198.18.0.1",
            "240.0.0.1",
            "0.1.2.3",
            "224.0.0.1",
            "::1",
            "fe80::1",
            "fd00::1",
            "2001:db8::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(!global(ip), "{} should not be global", ip);
        }
    }

    #[test]
    fn test_sanitize_display() {
        assert_eq!(sanitize_display("AMS-IX\x1b[31m"), "AMS-IX[31m");
        assert_eq!(sanitize_display("plain"), "plain");
    }
}
