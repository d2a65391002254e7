use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Classify an address as private per spec §4.2: RFC1918 + loopback +
/// link-local for IPv4; loopback + link-local + unique-local for IPv6.
pub fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    addr.is_private() || addr.is_loopback() || addr.is_link_local()
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() {
        return true;
    }
    // fe80::/10 link-local.
    let segments = addr.segments();
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    // fc00::/7 unique local.
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // IPv4-mapped addresses inherit the v4 classification.
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    false
}
