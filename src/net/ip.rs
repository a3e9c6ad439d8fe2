use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address math and range predicates shared by the safety filter and the
/// health responder.

pub fn ipv4_to_int(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

pub fn int_to_ipv4(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

pub fn ipv6_to_int(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}

pub fn int_to_ipv6(value: u128) -> Ipv6Addr {
    Ipv6Addr::from(value)
}

/// Canonical compressed textual form (RFC 5952, `::` for the longest zero
/// run), the form `Ipv6Addr`'s `Display` produces.
pub fn compress_ipv6(addr: Ipv6Addr) -> String {
    addr.to_string()
}

/// Fully expanded form: eight zero-padded hextets.
pub fn decompress_ipv6(addr: Ipv6Addr) -> String {
    let s = addr.segments();
    format!(
        "{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}",
        s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]
    )
}

/// RFC1918 private IPv4 space: 10/8, 172.16/12, 192.168/16.
pub fn is_rfc1918(addr: Ipv4Addr) -> bool {
    addr.is_private()
}

/// RFC4193 unique-local IPv6 space: fc00::/7.
pub fn is_rfc4193(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// RFC3879 (deprecated) site-local IPv6 space: fec0::/10.
pub fn is_rfc3879(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfec0
}

pub fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

pub fn is_link_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// LAN ranges rejected when LAN access is denied.
pub fn is_lan(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_rfc1918(v4),
        IpAddr::V6(v6) => is_rfc4193(v6) || is_rfc3879(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_int_round_trip() {
        for s in ["0.0.0.0", "127.0.0.1", "10.1.2.3", "255.255.255.255"] {
            let addr: Ipv4Addr = s.parse().unwrap();
            assert_eq!(int_to_ipv4(ipv4_to_int(addr)), addr);
        }
        assert_eq!(ipv4_to_int("1.0.0.0".parse().unwrap()), 1 << 24);
    }

    #[test]
    fn test_ipv6_int_round_trip() {
        for s in ["::1", "fe80::1", "2001:db8::8:800:200c:417a"] {
            let addr: Ipv6Addr = s.parse().unwrap();
            assert_eq!(int_to_ipv6(ipv6_to_int(addr)), addr);
        }
    }

    #[test]
    fn test_decompress_then_compress_is_identity() {
        for s in ["::1", "2001:db8::1", "fe80::dead:beef", "::"] {
            let addr: Ipv6Addr = s.parse().unwrap();
            let decompressed = decompress_ipv6(addr);
            let reparsed: Ipv6Addr = decompressed.parse().unwrap();
            assert_eq!(reparsed, addr);
            assert_eq!(compress_ipv6(reparsed), addr.to_string());
        }
        assert_eq!(
            decompress_ipv6("2001:db8::1".parse().unwrap()),
            "2001:0db8:0000:0000:0000:0000:0000:0001"
        );
    }

    #[test]
    fn test_rfc1918() {
        assert!(is_rfc1918("10.0.0.5".parse().unwrap()));
        assert!(is_rfc1918("172.16.0.1".parse().unwrap()));
        assert!(is_rfc1918("172.31.255.255".parse().unwrap()));
        assert!(is_rfc1918("192.168.1.1".parse().unwrap()));
        assert!(!is_rfc1918("172.32.0.1".parse().unwrap()));
        assert!(!is_rfc1918("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_rfc4193_and_rfc3879() {
        assert!(is_rfc4193("fc00::1".parse().unwrap()));
        assert!(is_rfc4193("fdff::1".parse().unwrap()));
        assert!(!is_rfc4193("fe80::1".parse().unwrap()));

        assert!(is_rfc3879("fec0::1".parse().unwrap()));
        assert!(!is_rfc3879("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_loopback() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("127.255.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(!is_loopback("128.0.0.1".parse().unwrap()));
    }
}
