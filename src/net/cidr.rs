use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::IpAddr;

/// An ordered pair of CIDR lists, one per address family.
///
/// Backs both the trusted-reverse-proxy set and the source-guard ACL.
/// The two uses differ only in how an empty family is interpreted, so
/// membership comes in two flavors: [`CidrSet::contains`] (empty = no
/// match) and [`CidrSet::allows`] (empty = allow-all for that family).
#[derive(Debug, Clone, Default)]
pub struct CidrSet {
    v4: Vec<Ipv4Network>,
    v6: Vec<Ipv6Network>,
}

impl CidrSet {
    /// Parse from the comma-split settings values. Entries that do not
    /// parse as CIDRs are skipped with a warning rather than taking the
    /// whole set down.
    pub fn parse(v4_entries: &[String], v6_entries: &[String]) -> Self {
        let mut set = CidrSet::default();

        for entry in v4_entries {
            match entry.parse::<IpNetwork>() {
                Ok(IpNetwork::V4(net)) => set.v4.push(net),
                Ok(IpNetwork::V6(net)) => set.v6.push(net),
                Err(e) => {
                    tracing::warn!("cidr: skipping invalid entry, value={}, error={}", entry, e);
                }
            }
        }
        for entry in v6_entries {
            match entry.parse::<IpNetwork>() {
                Ok(IpNetwork::V6(net)) => set.v6.push(net),
                Ok(IpNetwork::V4(net)) => set.v4.push(net),
                Err(e) => {
                    tracing::warn!("cidr: skipping invalid entry, value={}, error={}", entry, e);
                }
            }
        }

        set
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Longest matching prefix length for `ip`, if any entry contains it.
    pub fn longest_prefix(&self, ip: IpAddr) -> Option<u8> {
        match ip {
            IpAddr::V4(v4) => self
                .v4
                .iter()
                .filter(|net| net.contains(v4))
                .map(|net| net.prefix())
                .max(),
            IpAddr::V6(v6) => self
                .v6
                .iter()
                .filter(|net| net.contains(v6))
                .map(|net| net.prefix())
                .max(),
        }
    }

    /// Strict membership: an empty family matches nothing. Used for the
    /// trusted-proxy and Cloudflare sets.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.longest_prefix(ip).is_some()
    }

    /// ACL semantics: an empty list for the client's family means the
    /// check is disabled for that family, i.e. allow.
    pub fn allows(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) if self.v4.is_empty() => true,
            IpAddr::V6(_) if self.v6.is_empty() => true,
            _ => self.contains(ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_contains_v4() {
        let set = CidrSet::parse(&strs(&["198.51.100.0/24"]), &[]);
        assert!(set.contains("198.51.100.7".parse().unwrap()));
        assert!(!set.contains("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_contains_v6() {
        let set = CidrSet::parse(&[], &strs(&["2001:db8::/32"]));
        assert!(set.contains("2001:db8::1".parse().unwrap()));
        assert!(!set.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_empty_family_allows_all() {
        let set = CidrSet::parse(&strs(&["198.51.100.0/24"]), &[]);
        // v6 list is empty, so v6 clients pass the ACL check.
        assert!(set.allows("2001:db8::1".parse().unwrap()));
        // v4 list is non-empty, so v4 clients must match.
        assert!(!set.allows("203.0.113.9".parse().unwrap()));
        assert!(set.allows("198.51.100.9".parse().unwrap()));
    }

    #[test]
    fn test_longest_prefix() {
        let set = CidrSet::parse(&strs(&["10.0.0.0/8", "10.1.0.0/16"]), &[]);
        assert_eq!(set.longest_prefix("10.1.2.3".parse().unwrap()), Some(16));
        assert_eq!(set.longest_prefix("10.2.0.1".parse().unwrap()), Some(8));
        assert_eq!(set.longest_prefix("11.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let set = CidrSet::parse(&strs(&["not-a-cidr", "198.51.100.0/24"]), &[]);
        assert!(set.contains("198.51.100.1".parse().unwrap()));
    }
}
