//! Client-IP admission policy
//!
//! The allow-list combines exact IP addresses with CIDR networks. An
//! empty list admits everyone; otherwise a client is admitted when its
//! address matches an exact entry or falls inside any listed network.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

/// Immutable admission policy built once at startup.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    exact: HashSet<String>,
    networks: Vec<IpNet>,
}

impl AllowList {
    /// Parse a list of entries, each an IP literal or a CIDR.
    ///
    /// Invalid entries are skipped with a warning; they never abort
    /// startup.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut exact = HashSet::new();
        let mut networks = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if let Ok(net) = entry.parse::<IpNet>() {
                networks.push(net);
                continue;
            }
            if let Ok(ip) = entry.parse::<IpAddr>() {
                exact.insert(ip.to_canonical().to_string());
                continue;
            }
            warn!(entry, "invalid allow list entry skipped");
        }
        AllowList { exact, networks }
    }

    /// True when no entries were configured, which admits every client.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.networks.is_empty()
    }

    /// Whether `ip` is admitted.
    pub fn check(&self, ip: IpAddr) -> bool {
        if self.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        if self.exact.contains(&ip.to_string()) {
            return true;
        }
        self.networks.iter().any(|net| net.contains(&ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_list_admits_all() {
        let list = AllowList::parse::<&str>(&[]);
        assert!(list.is_empty());
        assert!(list.check(ip("127.0.0.1")));
        assert!(list.check(ip("8.8.8.8")));
        assert!(list.check(ip("::1")));
    }

    #[test]
    fn test_exact_match() {
        let list = AllowList::parse(&["10.1.2.3", "::1"]);
        assert!(list.check(ip("10.1.2.3")));
        assert!(list.check(ip("::1")));
        assert!(!list.check(ip("10.1.2.4")));
    }

    #[test]
    fn test_cidr_match() {
        let list = AllowList::parse(&["10.0.0.0/8", "2001:db8::/32"]);
        assert!(list.check(ip("10.200.1.1")));
        assert!(list.check(ip("2001:db8::42")));
        assert!(!list.check(ip("127.0.0.1")));
        assert!(!list.check(ip("2001:db9::1")));
    }

    #[test]
    fn test_mixed_entries() {
        let list = AllowList::parse(&["192.168.1.0/24", "1.1.1.1"]);
        assert!(list.check(ip("192.168.1.77")));
        assert!(list.check(ip("1.1.1.1")));
        assert!(!list.check(ip("192.168.2.1")));
        assert!(!list.check(ip("1.1.1.2")));
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let list = AllowList::parse(&["not-an-ip", "300.1.2.3", "10.0.0.0/8", ""]);
        assert!(!list.is_empty());
        assert!(list.check(ip("10.9.9.9")));
        assert!(!list.check(ip("127.0.0.1")));
    }

    #[test]
    fn test_mapped_ipv4_matches_v4_entry() {
        let list = AllowList::parse(&["127.0.0.1"]);
        assert!(list.check(ip("::ffff:127.0.0.1")));
    }
}
