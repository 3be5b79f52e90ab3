//! Connection-level access control (`access_control_list`).
//!
//! A list of `+net` / `-net` rules such as `-0.0.0.0/0,+192.168.0.0/16`.
//! The last matching rule decides; with any rule present, a client that
//! matches none is denied.

use std::net::IpAddr;

use super::Ipv4Net;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rule {
    allow: bool,
    net: Ipv4Net,
}

/// Parsed `access_control_list` option.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControlList {
    rules: Vec<Rule>,
}

impl AccessControlList {
    /// Parses a comma-separated rule list. Every rule needs a `+` or `-`
    /// prefix.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut rules = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let allow = match entry.as_bytes()[0] {
                b'+' => true,
                b'-' => false,
                _ => return Err(format!("ACL rule {entry:?} must start with '+' or '-'")),
            };
            rules.push(Rule {
                allow,
                net: entry[1..].parse()?,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a client at `ip` may connect. IPv6 clients are matched by
    /// their mapped IPv4 address when they have one and denied otherwise.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.net.contains(v4))
            .is_some_and(|rule| rule.allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_list_allows_everyone() {
        let acl = AccessControlList::parse("").unwrap();
        assert!(acl.allows(ip("1.2.3.4")));
        assert!(acl.allows(ip("::1")));
    }

    #[test]
    fn last_match_wins() {
        let acl = AccessControlList::parse("-0.0.0.0/0,+192.168.0.0/16").unwrap();
        assert!(acl.allows(ip("192.168.10.1")));
        assert!(!acl.allows(ip("10.1.1.1")));

        let acl = AccessControlList::parse("+192.168.0.0/16,-192.168.5.0/24").unwrap();
        assert!(!acl.allows(ip("192.168.5.9")));
        assert!(acl.allows(ip("192.168.6.9")));
    }

    #[test]
    fn unmatched_client_is_denied() {
        let acl = AccessControlList::parse("+127.0.0.1").unwrap();
        assert!(acl.allows(ip("127.0.0.1")));
        assert!(!acl.allows(ip("127.0.0.2")));
    }

    #[test]
    fn mapped_ipv6_uses_ipv4_rules() {
        let acl = AccessControlList::parse("+10.0.0.0/8").unwrap();
        assert!(acl.allows(ip("::ffff:10.1.2.3")));
        assert!(!acl.allows(ip("fe80::1")));
    }

    #[test]
    fn rule_needs_sign() {
        assert!(AccessControlList::parse("10.0.0.0/8").is_err());
    }
}
