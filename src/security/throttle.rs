//! Bandwidth limits (`throttle` option).
//!
//! Format: `*=1k,10.0.0.0/8=0,/downloads/**=512k`. Keys are `*`, an IPv4
//! network, or a URI pattern; values are bytes per second with an optional
//! `k` (×1024) or `m` (×1048576) suffix. The last matching rule wins and
//! zero means unlimited.

use std::net::IpAddr;

use super::Ipv4Net;
use crate::router::pattern;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    Any,
    Net(Ipv4Net),
    Uri(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleRules {
    rules: Vec<(Selector, u64)>,
}

impl ThrottleRules {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut rules = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("throttle rule {entry:?} has no '='"))?;
            let key = key.trim();
            let selector = if key == "*" {
                Selector::Any
            } else if let Ok(net) = key.parse::<Ipv4Net>() {
                Selector::Net(net)
            } else {
                Selector::Uri(key.to_owned())
            };
            rules.push((selector, parse_rate(value.trim())?));
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Bytes per second for a request from `ip` to `uri`; `0` is unlimited.
    pub fn select(&self, ip: Option<IpAddr>, uri: &str) -> u64 {
        let v4 = ip.and_then(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        });
        let mut rate = 0;
        for (selector, value) in &self.rules {
            let hit = match selector {
                Selector::Any => true,
                Selector::Net(net) => v4.is_some_and(|v4| net.contains(v4)),
                Selector::Uri(pat) => pattern::matches(pat, uri),
            };
            if hit {
                rate = *value;
            }
        }
        rate
    }
}

fn parse_rate(value: &str) -> Result<u64, String> {
    let (number, multiplier) = match value.as_bytes().last() {
        Some(b'k' | b'K') => (&value[..value.len() - 1], 1024.0),
        Some(b'm' | b'M') => (&value[..value.len() - 1], 1024.0 * 1024.0),
        _ => (value, 1.0),
    };
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid throttle rate {value:?}"))?;
    if !number.is_finite() || number < 0.0 {
        return Err(format!("invalid throttle rate {value:?}"));
    }
    Ok((number * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes() {
        assert_eq!(parse_rate("100").unwrap(), 100);
        assert_eq!(parse_rate("2k").unwrap(), 2048);
        assert_eq!(parse_rate("1.5M").unwrap(), 1_572_864);
        assert!(parse_rate("fast").is_err());
        assert!(parse_rate("-1").is_err());
    }

    #[test]
    fn last_matching_rule_wins() {
        let rules = ThrottleRules::parse("*=1k,10.0.0.0/8=0,/big/**=5k").unwrap();
        let lan = Some("10.1.2.3".parse().unwrap());
        let wan = Some("8.8.8.8".parse().unwrap());
        assert_eq!(rules.select(wan, "/index.html"), 1024);
        assert_eq!(rules.select(lan, "/index.html"), 0);
        assert_eq!(rules.select(lan, "/big/file.iso"), 5 * 1024);
    }

    #[test]
    fn no_rules_means_unlimited() {
        let rules = ThrottleRules::default();
        assert_eq!(rules.select(None, "/"), 0);
    }

    #[test]
    fn malformed_entry() {
        assert!(ThrottleRules::parse("*").is_err());
    }
}
