//! Security layers applied by the dispatcher and the acceptor.
//!
//! - [`acl`]: IPv4 allow/deny lists checked at accept time.
//! - [`throttle`]: bytes-per-second limits selected per request.
//! - [`cors`]: `Access-Control-*` preflight replies and decoration.
//! - [`auth`]: the authorization gate (password files, nonces, challenges).

use std::net::Ipv4Addr;
use std::str::FromStr;

pub mod acl;
pub mod auth;
pub mod cors;
pub mod throttle;

pub use acl::AccessControlList;
pub use auth::{NonceSource, PasswordVerifier};
pub use cors::CorsPolicy;
pub use throttle::ThrottleRules;

/// An IPv4 network in `a.b.c.d[/bits]` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    addr: u32,
    mask: u32,
}

impl Ipv4Net {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.addr
    }
}

impl FromStr for Ipv4Net {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, bits) = match s.split_once('/') {
            Some((addr, bits)) => {
                let bits: u32 = bits
                    .parse()
                    .map_err(|_| format!("invalid prefix length in {s:?}"))?;
                if bits > 32 {
                    return Err(format!("prefix length out of range in {s:?}"));
                }
                (addr, bits)
            }
            None => (s, 32),
        };
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| format!("invalid IPv4 address {s:?}"))?;
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        Ok(Self {
            addr: u32::from(addr) & mask,
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_membership() {
        let net: Ipv4Net = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn host_and_catch_all() {
        let host: Ipv4Net = "10.0.0.1".parse().unwrap();
        assert!(host.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!host.contains(Ipv4Addr::new(10, 0, 0, 2)));
        let any: Ipv4Net = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn rejects_garbage() {
        assert!("10.0.0.0/33".parse::<Ipv4Net>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Net>().is_err());
        assert!("example.com".parse::<Ipv4Net>().is_err());
    }
}
