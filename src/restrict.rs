//! CIDR allow-list enforcement for incoming connections.
//!
//! A repository may carry `acl.restrictip` with a comma-separated list of
//! CIDR blocks. A connection is allowed when no restriction is configured,
//! when there is no SSH context at all (local invocation), or when any
//! block matches the client address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use log::warn;

pub const BLOCKED_MESSAGE: &str = "git-server: Your IP has been blocked.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cidr {
    V4 { addr: Ipv4Addr, prefix: u8 },
    V6 { addr: Ipv6Addr, prefix: u8 },
}

impl FromStr for Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (base, prefix) = match s.split_once('/') {
            Some((base, prefix)) => (
                base,
                Some(
                    prefix
                        .parse::<u8>()
                        .map_err(|_| anyhow!("bad prefix length in {s:?}"))?,
                ),
            ),
            None => (s, None),
        };

        if let Ok(addr) = base.parse::<Ipv4Addr>() {
            let prefix = prefix.unwrap_or(32);
            if !(8..=32).contains(&prefix) {
                bail!("IPv4 prefix length out of range in {s:?}");
            }
            return Ok(Cidr::V4 { addr, prefix });
        }
        if let Ok(addr) = base.parse::<Ipv6Addr>() {
            let prefix = prefix.unwrap_or(128);
            if !(8..=128).contains(&prefix) {
                bail!("IPv6 prefix length out of range in {s:?}");
            }
            return Ok(Cidr::V6 { addr, prefix });
        }
        bail!("not a CIDR: {s:?}")
    }
}

impl Cidr {
    /// First-N-bits equality of the packed addresses in network order.
    /// Families never match each other.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Cidr::V4 { addr, prefix }, IpAddr::V4(ip)) => {
                let mask = if *prefix == 32 {
                    u32::MAX
                } else {
                    u32::MAX << (32 - prefix)
                };
                u32::from(*addr) & mask == u32::from(ip) & mask
            }
            (Cidr::V6 { addr, prefix }, IpAddr::V6(ip)) => {
                let mask = if *prefix == 128 {
                    u128::MAX
                } else {
                    u128::MAX << (128 - prefix)
                };
                u128::from(*addr) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Outcome of the allow-list check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked,
}

/// Applies `acl.restrictip` to the client address.
///
/// Individually malformed entries are warned about and skipped; a
/// restriction list in which nothing parses is a configuration error.
pub fn check(restriction: Option<&str>, client: Option<IpAddr>) -> Result<Verdict> {
    let Some(restriction) = restriction.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(Verdict::Allowed);
    };
    let Some(client) = client else {
        // No SSH context: nothing to restrict against.
        return Ok(Verdict::Allowed);
    };

    let mut parsed_any = false;
    for entry in restriction.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.parse::<Cidr>() {
            Ok(cidr) => {
                parsed_any = true;
                if cidr.contains(client) {
                    return Ok(Verdict::Allowed);
                }
            }
            Err(err) => warn!("Skipping malformed CIDR {entry:?}: {err}"),
        }
    }

    if !parsed_any {
        bail!("acl.restrictip {restriction:?} contains no usable CIDR");
    }
    Ok(Verdict::Blocked)
}
