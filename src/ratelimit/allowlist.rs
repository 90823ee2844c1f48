//! CIDR allowlist for exempting clients from rate limiting.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tracing::debug;

use crate::error::{RatewallError, Result};

/// Google crawler ranges exempted out of the box by the YAML configuration.
pub const DEFAULT_WHITELIST_RANGES: &[&str] = &[
    "64.18.0.0/20",
    "64.233.160.0/19",
    "66.102.0.0/20",
    "66.249.80.0/20",
    "72.14.192.0/18",
    "74.125.0.0/16",
    "108.177.8.0/21",
    "172.217.0.0/19",
    "173.194.0.0/16",
    "207.126.144.0/20",
    "209.85.128.0/17",
    "216.58.192.0/19",
    "216.239.32.0/19",
];

/// An ordered, immutable set of IP ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    ranges: Vec<IpNet>,
}

impl Allowlist {
    /// An allowlist that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse CIDR strings. A bare address is taken as a single-host range.
    pub fn parse<I, S>(ranges: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ranges = ranges
            .into_iter()
            .map(|range| parse_range(range.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        debug!(ranges = ranges.len(), "Allowlist loaded");
        Ok(Self { ranges })
    }

    /// Whether `ip` falls inside any configured range.
    ///
    /// IPv4-mapped IPv6 addresses are matched against IPv4 ranges.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.ranges.iter().any(|range| range.contains(&ip))
    }

    /// Number of configured ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no ranges are configured.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_range(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net);
    }

    let host = match raw.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ipv4Net::new(v4, 32).map(IpNet::V4),
        Ok(IpAddr::V6(v6)) => Ipv6Net::new(v6, 128).map(IpNet::V6),
        Err(_) => {
            return Err(RatewallError::InvalidConfig(format!(
                "invalid allowlist range '{}'",
                raw
            )))
        }
    };

    host.map_err(|e| RatewallError::InvalidConfig(format!("invalid allowlist range '{}': {}", raw, e)))
}
