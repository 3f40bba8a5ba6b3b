//! CIDR Prefixes
//!
//! Parses `<addr>/<bits>` prefixes for allowlist entries and answers
//! containment. Host bits are masked off on parse, so `10.0.0.5/24` and
//! `10.0.0.0/24` are the same prefix.

use crate::error::{Error, Result};
use crate::net::address::{encode_key, NodeAddress};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A network prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Build a prefix from an address and length, masking host bits
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = max_prefix_len(&addr);
        if prefix_len > max {
            return Err(Error::InvalidCidr {
                value: format!("{}/{}", addr, prefix_len),
                reason: format!("prefix length must be at most {}", max),
            });
        }

        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(prefix_len))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(prefix_len))),
        };

        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// Parse `<addr>/<bits>`
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| Error::InvalidCidr {
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        let (addr, bits) = trimmed
            .split_once('/')
            .ok_or_else(|| invalid("expected <ip>/<bits>"))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid(&e.to_string()))?;
        if bits.is_empty() || !bits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("prefix length must be a decimal number"));
        }
        let prefix_len: u8 = bits
            .parse()
            .map_err(|_| invalid("prefix length out of range"))?;

        Self::new(addr, prefix_len).map_err(|_| {
            invalid(&format!(
                "prefix length must be at most {}",
                max_prefix_len(&addr)
            ))
        })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check whether an address falls inside this prefix
    pub fn contains(&self, addr: &NodeAddress) -> bool {
        match (self.network, addr.ip()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & v4_mask(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }

    /// Lowest address in the prefix
    pub fn first(&self) -> NodeAddress {
        NodeAddress::new(self.network)
    }

    /// Highest address in the prefix
    pub fn last(&self) -> NodeAddress {
        match self.network {
            IpAddr::V4(net) => NodeAddress::from(Ipv4Addr::from(
                u32::from(net) | !v4_mask(self.prefix_len),
            )),
            IpAddr::V6(net) => NodeAddress::new(IpAddr::V6(Ipv6Addr::from(
                u128::from(net) | !v6_mask(self.prefix_len),
            ))),
        }
    }
}

impl Cidr {
    /// Inclusive storage-key bounds of the prefix
    ///
    /// Keys are built from the raw network so an IPv6 prefix never spans
    /// IPv4 keys.
    pub fn key_range(&self) -> (Vec<u8>, Vec<u8>) {
        let last = match self.network {
            IpAddr::V4(net) => IpAddr::V4(Ipv4Addr::from(u32::from(net) | !v4_mask(self.prefix_len))),
            IpAddr::V6(net) => IpAddr::V6(Ipv6Addr::from(u128::from(net) | !v6_mask(self.prefix_len))),
        };
        (encode_key(self.network), encode_key(last))
    }
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

#[inline]
fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

#[inline]
fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
