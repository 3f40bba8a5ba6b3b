//! Node Addresses
//!
//! Validates raw address strings from feeds into canonical network
//! addresses. Ordering is numeric within a family with every IPv4 address
//! sorting before every IPv6 address, so keyset cursors never misorder
//! `9.0.0.1` and `10.0.0.1` the way string ordering would.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Storage key tag for IPv4 addresses
const FAMILY_V4: u8 = 4;
/// Storage key tag for IPv6 addresses
const FAMILY_V6: u8 = 6;

// =============================================================================
// Node Address
// =============================================================================

/// A validated, canonical network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(IpAddr);

impl NodeAddress {
    /// Wrap an IP address, folding IPv4-mapped IPv6 into plain IPv4
    pub fn new(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self(IpAddr::V4(v4)),
                None => Self(IpAddr::V6(v6)),
            },
            v4 => Self(v4),
        }
    }

    /// Parse a raw feed field into an address
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidAddress {
                value: raw.to_string(),
                reason: "empty value".into(),
            });
        }

        trimmed
            .parse::<IpAddr>()
            .map(Self::new)
            .map_err(|e| Error::InvalidAddress {
                value: raw.to_string(),
                reason: e.to_string(),
            })
    }

    /// The underlying IP address
    pub fn ip(&self) -> IpAddr {
        self.0
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    /// Encode as an order-preserving storage key
    ///
    /// Layout is a family tag followed by the big-endian octets, so the
    /// byte-wise order of keys matches the `Ord` impl.
    pub fn to_key(&self) -> Vec<u8> {
        encode_key(self.0)
    }

    /// Decode a storage key produced by [`NodeAddress::to_key`]
    pub fn from_key(key: &[u8]) -> Result<Self> {
        match (key.first(), key.len()) {
            (Some(&FAMILY_V4), 5) => {
                let octets: [u8; 4] = key[1..]
                    .try_into()
                    .map_err(|_| Error::Internal("truncated IPv4 key".into()))?;
                Ok(Self(IpAddr::V4(Ipv4Addr::from(octets))))
            }
            (Some(&FAMILY_V6), 17) => {
                let octets: [u8; 16] = key[1..]
                    .try_into()
                    .map_err(|_| Error::Internal("truncated IPv6 key".into()))?;
                Ok(Self(IpAddr::V6(Ipv6Addr::from(octets))))
            }
            _ => Err(Error::Internal(format!(
                "malformed address key of {} bytes",
                key.len()
            ))),
        }
    }
}

/// Order-preserving key of a raw IP address, without canonicalization
pub(crate) fn encode_key(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => {
            let mut key = Vec::with_capacity(5);
            key.push(FAMILY_V4);
            key.extend_from_slice(&v4.octets());
            key
        }
        IpAddr::V6(v6) => {
            let mut key = Vec::with_capacity(17);
            key.push(FAMILY_V6);
            key.extend_from_slice(&v6.octets());
            key
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<IpAddr> for NodeAddress {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip)
    }
}

impl From<Ipv4Addr> for NodeAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(IpAddr::V4(ip))
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
