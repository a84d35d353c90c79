//! Address leases and hardware addresses.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CniError, CniResult};

/// IP address family requested from the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IpFamily {
    /// IPv4.
    #[default]
    #[serde(rename = "IPv4")]
    V4,
    /// IPv6.
    #[serde(rename = "IPv6")]
    V6,
}

impl IpFamily {
    /// Wire name of the family.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        }
    }

    /// Prefix length of a single host address.
    #[must_use]
    pub const fn host_prefix(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpFamily {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "4" => Ok(Self::V4),
            "ipv6" | "6" => Ok(Self::V6),
            _ => Err(CniError::Config {
                message: format!("unknown IP family: {s}"),
            }),
        }
    }
}

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Create from a netlink attribute payload.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self)
    }

    /// Raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is the all-zero address some devices report before they are up.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CniError::MalformedLease {
            field: "macAddress".to_string(),
            value: s.to_string(),
        };

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(malformed)?;
            if part.len() != 2 {
                return Err(malformed());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
        }
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An IP/MAC assignment for one workload interface.
///
/// Leases are not persisted here; the allocator is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Assigned address.
    pub address: IpAddr,
    /// Prefix length of the assignment.
    pub prefix: u8,
    /// Assigned hardware address.
    pub mac: MacAddr,
    /// Interface the lease was made for.
    pub interface: String,
}

impl Lease {
    /// Parse the raw allocator fields into a lease.
    ///
    /// `address` may be a bare host address (taken as a host route) or CIDR.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::MalformedLease`] if either value does not parse.
    pub fn parse(address: &str, mac: &str, interface: impl Into<String>) -> CniResult<Self> {
        let malformed = || CniError::MalformedLease {
            field: "address".to_string(),
            value: address.to_string(),
        };

        let (address, prefix) = if address.contains('/') {
            let net: IpNet = address.parse().map_err(|_| malformed())?;
            (net.addr(), net.prefix_len())
        } else {
            let ip: IpAddr = address.trim().parse().map_err(|_| malformed())?;
            let family = if ip.is_ipv4() { IpFamily::V4 } else { IpFamily::V6 };
            (ip, family.host_prefix())
        };

        Ok(Self {
            address,
            prefix,
            mac: mac.trim().parse()?,
            interface: interface.into(),
        })
    }

    /// The address with its prefix.
    #[must_use]
    pub fn network(&self) -> IpNet {
        // prefix is validated in parse() or came from IpNet
        IpNet::new(self.address, self.prefix).unwrap_or_else(|_| IpNet::from(self.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "02:AA:bb:cc:dd:01".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x01]);
        assert_eq!(mac.to_string(), "02:aa:bb:cc:dd:01");
        assert!(!mac.is_zero());
    }

    #[test]
    fn mac_rejects_garbage() {
        for bad in ["", "02:aa:bb:cc:dd", "02:aa:bb:cc:dd:01:ff", "zz:aa:bb:cc:dd:01", "2:aa:bb:cc:dd:01"] {
            let err = bad.parse::<MacAddr>().unwrap_err();
            assert!(matches!(err, CniError::MalformedLease { .. }), "{bad}");
        }
    }

    #[test]
    fn lease_from_host_address() {
        let lease = Lease::parse("10.0.1.5", "02:aa:bb:cc:dd:01", "eth0").unwrap();
        assert_eq!(lease.prefix, 32);
        assert_eq!(lease.network().to_string(), "10.0.1.5/32");
    }

    #[test]
    fn lease_from_cidr() {
        let lease = Lease::parse("fd00::5/64", "02:aa:bb:cc:dd:01", "eth0").unwrap();
        assert_eq!(lease.prefix, 64);
        assert_eq!(lease.network().to_string(), "fd00::5/64");
    }

    #[test]
    fn lease_rejects_bad_address() {
        let err = Lease::parse("10.0.1", "02:aa:bb:cc:dd:01", "eth0").unwrap_err();
        assert!(matches!(err, CniError::MalformedLease { ref field, .. } if field == "address"));
    }

    #[test]
    fn family_round_trip() {
        assert_eq!("IPv4".parse::<IpFamily>().unwrap(), IpFamily::V4);
        assert_eq!(serde_json::to_string(&IpFamily::V6).unwrap(), "\"IPv6\"");
    }
}
