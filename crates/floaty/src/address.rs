//! Network address model for managed floating IPs.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when an address cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Parsing IP address {raw:?} failed")]
pub struct AddressParseError {
    raw: String,
}

/// An IP address with a prefix length.
///
/// Parsed from CIDR notation ("192.0.2.0/24", "2001:db8::/64") or from a
/// bare address, which is promoted to a host prefix (/32 or /128). The
/// textual form round-trips through [`fmt::Display`] and [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddress {
    ip: IpAddr,
    prefix_len: u8,
}

impl NetAddress {
    /// The address part.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn max_prefix_len(ip: &IpAddr) -> u8 {
        match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Zero out the host bits so equal networks compare equal.
    fn canonicalize(ip: IpAddr, prefix_len: u8) -> IpAddr {
        match ip {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                let mask = if prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(prefix_len))
                };
                IpAddr::V4((bits & mask).into())
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                let mask = if prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(prefix_len))
                };
                IpAddr::V6((bits & mask).into())
            }
        }
    }
}

impl FromStr for NetAddress {
    type Err = AddressParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError {
            raw: raw.to_string(),
        };

        if let Some((addr, len)) = raw.split_once('/') {
            let ip: IpAddr = addr.parse().map_err(|_| err())?;
            let prefix_len: u8 = len.parse().map_err(|_| err())?;
            if prefix_len > NetAddress::max_prefix_len(&ip) {
                return Err(err());
            }
            Ok(NetAddress {
                ip: NetAddress::canonicalize(ip, prefix_len),
                prefix_len,
            })
        } else {
            let ip: IpAddr = raw.parse().map_err(|_| err())?;
            Ok(NetAddress {
                ip,
                prefix_len: NetAddress::max_prefix_len(&ip),
            })
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl Serialize for NetAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parse_ipv4() {
        let addr: NetAddress = "192.0.2.73".parse().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 73)));
        assert_eq!(addr.prefix_len(), 32);

        assert_eq!(addr, "192.0.2.73/32".parse().unwrap());
    }

    #[test]
    fn parse_ipv4_with_mask() {
        let addr: NetAddress = "192.0.2.64/26".parse().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 64)));
        assert_eq!(addr.prefix_len(), 26);
    }

    #[test]
    fn parse_ipv4_canonicalizes_host_bits() {
        let addr: NetAddress = "192.0.2.201/24".parse().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 0)));
        assert_eq!(addr.to_string(), "192.0.2.0/24");
    }

    #[test]
    fn parse_ipv6() {
        let addr: NetAddress = "2001:db8::ff00".parse().unwrap();
        let expected: Ipv6Addr = "2001:db8::ff00".parse().unwrap();
        assert_eq!(addr.ip(), IpAddr::V6(expected));
        assert_eq!(addr.prefix_len(), 128);

        assert_eq!(addr, "2001:db8::ff00/128".parse().unwrap());
    }

    #[test]
    fn parse_ipv6_with_mask() {
        let addr: NetAddress = "2001:db8:ff::/64".parse().unwrap();
        let expected: Ipv6Addr = "2001:db8:ff::".parse().unwrap();
        assert_eq!(addr.ip(), IpAddr::V6(expected));
        assert_eq!(addr.prefix_len(), 64);
    }

    #[test]
    fn parse_empty() {
        let err = "".parse::<NetAddress>().unwrap_err();
        assert_eq!(err.to_string(), r#"Parsing IP address "" failed"#);
    }

    #[test]
    fn parse_invalid_prefix() {
        assert!("192.0.2.1/33".parse::<NetAddress>().is_err());
        assert!("192.0.2.1/x".parse::<NetAddress>().is_err());
    }

    #[test]
    fn display_round_trip() {
        for raw in ["2001:db8:ff::/64", "192.0.2.0/24", "10.0.0.1/32"] {
            let addr: NetAddress = raw.parse().unwrap();
            assert_eq!(addr.to_string(), raw);
        }
    }

    #[test]
    fn bare_address_marshals_with_full_prefix() {
        let v4: NetAddress = "192.0.2.73".parse().unwrap();
        assert_eq!(v4.to_string(), "192.0.2.73/32");

        let v6: NetAddress = "2001:db8::1".parse().unwrap();
        assert_eq!(v6.to_string(), "2001:db8::1/128");
    }

    #[test]
    fn serde_string_form() {
        let addr: NetAddress = serde_yaml::from_str("192.0.2.10").unwrap();
        assert_eq!(addr.to_string(), "192.0.2.10/32");

        let out = serde_yaml::to_string(&addr).unwrap();
        assert_eq!(out.trim(), "192.0.2.10/32");
    }
}
