//! CIDR address matcher
//!
//! One network range in canonical form: every bit past the prefix length
//! is cleared, so membership is a fixed-width prefix compare.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;

/// Address family of a matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

/// An immutable network range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressMatcher {
    network: IpNetwork,
}

impl AddressMatcher {
    /// Build a matcher, clearing host bits of `addr` past `prefix`.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ipnetwork::IpNetworkError> {
        let raw = IpNetwork::new(addr, prefix)?;
        let network = IpNetwork::new(raw.network(), prefix)?;
        Ok(Self { network })
    }

    /// Matcher for exactly one address.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            network: IpNetwork::from(addr),
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.network.ip())
    }

    /// Canonical base address
    pub fn network(&self) -> IpAddr {
        self.network.ip()
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix()
    }

    /// True when `addr` has the same family and shares the leading
    /// `prefix_len` bits. Cross-family comparisons never match.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.family() == AddressFamily::of(&addr) && self.network.contains(addr)
    }
}

impl FromStr for AddressMatcher {
    type Err = ipnetwork::IpNetworkError;

    /// Accepts `address` or `address/prefix`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: IpNetwork = s.parse()?;
        Self::new(parsed.ip(), parsed.prefix())
    }
}

impl fmt::Display for AddressMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network.ip(), self.network.prefix())
    }
}
