//! IPv4 helpers and address ranges.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use vessel_common::{VesselError, VesselResult};

/// The all-zeros (network) address of a subnet.
#[must_use]
pub fn all_zeros(subnet: &Ipv4Net) -> Ipv4Addr {
    subnet.network()
}

/// The all-ones (broadcast) address of a subnet.
#[must_use]
pub fn all_ones(subnet: &Ipv4Net) -> Ipv4Addr {
    subnet.broadcast()
}

/// Whether `ip` can be used as a host address on `subnet`.
#[must_use]
pub fn is_routable(ip: Ipv4Addr, subnet: &Ipv4Net) -> bool {
    subnet.contains(&ip) && ip != all_zeros(subnet) && ip != all_ones(subnet)
}

/// The address following `ip`, wrapping at 255.255.255.255.
#[must_use]
pub fn next_addr(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

/// The address preceding `ip`, wrapping at 0.0.0.0.
#[must_use]
pub fn prev_addr(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_sub(1))
}

/// An inclusive range of IPv4 addresses.
///
/// Parsed from a CIDR (`10.0.0.0/24`), an explicit range
/// (`10.0.0.5-10.0.0.9`) or a range whose upper bound only names the last
/// octet (`10.0.0.5-9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// First address in the range.
    #[serde(rename = "FirstIP")]
    pub first_ip: Ipv4Addr,
    /// Last address in the range.
    #[serde(rename = "LastIP")]
    pub last_ip: Ipv4Addr,
}

impl Range {
    /// Create a range, rejecting `first > last`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the bounds are reversed.
    pub fn new(first_ip: Ipv4Addr, last_ip: Ipv4Addr) -> VesselResult<Self> {
        if first_ip > last_ip {
            return Err(VesselError::invalid_config(format!(
                "range start {} is greater than range end {}",
                first_ip, last_ip
            )));
        }
        Ok(Self { first_ip, last_ip })
    }

    /// A range holding exactly one address.
    #[must_use]
    pub const fn single(ip: Ipv4Addr) -> Self {
        Self {
            first_ip: ip,
            last_ip: ip,
        }
    }

    /// Parse a range from its textual form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the text is not a CIDR or a range.
    pub fn parse(s: &str) -> VesselResult<Self> {
        let s = s.trim();
        let invalid = || VesselError::invalid_config(format!("invalid address range {}", s));

        if s.contains('/') {
            let net: Ipv4Net = s.parse().map_err(|_| invalid())?;
            return Ok(Self::from(net));
        }

        let (first, last) = s.split_once('-').ok_or_else(invalid)?;
        let first: Ipv4Addr = first.trim().parse().map_err(|_| invalid())?;
        let last = last.trim();
        let last = match last.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => {
                let end: u8 = last.parse().map_err(|_| invalid())?;
                let [a, b, c, d] = first.octets();
                if end <= d {
                    return Err(invalid());
                }
                Ipv4Addr::new(a, b, c, end)
            }
        };

        Self::new(first, last).map_err(|_| invalid())
    }

    /// Number of addresses in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.last_ip)) - u64::from(u32::from(self.first_ip)) + 1
    }

    /// Ranges are never empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether `ip` lies within the range.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.first_ip <= ip && ip <= self.last_ip
    }

    /// Whether `other` lies entirely within this range.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.first_ip <= other.first_ip && other.last_ip <= self.last_ip
    }

    /// Whether the two ranges share at least one address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.first_ip <= other.last_ip && other.first_ip <= self.last_ip
    }

    /// The CIDR network this range spans exactly, if any.
    #[must_use]
    pub fn network(&self) -> Option<Ipv4Net> {
        let size = self.len();
        if !size.is_power_of_two() {
            return None;
        }

        let host_bits = size.trailing_zeros();
        let prefix = u8::try_from(32 - host_bits).ok()?;
        let net = Ipv4Net::new(self.first_ip, prefix).ok()?;
        (net.network() == self.first_ip).then_some(net)
    }
}

impl From<Ipv4Net> for Range {
    fn from(net: Ipv4Net) -> Self {
        Self {
            first_ip: net.network(),
            last_ip: net.broadcast(),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network() {
            Some(net) => write!(f, "{}", net),
            None => write!(f, "{}-{}", self.first_ip, self.last_ip),
        }
    }
}

impl FromStr for Range {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
