//! IPv4 networking helpers for secondary interface provisioning.
//!
//! This library provides helpers for:
//! - MAC address parsing and formatting
//! - Subnet gateway derivation
//! - Host (/32) routes
//! - A small IPv4 address pool used by in-memory IPAM

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Address pool exhausted.
    #[error("address pool exhausted: {0}")]
    PoolExhausted(Ipv4Net),
}

// ============================================================================
// MAC addresses
// ============================================================================

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = NetworkError;

    /// Parse colon- or dash-separated hex ("0a:1b:2c:3d:4e:5f").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(NetworkError::InvalidMac(s.to_string()));
            }
            octets[i] =
                u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl serde::Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Subnets
// ============================================================================

/// Parse a CIDR string such as "10.0.1.0/24".
///
/// Host bits are cleared, so "10.0.1.7/24" yields 10.0.1.0/24.
pub fn parse_cidr(s: &str) -> Result<Ipv4Net, NetworkError> {
    let net: Ipv4Net = s
        .trim()
        .parse()
        .map_err(|_| NetworkError::InvalidCidr(s.to_string()))?;
    Ok(net.trunc())
}

/// The gateway of a VPC subnet: always the first address after the network
/// address.
pub fn gateway_for(subnet: Ipv4Net) -> Ipv4Addr {
    let base = u32::from(subnet.network());
    Ipv4Addr::from(base.wrapping_add(1))
}

/// A single-host route for `addr`.
pub fn host_net(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(addr)
}

// ============================================================================
// Address pool
// ============================================================================

/// IPv4 allocator that hands out the lowest free host address of a CIDR.
///
/// The network address, the gateway and the broadcast address are never
/// allocated.
#[derive(Debug, Clone)]
pub struct Ipv4Pool {
    cidr: Ipv4Net,
    allocated: BTreeSet<Ipv4Addr>,
}

impl Ipv4Pool {
    pub fn new(cidr: Ipv4Net) -> Self {
        Self {
            cidr: cidr.trunc(),
            allocated: BTreeSet::new(),
        }
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        addr == self.cidr.network()
            || addr == gateway_for(self.cidr)
            || addr == self.cidr.broadcast()
    }

    /// Allocate the next available address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, NetworkError> {
        let addr = self
            .cidr
            .hosts()
            .find(|a| !self.is_reserved(*a) && !self.allocated.contains(a))
            .ok_or(NetworkError::PoolExhausted(self.cidr))?;
        self.allocated.insert(addr);
        Ok(addr)
    }

    /// Mark a specific address as in use (for recovery/import).
    pub fn allocate_specific(&mut self, addr: Ipv4Addr) -> Result<(), NetworkError> {
        if !self.cidr.contains(&addr) || self.is_reserved(addr) {
            return Err(NetworkError::InvalidAddress(format!(
                "{} is not allocatable in {}",
                addr, self.cidr
            )));
        }
        self.allocated.insert(addr);
        Ok(())
    }

    /// Return an address to the pool. Returns false if it was not allocated.
    pub fn release(&mut self, addr: Ipv4Addr) -> bool {
        self.allocated.remove(&addr)
    }

    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        self.allocated.contains(&addr)
    }

    /// Get remaining addresses.
    pub fn remaining(&self) -> usize {
        self.cidr
            .hosts()
            .filter(|a| !self.is_reserved(*a) && !self.allocated.contains(a))
            .count()
    }
}
