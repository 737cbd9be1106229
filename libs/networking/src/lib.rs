//! Networking utilities for the SDN agent.
//!
//! This library provides helpers for:
//! - MAC address parsing and canonical formatting
//! - Linux interface and bridge name validation
//! - Classifying which host interfaces the agent manages

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum interface name length (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Invalid interface name.
    #[error("invalid interface name {name:?}: {reason}")]
    InvalidIfname { name: String, reason: &'static str },

    /// Invalid bridge name.
    #[error("invalid bridge name {name:?}: {reason}")]
    InvalidBridge { name: String, reason: &'static str },
}

// ============================================================================
// MAC addresses
// ============================================================================

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether the locally-administered bit is set.
    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl FromStr for MacAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sep = if s.contains('-') { '-' } else { ':' };
        let parts: Vec<&str> = s.trim().split(sep).collect();
        if parts.len() != 6 {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(NetworkError::InvalidMac(s.to_string()));
            }
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
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

// ============================================================================
// Interface names
// ============================================================================

fn name_problem(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty");
    }
    if name.len() > MAX_IFNAME_LEN {
        return Some("longer than 15 bytes");
    }
    if name == "." || name == ".." {
        return Some("reserved name");
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c == '\0' || c.is_whitespace())
    {
        return Some("contains a forbidden character");
    }
    None
}

/// Validate a Linux network interface name.
pub fn validate_ifname(name: &str) -> Result<(), NetworkError> {
    match name_problem(name) {
        Some(reason) => Err(NetworkError::InvalidIfname {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Validate a virtual bridge name.
///
/// Bridges are backed by a kernel interface of the same name, so the same
/// rules apply.
pub fn validate_bridge_name(name: &str) -> Result<(), NetworkError> {
    match name_problem(name) {
        Some(reason) => Err(NetworkError::InvalidBridge {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

// ============================================================================
// Managed interfaces
// ============================================================================

/// Interface-name prefixes of devices created for workloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePrefixes(Vec<String>);

impl InterfacePrefixes {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        )
    }

    /// Parse a comma-separated prefix list.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(',').map(str::trim))
    }

    /// Whether an interface was created for a workload.
    pub fn is_managed(&self, ifname: &str) -> bool {
        self.0.iter().any(|p| ifname.starts_with(p.as_str()))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl Default for InterfacePrefixes {
    fn default() -> Self {
        Self::new(["vnet", "tap"])
    }
}
