//! Node addresses.

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A reachable `host:port` endpoint identifying a mesh node.
///
/// Validated on construction and on deserialization, so a value of this type
/// always has a non-empty host and a numeric port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Parse and validate a `host:port` string.
    pub fn parse(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        let invalid = |reason: &str| MeshError::InvalidAddress {
            address: address.clone(),
            reason: reason.to_string(),
        };

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        if port.parse::<u16>().is_err() {
            return Err(invalid("port is not a number in 0-65535"));
        }
        Ok(Self(address))
    }

    /// Build an address from parts.
    pub fn from_parts(host: &str, port: u16) -> Result<Self> {
        Self::parse(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(h, _)| h).unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeAddress {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<NodeAddress> for String {
    fn from(address: NodeAddress) -> Self {
        address.0
    }
}

impl AsRef<str> for NodeAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
