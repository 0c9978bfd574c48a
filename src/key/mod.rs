//! Client identifiers.
//!
//! A [`ClientId`] is the partition key for all rate limit state. The engine
//! treats it as an opaque string; how it is derived (network address, user,
//! API key) is the caller's business. Conversions from IP and socket addresses
//! are provided because that is the common case.
//!
//! # Example
//!
//! ```ignore
//! use admit_ratelimit::ClientId;
//! use std::net::SocketAddr;
//!
//! let peer: SocketAddr = "203.0.113.7:51234".parse()?;
//! let client = ClientId::from(peer);
//! assert_eq!(client.as_str(), "203.0.113.7");
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Opaque identifier partitioning rate limit state between clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client identifier from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<IpAddr> for ClientId {
    fn from(ip: IpAddr) -> Self {
        // IPv4-mapped IPv6 peers share state with their IPv4 form.
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Self(ip.to_string())
    }
}

/// The port is dropped: all connections from one address are one client.
impl From<SocketAddr> for ClientId {
    fn from(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }
}
