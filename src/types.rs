//! Common types shared by the gateway handles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl From<Protocol> for igd_next::PortMappingProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => igd_next::PortMappingProtocol::TCP,
            Protocol::Udp => igd_next::PortMappingProtocol::UDP,
        }
    }
}

/// Arguments of a port mapping operation
///
/// This is not tracked after the call returns; renewing a mapping means
/// sending the same request again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMappingRequest {
    /// Transport protocol to forward
    pub protocol: Protocol,
    /// Port on the local host receiving the traffic
    pub internal_port: u16,
    /// Human readable label stored on the gateway (UPnP only)
    pub description: String,
    /// Requested lease duration
    ///
    /// Zero asks for a permanent mapping on UPnP. NAT-PMP has no permanent
    /// leases and treats a zero lifetime as a deletion, so there zero becomes
    /// the 7200s lease RFC 6886 recommends and a fractional second rounds up.
    pub lifetime: Duration,
}

impl PortMappingRequest {
    /// Create a new request
    pub fn new(
        protocol: Protocol,
        internal_port: u16,
        description: impl Into<String>,
        lifetime: Duration,
    ) -> Self {
        Self {
            protocol,
            internal_port,
            description: description.into(),
            lifetime,
        }
    }

    /// Lease duration in whole seconds, saturated to the wire width
    pub fn lifetime_secs(&self) -> u32 {
        u32::try_from(self.lifetime.as_secs()).unwrap_or(u32::MAX)
    }
}

/// Errors that can occur while adding or deleting a port mapping
#[derive(Debug, Error)]
pub enum MappingError {
    /// The exchange did not complete within the caller's timeout
    #[error("Mapping request timed out")]
    Timeout,

    /// The gateway refused the request
    #[error("Gateway rejected request: {0}")]
    Rejected(String),

    /// The gateway answered with something we could not understand
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
