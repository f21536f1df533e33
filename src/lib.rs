//! Natgate - NAT gateway discovery and port mapping
//!
//! This library finds a single NAT gateway on the local network and exposes it
//! through one [`Gateway`] contract, whichever protocol the device speaks:
//! - UPnP IGD v1
//! - UPnP IGD v2
//! - NAT-PMP (RFC 6886)
//!
//! All discoverers are raced concurrently and the first one to find a gateway
//! wins. See [`discover_gateway`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod config;
pub mod context;
pub mod discovery;
pub mod gateway;
pub mod natpmp;
pub mod port;
pub mod route;
pub mod types;
pub mod upnp;

#[cfg(test)]
mod tests;

pub use address::{AddressClass, classify_address};
pub use config::DiscoveryConfig;
pub use context::{CancelHandle, ContextError, DiscoveryContext};
pub use discovery::{Discoverer, GatewayDiscovery, discover_gateway};
pub use gateway::Gateway;
pub use port::PortSelector;
pub use types::{MappingError, PortMappingRequest, Protocol};

/// Result type alias for Natgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Natgate operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No discoverer produced a gateway
    #[error("no NAT found")]
    NoGatewayFound,

    /// The discovery context was cancelled or its deadline passed
    #[error("discovery aborted: {0}")]
    Cancelled(#[from] ContextError),

    /// The gateway's own address could not be determined
    #[error("no device address")]
    NoDeviceAddress,

    /// The gateway reported no usable public address
    #[error("no external address")]
    NoExternalAddress,

    /// The local address used for the session could not be resolved
    #[error("no internal address")]
    NoInternalAddress,

    /// A port mapping operation failed
    #[error("port mapping failed: {0}")]
    Mapping(#[from] MappingError),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize logging for binaries and tests embedding Natgate
///
/// Honours `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
