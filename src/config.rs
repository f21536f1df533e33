//! Discovery timing configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for the protocol discoverers
///
/// Stored as JSON. Missing fields take their default values.
///
/// # Example
/// ```rust,no_run
/// use natgate::DiscoveryConfig;
///
/// let config = DiscoveryConfig::load("natgate.json").expect("Failed to load");
/// println!("UPnP search timeout: {:?}", config.upnp_search_timeout());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long an SSDP search waits for gateway replies, in milliseconds
    pub upnp_search_timeout_ms: u64,
    /// First NAT-PMP retransmission wait in milliseconds; doubles per attempt
    pub natpmp_initial_timeout_ms: u64,
    /// Number of NAT-PMP transmissions before giving up
    pub natpmp_max_attempts: u32,
    /// Upper bound for address queries made on an established handle
    pub query_timeout_ms: u64,
}

impl DiscoveryConfig {
    /// Load configuration from a JSON file
    ///
    /// Returns the defaults when the file does not exist or is empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Reject values that would make a discoverer give up before trying
    pub fn validate(&self) -> Result<()> {
        if self.natpmp_max_attempts == 0 {
            return Err(Error::Config(
                "natpmp_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.natpmp_initial_timeout_ms == 0 || self.upnp_search_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// SSDP search timeout
    pub fn upnp_search_timeout(&self) -> Duration {
        Duration::from_millis(self.upnp_search_timeout_ms)
    }

    /// Initial NAT-PMP retransmission wait
    pub fn natpmp_initial_timeout(&self) -> Duration {
        Duration::from_millis(self.natpmp_initial_timeout_ms)
    }

    /// Address query timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            upnp_search_timeout_ms: 5_000,
            natpmp_initial_timeout_ms: 250,
            natpmp_max_attempts: 4,
            query_timeout_ms: 2_000,
        }
    }
}
