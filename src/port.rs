//! Pseudo-random port selection for protocol exchanges
//!
//! Ports are drawn from the high range so they stay clear of well-known
//! services. Not security sensitive.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Lowest port handed out
pub const MIN_RANDOM_PORT: u16 = 10000;

/// Source of random high ports
///
/// Owns its generator so nothing depends on process-wide random state; tests
/// use [`PortSelector::seeded`] for reproducible sequences.
#[derive(Debug)]
pub struct PortSelector {
    rng: Mutex<StdRng>,
}

impl PortSelector {
    /// Selector seeded from the operating system
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Selector with a fixed seed
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Next port in `[10000, 65535)`
    pub fn random_port(&self) -> u16 {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(MIN_RANDOM_PORT..u16::MAX)
    }
}

impl Default for PortSelector {
    fn default() -> Self {
        Self::from_entropy()
    }
}
