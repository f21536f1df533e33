//! Gateway discovery race
//!
//! Every discoverer runs in its own task. The first one to produce a gateway
//! wins; when all of them give up the result is [`Error::NoGatewayFound`]; if
//! the caller's context finishes first its reason is returned.
//!
//! When several discoverers succeed at nearly the same time the winner is
//! whichever handle reaches the result channel first. There is no priority
//! between protocols.

use crate::config::DiscoveryConfig;
use crate::context::{CancelHandle, DiscoveryContext};
use crate::gateway::Gateway;
use crate::natpmp::NatPmpDiscoverer;
use crate::port::PortSelector;
use crate::upnp::{IgdDiscoverer, IgdVersion};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One way of finding a gateway
///
/// Implementations should stop their network waits once `ctx` finishes and
/// release their sockets; losing discoverers are never aborted, only
/// cancelled through the context.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &'static str;

    /// Attempt to locate a gateway. Errors are logged and otherwise ignored
    /// by the race.
    async fn discover(&self, ctx: DiscoveryContext) -> Result<Box<dyn Gateway>>;
}

/// Cancels the race context when the race is decided or abandoned
struct RaceGuard(CancelHandle);

impl Drop for RaceGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Runs a set of discoverers against each other
///
/// # Example
///
/// ```no_run
/// use natgate::{DiscoveryConfig, DiscoveryContext, GatewayDiscovery};
/// use std::time::Duration;
///
/// # async fn example() -> natgate::Result<()> {
/// let discovery = GatewayDiscovery::new(DiscoveryConfig::default());
/// let ctx = DiscoveryContext::background().with_timeout(Duration::from_secs(10));
///
/// let gateway = discovery.discover(&ctx).await?;
/// println!("{} at {}", gateway.kind(), gateway.device_address()?);
/// # Ok(())
/// # }
/// ```
pub struct GatewayDiscovery {
    discoverers: Vec<Arc<dyn Discoverer>>,
}

impl GatewayDiscovery {
    /// Race IGD v1, IGD v2 and NAT-PMP
    pub fn new(config: DiscoveryConfig) -> Self {
        Self::with_port_selector(config, Arc::new(PortSelector::from_entropy()))
    }

    /// Like [`GatewayDiscovery::new`] with an explicit port source
    pub fn with_port_selector(config: DiscoveryConfig, ports: Arc<PortSelector>) -> Self {
        Self::with_discoverers(vec![
            Arc::new(IgdDiscoverer::new(
                IgdVersion::V1,
                config.clone(),
                ports.clone(),
            )),
            Arc::new(IgdDiscoverer::new(
                IgdVersion::V2,
                config.clone(),
                ports.clone(),
            )),
            Arc::new(NatPmpDiscoverer::new(config, ports)),
        ])
    }

    /// Race a custom set of discoverers
    pub fn with_discoverers(discoverers: Vec<Arc<dyn Discoverer>>) -> Self {
        Self { discoverers }
    }

    /// Names of the discoverers taking part
    pub fn discoverer_names(&self) -> Vec<&'static str> {
        self.discoverers.iter().map(|d| d.name()).collect()
    }

    /// Find a gateway
    ///
    /// Returns exactly one of: the first gateway found,
    /// [`Error::NoGatewayFound`] once every discoverer has given up, or
    /// [`Error::Cancelled`] when `ctx` finishes first.
    pub async fn discover(&self, ctx: &DiscoveryContext) -> Result<Box<dyn Gateway>> {
        if let Some(reason) = ctx.err() {
            debug!("Discovery context already finished: {}", reason);
            return Err(reason.into());
        }

        let (race_ctx, race_cancel) = ctx.child();
        let _guard = RaceGuard(race_cancel);

        // Capacity covers one send per discoverer, so no sender ever waits
        let (tx, mut rx) = mpsc::channel(self.discoverers.len().max(1));
        for discoverer in &self.discoverers {
            let discoverer = discoverer.clone();
            let ctx = race_ctx.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let name = discoverer.name();
                match discoverer.discover(ctx).await {
                    Ok(gateway) => {
                        if tx.send(gateway).await.is_err() {
                            debug!("{} found a gateway after the race was decided", name);
                        }
                    }
                    Err(e) => debug!("{} found no gateway: {}", name, e),
                }
            });
        }
        // Channel closes once every task has dropped its sender
        drop(tx);

        // Cancelling `ctx` also ends every discoverer and closes the channel,
        // so the context must be checked before the channel
        tokio::select! {
            biased;
            reason = ctx.done() => {
                debug!("Gateway discovery aborted: {}", reason);
                Err(reason.into())
            }
            received = rx.recv() => match received {
                Some(gateway) => {
                    info!("Discovered {} gateway", gateway.kind());
                    Ok(gateway)
                }
                None => {
                    if let Some(reason) = ctx.err() {
                        debug!("Gateway discovery aborted: {}", reason);
                        return Err(reason.into());
                    }
                    info!("No NAT gateway found by {:?}", self.discoverer_names());
                    Err(Error::NoGatewayFound)
                }
            },
        }
    }
}

/// Find a gateway with the default discoverers and configuration
///
/// # Example
///
/// ```no_run
/// use natgate::{discover_gateway, DiscoveryContext, Error};
/// use std::time::Duration;
///
/// # async fn example() {
/// let ctx = DiscoveryContext::background().with_timeout(Duration::from_secs(10));
/// match discover_gateway(&ctx).await {
///     Ok(gateway) => println!("Using {}", gateway.kind()),
///     Err(Error::NoGatewayFound) => println!("No NAT, falling back to relay"),
///     Err(e) => println!("Discovery failed: {}", e),
/// }
/// # }
/// ```
pub async fn discover_gateway(ctx: &DiscoveryContext) -> Result<Box<dyn Gateway>> {
    GatewayDiscovery::new(DiscoveryConfig::default())
        .discover(ctx)
        .await
}
