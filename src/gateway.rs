//! The capability contract every discovered gateway satisfies

use crate::address::{AddressClass, classify_address};
use crate::types::{PortMappingRequest, Protocol};
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// A NAT gateway bound to one protocol session
///
/// Handles are returned by [`crate::discover_gateway`] and owned by the
/// caller. Mapping operations change state on the physical device; they are
/// not guaranteed to be idempotent (re-adding an existing mapping may succeed
/// or be rejected depending on the router).
#[async_trait]
pub trait Gateway: Send + Sync + Debug {
    /// Which port mapping protocol this handle speaks
    fn kind(&self) -> &'static str;

    /// Address of the gateway device on the local network
    ///
    /// Fails with [`Error::NoDeviceAddress`].
    fn device_address(&self) -> Result<IpAddr>;

    /// Public address the gateway reports for itself
    ///
    /// Queries the device. Fails with [`Error::NoExternalAddress`].
    async fn external_address(&self) -> Result<IpAddr>;

    /// Address of the local host used to talk to the gateway
    ///
    /// Fails with [`Error::NoInternalAddress`].
    fn internal_address(&self) -> Result<IpAddr>;

    /// Forward an external port to `request.internal_port` on this host
    ///
    /// Returns the external port the gateway assigned. The whole exchange is
    /// bounded by `timeout`; when it expires the call fails with
    /// [`crate::MappingError::Timeout`].
    async fn add_port_mapping(&self, request: &PortMappingRequest, timeout: Duration)
    -> Result<u16>;

    /// Remove the mapping previously added for `internal_port`
    async fn delete_port_mapping(&self, protocol: Protocol, internal_port: u16) -> Result<()>;

    /// Classify the external address to detect a gateway behind another NAT
    async fn address_class(&self) -> Result<AddressClass> {
        let external = self.external_address().await?;
        Ok(classify_address(external))
    }
}

/// Resolve the local address the OS would use to reach `gateway`
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub(crate) async fn local_address_towards(gateway: SocketAddr) -> Result<IpAddr> {
    let bind: SocketAddr = match gateway {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await.map_err(|e| {
        debug!("Failed to bind route probe socket: {}", e);
        Error::NoInternalAddress
    })?;
    socket.connect(gateway).await.map_err(|e| {
        debug!("No route towards {}: {}", gateway, e);
        Error::NoInternalAddress
    })?;
    let local = socket
        .local_addr()
        .map_err(|_| Error::NoInternalAddress)?
        .ip();

    if local.is_unspecified() {
        return Err(Error::NoInternalAddress);
    }
    Ok(local)
}
