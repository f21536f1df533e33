//! UPnP IGD (Internet Gateway Device) gateways, versions 1 and 2
//!
//! Devices are located with SSDP (Simple Service Discovery Protocol)
//! multicast, then driven over SOAP through igd-next.
//!
//! IGD v1 discovery is igd-next's own search. For IGD v2 we first send an
//! SSDP probe with the v2 search target, so only a device that advertises
//! v2 is accepted, then bind igd-next to that device with a unicast search.

use crate::config::DiscoveryConfig;
use crate::context::DiscoveryContext;
use crate::discovery::Discoverer;
use crate::gateway::{Gateway, local_address_towards};
use crate::port::PortSelector;
use crate::types::{MappingError, PortMappingRequest, Protocol};
use crate::{Error, Result};
use async_trait::async_trait;
use igd_next::SearchOptions;
use igd_next::aio::tokio::{Tokio, search_gateway};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info, warn};

/// SSDP multicast group and port
const SSDP_MULTICAST_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

/// Random external ports tried once the internal port is refused
const RANDOM_PORT_ATTEMPTS: usize = 3;

/// igd-next gateway driven by the tokio runtime
type IgdGateway = igd_next::aio::Gateway<Tokio>;

/// Internet Gateway Device specification version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgdVersion {
    /// InternetGatewayDevice:1
    V1,
    /// InternetGatewayDevice:2
    V2,
}

impl IgdVersion {
    /// SSDP search target naming this device type
    pub fn search_target(self) -> &'static str {
        match self {
            IgdVersion::V1 => "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
            IgdVersion::V2 => "urn:schemas-upnp-org:device:InternetGatewayDevice:2",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            IgdVersion::V1 => "UPNP (IGDv1)",
            IgdVersion::V2 => "UPNP (IGDv2)",
        }
    }
}

/// Build an SSDP M-SEARCH request
pub(crate) fn build_search_request(search_target: &str, mx_secs: u64) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         ST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\r\n",
        SSDP_MULTICAST_ADDR, search_target, mx_secs
    )
}

/// Headers of an SSDP search reply that matter for locating the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SsdpReply {
    pub search_target: String,
    pub location: String,
}

/// Parse an SSDP search reply; `None` unless it is a `200 OK` carrying both
/// `ST` and `LOCATION`
pub(crate) fn parse_search_reply(text: &str) -> Option<SsdpReply> {
    let mut lines = text.lines();
    let status = lines.next()?;
    if !status.starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut search_target = None;
    let mut location = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("st") {
            search_target = Some(value.to_string());
        } else if name.trim().eq_ignore_ascii_case("location") {
            location = Some(value.to_string());
        }
    }

    Some(SsdpReply {
        search_target: search_target?,
        location: location?,
    })
}

/// Host address of a description URL such as `http://192.168.1.1:5000/desc.xml`
pub(crate) fn location_host(location: &str) -> Option<IpAddr> {
    let rest = location
        .strip_prefix("http://")
        .or_else(|| location.strip_prefix("https://"))?;
    let authority = rest.split('/').next()?;
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

/// Multicast an M-SEARCH for `version` and return the first device address
/// whose reply names that version
async fn ssdp_probe(version: IgdVersion, timeout: Duration) -> std::io::Result<Option<IpAddr>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let mx = timeout.as_secs().clamp(1, 5);
    let request = build_search_request(version.search_target(), mx);
    socket
        .send_to(request.as_bytes(), SSDP_MULTICAST_ADDR)
        .await?;
    debug!("Sent SSDP search for {}", version.search_target());

    let mut buf = [0u8; 2048];
    let wait_reply = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            let text = String::from_utf8_lossy(&buf[..len]);
            let Some(reply) = parse_search_reply(&text) else {
                continue;
            };
            if reply.search_target != version.search_target() {
                debug!("Ignoring SSDP reply for {}", reply.search_target);
                continue;
            }
            let device = location_host(&reply.location).unwrap_or(from.ip());
            return Ok::<_, std::io::Error>(Some(device));
        }
    };

    match time::timeout(timeout, wait_reply).await {
        Ok(res) => res,
        Err(_) => Ok(None),
    }
}

async fn search(version: IgdVersion, timeout: Duration) -> Result<IgdGateway> {
    let options = match version {
        IgdVersion::V1 => SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        },
        IgdVersion::V2 => {
            let device = ssdp_probe(version, timeout)
                .await
                .map_err(|e| {
                    debug!("SSDP probe failed: {}", e);
                    Error::NoGatewayFound
                })?
                .ok_or(Error::NoGatewayFound)?;
            debug!("IGDv2 device answered at {}", device);
            SearchOptions {
                broadcast_address: SocketAddr::new(device, SSDP_MULTICAST_ADDR.port()),
                timeout: Some(timeout),
                ..Default::default()
            }
        }
    };

    search_gateway(options).await.map_err(|e| {
        debug!("UPnP {:?} gateway search failed: {}", version, e);
        Error::NoGatewayFound
    })
}

/// SOAP actions a UPnP handle needs from the device
#[async_trait]
pub(crate) trait IgdControl: Send + Sync {
    /// Address of the device's control endpoint
    fn addr(&self) -> SocketAddr;

    async fn external_ip(&self) -> std::result::Result<IpAddr, String>;

    async fn add_port(
        &self,
        protocol: Protocol,
        external_port: u16,
        local_addr: SocketAddr,
        lease_secs: u32,
        description: &str,
    ) -> std::result::Result<(), String>;

    async fn remove_port(&self, protocol: Protocol, external_port: u16)
    -> std::result::Result<(), String>;
}

#[async_trait]
impl IgdControl for IgdGateway {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn external_ip(&self) -> std::result::Result<IpAddr, String> {
        self.get_external_ip().await.map_err(|e| e.to_string())
    }

    async fn add_port(
        &self,
        protocol: Protocol,
        external_port: u16,
        local_addr: SocketAddr,
        lease_secs: u32,
        description: &str,
    ) -> std::result::Result<(), String> {
        IgdGateway::add_port(
            self,
            protocol.into(),
            external_port,
            local_addr,
            lease_secs,
            description,
        )
        .await
        .map_err(|e| e.to_string())
    }

    async fn remove_port(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> std::result::Result<(), String> {
        IgdGateway::remove_port(self, protocol.into(), external_port)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Gateway handle speaking UPnP IGD
pub struct UpnpGateway {
    version: IgdVersion,
    control: Box<dyn IgdControl>,
    internal: Option<IpAddr>,
    ports: Arc<PortSelector>,
    query_timeout: Duration,
    /// External port allocated per (protocol, internal port) in this session
    mappings: Mutex<HashMap<(Protocol, u16), u16>>,
}

impl fmt::Debug for UpnpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpnpGateway")
            .field("version", &self.version)
            .field("addr", &self.control.addr())
            .field("internal", &self.internal)
            .finish()
    }
}

impl UpnpGateway {
    pub(crate) fn new(
        version: IgdVersion,
        control: Box<dyn IgdControl>,
        internal: Option<IpAddr>,
        ports: Arc<PortSelector>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            version,
            control,
            internal,
            ports,
            query_timeout,
            mappings: Mutex::new(HashMap::new()),
        }
    }

    /// IGD version this handle was discovered with
    pub fn version(&self) -> IgdVersion {
        self.version
    }

    fn recorded_port(&self, key: (Protocol, u16)) -> Option<u16> {
        self.mappings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .copied()
    }

    fn record_port(&self, key: (Protocol, u16), external_port: Option<u16>) {
        let mut mappings = self
            .mappings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match external_port {
            Some(port) => mappings.insert(key, port),
            None => mappings.remove(&key),
        };
    }

    /// External ports to try: a previous allocation, the internal port, then
    /// random high ports
    fn candidate_ports(&self, key: (Protocol, u16)) -> Vec<u16> {
        let mut candidates = Vec::with_capacity(RANDOM_PORT_ATTEMPTS + 2);
        candidates.extend(self.recorded_port(key));
        candidates.push(key.1);
        candidates.extend((0..RANDOM_PORT_ATTEMPTS).map(|_| self.ports.random_port()));
        candidates.dedup();
        candidates
    }
}

#[async_trait]
impl Gateway for UpnpGateway {
    fn kind(&self) -> &'static str {
        self.version.kind()
    }

    fn device_address(&self) -> Result<IpAddr> {
        let ip = self.control.addr().ip();
        if ip.is_unspecified() {
            return Err(Error::NoDeviceAddress);
        }
        Ok(ip)
    }

    async fn external_address(&self) -> Result<IpAddr> {
        match time::timeout(self.query_timeout, self.control.external_ip()).await {
            Ok(Ok(ip)) if !ip.is_unspecified() => Ok(ip),
            Ok(Ok(_)) => Err(Error::NoExternalAddress),
            Ok(Err(e)) => {
                debug!("GetExternalIPAddress failed: {}", e);
                Err(Error::NoExternalAddress)
            }
            Err(_) => Err(Error::NoExternalAddress),
        }
    }

    fn internal_address(&self) -> Result<IpAddr> {
        self.internal.ok_or(Error::NoInternalAddress)
    }

    async fn add_port_mapping(
        &self,
        request: &PortMappingRequest,
        timeout: Duration,
    ) -> Result<u16> {
        let internal = self.internal_address()?;
        let local_addr = SocketAddr::new(internal, request.internal_port);
        let key = (request.protocol, request.internal_port);
        let candidates = self.candidate_ports(key);

        info!(
            "Adding UPnP mapping for {} (lifetime: {}s, protocol: {})",
            local_addr,
            request.lifetime_secs(),
            request.protocol
        );

        // Record as soon as the device accepts, so a timeout racing the
        // reply cannot lose track of a live mapping
        let attempt = async {
            let mut last_error = String::from("no candidate port");
            for external_port in candidates {
                match self
                    .control
                    .add_port(
                        request.protocol,
                        external_port,
                        local_addr,
                        request.lifetime_secs(),
                        &request.description,
                    )
                    .await
                {
                    Ok(()) => {
                        self.record_port(key, Some(external_port));
                        return Ok(external_port);
                    }
                    Err(e) => {
                        debug!("AddPortMapping on external port {} failed: {}", external_port, e);
                        last_error = e;
                    }
                }
            }
            Err(MappingError::Rejected(last_error))
        };

        let external_port = time::timeout(timeout, attempt)
            .await
            .map_err(|_| MappingError::Timeout)?
            .inspect_err(|e| warn!("UPnP AddPortMapping failed: {}", e))?;

        info!(
            "UPnP mapping successful: external port {} -> {}",
            external_port, local_addr
        );
        Ok(external_port)
    }

    async fn delete_port_mapping(&self, protocol: Protocol, internal_port: u16) -> Result<()> {
        let key = (protocol, internal_port);
        let external_port = self.recorded_port(key).unwrap_or(internal_port);
        info!(
            "Deleting UPnP mapping on external port {} (protocol: {})",
            external_port, protocol
        );

        time::timeout(
            self.query_timeout,
            self.control.remove_port(protocol, external_port),
        )
        .await
        .map_err(|_| MappingError::Timeout)?
        .map_err(|e| MappingError::Rejected(format!("DeletePortMapping failed: {}", e)))?;

        self.record_port(key, None);
        Ok(())
    }
}

/// Looks for a UPnP gateway of one IGD version
#[derive(Debug)]
pub struct IgdDiscoverer {
    version: IgdVersion,
    config: DiscoveryConfig,
    ports: Arc<PortSelector>,
}

impl IgdDiscoverer {
    /// Create a discoverer; `ports` also serves the handles it produces
    pub fn new(version: IgdVersion, config: DiscoveryConfig, ports: Arc<PortSelector>) -> Self {
        Self {
            version,
            config,
            ports,
        }
    }
}

#[async_trait]
impl Discoverer for IgdDiscoverer {
    fn name(&self) -> &'static str {
        self.version.kind()
    }

    async fn discover(&self, ctx: DiscoveryContext) -> Result<Box<dyn Gateway>> {
        let gateway = tokio::select! {
            res = search(self.version, self.config.upnp_search_timeout()) => res?,
            reason = ctx.done() => return Err(reason.into()),
        };

        let internal = local_address_towards(gateway.addr).await.ok();
        info!(
            "Found UPnP {:?} gateway at {} (local address {:?})",
            self.version, gateway.addr, internal
        );

        Ok(Box::new(UpnpGateway::new(
            self.version,
            Box::new(gateway),
            internal,
            self.ports.clone(),
            self.config.query_timeout(),
        )))
    }
}
