//! NAT-PMP (NAT Port Mapping Protocol) gateway - RFC 6886
//!
//! NAT-PMP uses UDP on port 5351 of the default gateway. It has no discovery
//! step: a gateway exists if the default router answers an external address
//! request.
//!
//! # Protocol Overview
//!
//! Requests are retransmitted with a wait that starts at 250ms and doubles on
//! every attempt. Each response echoes the request opcode plus 128 and carries
//! a 16-bit result code.

use crate::config::DiscoveryConfig;
use crate::context::DiscoveryContext;
use crate::discovery::Discoverer;
use crate::gateway::{Gateway, local_address_towards};
use crate::port::PortSelector;
use crate::route::find_default_gateway;
use crate::types::{MappingError, PortMappingRequest, Protocol};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info, warn};

/// NAT-PMP server port (IANA assigned)
pub const NATPMP_SERVER_PORT: u16 = 5351;

/// NAT-PMP protocol version
pub(crate) const NATPMP_VERSION: u8 = 0;

/// Offset added to the request opcode in responses
const RESPONSE_OPCODE_OFFSET: u8 = 128;

/// Random listener ports tried before letting the OS pick one
const BIND_ATTEMPTS: usize = 3;

/// Lease used when no lifetime is requested (RFC 6886 section 3.3)
pub(crate) const DEFAULT_LEASE_SECS: u32 = 7200;

/// Lease to put on the wire for a MAP that creates a mapping
///
/// A zero lifetime would destroy the mapping, so it never goes out here.
pub(crate) fn mapping_lease_secs(lifetime: Duration) -> u32 {
    if lifetime.is_zero() {
        return DEFAULT_LEASE_SECS;
    }
    let secs = lifetime.as_secs() + u64::from(lifetime.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// NAT-PMP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum NatPmpOpcode {
    /// External address request
    ExternalAddress = 0,
    /// UDP port mapping
    MapUdp = 1,
    /// TCP port mapping
    MapTcp = 2,
}

impl NatPmpOpcode {
    fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Udp => Self::MapUdp,
            Protocol::Tcp => Self::MapTcp,
        }
    }

    fn response(self) -> u8 {
        self as u8 + RESPONSE_OPCODE_OFFSET
    }
}

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum NatPmpResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl NatPmpResultCode {
    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsupportedVersion => "Unsupported NAT-PMP version",
            Self::NotAuthorized => "Not authorized/refused",
            Self::NetworkFailure => "Network failure",
            Self::OutOfResources => "Out of resources",
            Self::UnsupportedOpcode => "Unsupported opcode",
        }
    }
}

/// Decoded MAP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapResponse {
    pub epoch_secs: u32,
    pub internal_port: u16,
    pub external_port: u16,
    pub lifetime_secs: u32,
}

/// Build an external address request packet (2 bytes)
pub(crate) fn build_external_address_request() -> [u8; 2] {
    [NATPMP_VERSION, NatPmpOpcode::ExternalAddress as u8]
}

/// Build a MAP request packet (12 bytes)
///
/// A lifetime of zero deletes the mapping; deleting requires a suggested
/// external port of zero as well.
pub(crate) fn build_map_request(
    protocol: Protocol,
    internal_port: u16,
    suggested_external_port: u16,
    lifetime_secs: u32,
) -> [u8; 12] {
    let mut request = [0u8; 12];
    request[0] = NATPMP_VERSION;
    request[1] = NatPmpOpcode::for_protocol(protocol) as u8;
    // bytes 2-3 reserved
    request[4..6].copy_from_slice(&internal_port.to_be_bytes());
    request[6..8].copy_from_slice(&suggested_external_port.to_be_bytes());
    request[8..12].copy_from_slice(&lifetime_secs.to_be_bytes());
    request
}

/// Validate version, opcode and result code shared by every response
fn check_response_header(
    response: &[u8],
    opcode: NatPmpOpcode,
    expected_len: usize,
) -> std::result::Result<(), MappingError> {
    if response.len() < expected_len {
        return Err(MappingError::InvalidResponse(format!(
            "Response too short: {} bytes (expected {})",
            response.len(),
            expected_len
        )));
    }

    if response[0] != NATPMP_VERSION {
        return Err(MappingError::InvalidResponse(format!(
            "Invalid version: {} (expected {})",
            response[0], NATPMP_VERSION
        )));
    }

    if response[1] != opcode.response() {
        return Err(MappingError::InvalidResponse(format!(
            "Unexpected opcode: {} (expected {})",
            response[1],
            opcode.response()
        )));
    }

    let code = u16::from_be_bytes([response[2], response[3]]);
    let result = NatPmpResultCode::from_u16(code)
        .ok_or_else(|| MappingError::InvalidResponse(format!("Unknown result code: {}", code)))?;
    if result != NatPmpResultCode::Success {
        return Err(MappingError::Rejected(result.to_error_message().to_string()));
    }

    Ok(())
}

/// Parse an external address response (12 bytes)
pub(crate) fn parse_external_address_response(
    response: &[u8],
) -> std::result::Result<Ipv4Addr, MappingError> {
    check_response_header(response, NatPmpOpcode::ExternalAddress, 12)?;
    Ok(Ipv4Addr::new(
        response[8],
        response[9],
        response[10],
        response[11],
    ))
}

/// Parse a MAP response (16 bytes)
pub(crate) fn parse_map_response(
    response: &[u8],
    protocol: Protocol,
) -> std::result::Result<MapResponse, MappingError> {
    check_response_header(response, NatPmpOpcode::for_protocol(protocol), 16)?;
    Ok(MapResponse {
        epoch_secs: u32::from_be_bytes([response[4], response[5], response[6], response[7]]),
        internal_port: u16::from_be_bytes([response[8], response[9]]),
        external_port: u16::from_be_bytes([response[10], response[11]]),
        lifetime_secs: u32::from_be_bytes([
            response[12],
            response[13],
            response[14],
            response[15],
        ]),
    })
}

/// Retransmission policy and addressing for one gateway
#[derive(Debug, Clone)]
struct Exchange {
    gateway: SocketAddr,
    ports: Arc<PortSelector>,
    initial_timeout: Duration,
    max_attempts: u32,
}

impl Exchange {
    fn new(gateway: SocketAddr, ports: Arc<PortSelector>, config: &DiscoveryConfig) -> Self {
        Self {
            gateway,
            ports,
            initial_timeout: config.natpmp_initial_timeout(),
            max_attempts: config.natpmp_max_attempts,
        }
    }

    /// Bind the response listener on a random high port
    async fn bind(&self) -> std::io::Result<UdpSocket> {
        for _ in 0..BIND_ATTEMPTS {
            let port = self.ports.random_port();
            match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) => debug!("NAT-PMP listener port {} unavailable: {}", port, e),
            }
        }
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await
    }

    /// Send `request` until a response carrying `opcode` arrives
    async fn send(
        &self,
        request: &[u8],
        opcode: NatPmpOpcode,
    ) -> std::result::Result<Vec<u8>, MappingError> {
        let socket = self.bind().await?;
        socket.connect(self.gateway).await?;

        let mut wait = self.initial_timeout;
        let mut buf = [0u8; 16];
        for attempt in 1..=self.max_attempts {
            socket.send(request).await?;
            debug!(
                "Sent NAT-PMP opcode {} to {} (attempt {}/{})",
                opcode as u8, self.gateway, attempt, self.max_attempts
            );

            match time::timeout(wait, recv_response(&socket, &mut buf, opcode)).await {
                Ok(Ok(len)) => return Ok(buf[..len].to_vec()),
                Ok(Err(e)) => return Err(MappingError::Io(e)),
                Err(_) => wait *= 2,
            }
        }

        Err(MappingError::Timeout)
    }
}

/// Receive until a datagram answering `opcode` shows up; stale answers to
/// earlier requests are skipped
async fn recv_response(
    socket: &UdpSocket,
    buf: &mut [u8],
    opcode: NatPmpOpcode,
) -> std::io::Result<usize> {
    loop {
        let len = socket.recv(buf).await?;
        if len >= 2 && buf[1] == opcode.response() {
            return Ok(len);
        }
        debug!("Ignoring unrelated NAT-PMP datagram ({} bytes)", len);
    }
}

/// Gateway handle speaking NAT-PMP
#[derive(Debug)]
pub struct NatPmpGateway {
    exchange: Exchange,
    internal: Option<IpAddr>,
    query_timeout: Duration,
}

impl NatPmpGateway {
    /// Handle for the NAT-PMP server listening at `gateway`
    pub(crate) fn new(
        gateway: SocketAddr,
        internal: Option<IpAddr>,
        ports: Arc<PortSelector>,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            exchange: Exchange::new(gateway, ports, config),
            internal,
            query_timeout: config.query_timeout(),
        }
    }

    async fn query_external_address(&self) -> std::result::Result<Ipv4Addr, MappingError> {
        let response = self
            .exchange
            .send(&build_external_address_request(), NatPmpOpcode::ExternalAddress)
            .await?;
        parse_external_address_response(&response)
    }

    async fn map(
        &self,
        protocol: Protocol,
        internal_port: u16,
        suggested_external_port: u16,
        lifetime_secs: u32,
    ) -> std::result::Result<MapResponse, MappingError> {
        let request = build_map_request(
            protocol,
            internal_port,
            suggested_external_port,
            lifetime_secs,
        );
        let response = self
            .exchange
            .send(&request, NatPmpOpcode::for_protocol(protocol))
            .await?;
        parse_map_response(&response, protocol)
    }
}

#[async_trait]
impl Gateway for NatPmpGateway {
    fn kind(&self) -> &'static str {
        "NAT-PMP"
    }

    fn device_address(&self) -> Result<IpAddr> {
        Ok(self.exchange.gateway.ip())
    }

    async fn external_address(&self) -> Result<IpAddr> {
        match time::timeout(self.query_timeout, self.query_external_address()).await {
            Ok(Ok(ip)) if !ip.is_unspecified() => Ok(IpAddr::V4(ip)),
            Ok(Ok(_)) => Err(Error::NoExternalAddress),
            Ok(Err(e)) => {
                debug!("NAT-PMP external address query failed: {}", e);
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
        let lease_secs = mapping_lease_secs(request.lifetime);
        info!(
            "Adding NAT-PMP mapping for port {} (lifetime: {}s, protocol: {})",
            request.internal_port, lease_secs, request.protocol
        );

        let mapping = self.map(
            request.protocol,
            request.internal_port,
            request.internal_port,
            lease_secs,
        );
        let response = time::timeout(timeout, mapping)
            .await
            .map_err(|_| MappingError::Timeout)?
            .inspect_err(|e| warn!("NAT-PMP mapping failed: {}", e))?;

        if response.external_port == 0 {
            return Err(MappingError::InvalidResponse("gateway assigned port 0".to_string()).into());
        }
        debug!(
            "NAT-PMP MAP answered for internal port {} (gateway epoch {}s)",
            response.internal_port, response.epoch_secs
        );

        info!(
            "NAT-PMP mapping successful: external port {} (lifetime: {}s)",
            response.external_port, response.lifetime_secs
        );
        Ok(response.external_port)
    }

    async fn delete_port_mapping(&self, protocol: Protocol, internal_port: u16) -> Result<()> {
        info!(
            "Deleting NAT-PMP mapping for port {} (protocol: {})",
            internal_port, protocol
        );

        time::timeout(self.query_timeout, self.map(protocol, internal_port, 0, 0))
            .await
            .map_err(|_| MappingError::Timeout)??;
        Ok(())
    }
}

/// Looks for a NAT-PMP gateway at the default route
#[derive(Debug)]
pub struct NatPmpDiscoverer {
    config: DiscoveryConfig,
    ports: Arc<PortSelector>,
}

impl NatPmpDiscoverer {
    /// Create a discoverer; `ports` also serves the handles it produces
    pub fn new(config: DiscoveryConfig, ports: Arc<PortSelector>) -> Self {
        Self { config, ports }
    }
}

#[async_trait]
impl Discoverer for NatPmpDiscoverer {
    fn name(&self) -> &'static str {
        "NAT-PMP"
    }

    async fn discover(&self, ctx: DiscoveryContext) -> Result<Box<dyn Gateway>> {
        // Route lookup reads files or runs a platform tool
        let lookup = tokio::task::spawn_blocking(find_default_gateway);
        let gateway_ip = tokio::select! {
            biased;
            reason = ctx.done() => return Err(reason.into()),
            res = lookup => res.ok().flatten().ok_or(Error::NoGatewayFound)?,
        };
        debug!("Probing NAT-PMP at default gateway {}", gateway_ip);

        let gateway = NatPmpGateway::new(
            SocketAddr::new(gateway_ip, NATPMP_SERVER_PORT),
            None,
            self.ports.clone(),
            &self.config,
        );

        let external = tokio::select! {
            res = gateway.query_external_address() => res.map_err(|e| {
                debug!("NAT-PMP probe failed: {}", e);
                Error::NoGatewayFound
            })?,
            reason = ctx.done() => return Err(reason.into()),
        };

        let internal = local_address_towards(gateway.exchange.gateway).await.ok();
        info!(
            "Found NAT-PMP gateway {} (external address {})",
            gateway_ip, external
        );

        Ok(Box::new(NatPmpGateway { internal, ..gateway }))
    }
}
