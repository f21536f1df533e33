use crate::upnp::{
    IgdControl, IgdVersion, UpnpGateway, build_search_request, location_host, parse_search_reply,
};
use crate::types::{MappingError, PortMappingRequest, Protocol};
use crate::{Error, Gateway, PortSelector};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, Instant};

const V2_REPLY: &str = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=120\r\n\
ST: urn:schemas-upnp-org:device:InternetGatewayDevice:2\r\n\
USN: uuid:fc4ec57e-b051-11db-88f8-0060085db3f6::urn:schemas-upnp-org:device:InternetGatewayDevice:2\r\n\
EXT:\r\n\
SERVER: Linux/5.4 UPnP/2.0 MiniUPnPd/2.2\r\n\
Location: http://192.168.1.1:5000/rootDesc.xml\r\n\r\n";

#[test]
fn test_search_targets() {
    assert_eq!(
        IgdVersion::V1.search_target(),
        "urn:schemas-upnp-org:device:InternetGatewayDevice:1"
    );
    assert_eq!(
        IgdVersion::V2.search_target(),
        "urn:schemas-upnp-org:device:InternetGatewayDevice:2"
    );
}

#[test]
fn test_build_search_request() {
    let request = build_search_request(IgdVersion::V2.search_target(), 2);

    assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
    assert!(request.contains("HOST: 239.255.255.250:1900\r\n"));
    assert!(request.contains("ST: urn:schemas-upnp-org:device:InternetGatewayDevice:2\r\n"));
    assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
    assert!(request.contains("MX: 2\r\n"));
    assert!(request.ends_with("\r\n\r\n"));
}

#[test]
fn test_parse_search_reply() {
    let reply = parse_search_reply(V2_REPLY).expect("valid reply");
    assert_eq!(reply.search_target, IgdVersion::V2.search_target());
    assert_eq!(reply.location, "http://192.168.1.1:5000/rootDesc.xml");
}

#[test]
fn test_parse_search_reply_rejects_incomplete() {
    // Not a success status
    assert!(parse_search_reply("HTTP/1.1 404 Not Found\r\n\r\n").is_none());

    // Missing LOCATION
    let reply = "HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n";
    assert!(parse_search_reply(reply).is_none());

    // A NOTIFY is not a search reply
    let notify = "NOTIFY * HTTP/1.1\r\nNT: upnp:rootdevice\r\nLOCATION: http://10.0.0.1/\r\n\r\n";
    assert!(parse_search_reply(notify).is_none());
}

#[test]
fn test_location_host() {
    assert_eq!(
        location_host("http://192.168.1.1:5000/rootDesc.xml"),
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
    );
    assert_eq!(
        location_host("http://10.0.0.138/igd.xml"),
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 138)))
    );
    assert_eq!(
        location_host("http://[fe80::1]:49152/desc.xml"),
        Some("fe80::1".parse().unwrap())
    );
    assert_eq!(location_host("http://router.local:5000/desc.xml"), None);
    assert_eq!(location_host("ftp://192.168.1.1/"), None);
}

// ========================================================================
// Mapping logic against a scripted device
// ========================================================================

/// Device that refuses a fixed set of external ports and logs every call
#[derive(Default)]
struct ScriptedIgd {
    refused: HashSet<u16>,
    refuse_all: bool,
    latency: Duration,
    added: Mutex<Vec<u16>>,
    removed: Mutex<Vec<u16>>,
}

impl ScriptedIgd {
    fn added(&self) -> Vec<u16> {
        self.added.lock().unwrap().clone()
    }

    fn removed(&self) -> Vec<u16> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl IgdControl for Arc<ScriptedIgd> {
    fn addr(&self) -> SocketAddr {
        "192.168.1.1:5000".parse().unwrap()
    }

    async fn external_ip(&self) -> Result<IpAddr, String> {
        Ok(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)))
    }

    async fn add_port(
        &self,
        _protocol: Protocol,
        external_port: u16,
        _local_addr: SocketAddr,
        _lease_secs: u32,
        _description: &str,
    ) -> Result<(), String> {
        time::sleep(self.latency).await;
        self.added.lock().unwrap().push(external_port);
        if self.refuse_all || self.refused.contains(&external_port) {
            return Err("ConflictInMappingEntry".to_string());
        }
        Ok(())
    }

    async fn remove_port(&self, _protocol: Protocol, external_port: u16) -> Result<(), String> {
        self.removed.lock().unwrap().push(external_port);
        Ok(())
    }
}

fn upnp_gateway(device: &Arc<ScriptedIgd>) -> UpnpGateway {
    UpnpGateway::new(
        IgdVersion::V2,
        Box::new(device.clone()),
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))),
        Arc::new(PortSelector::seeded(3)),
        Duration::from_secs(1),
    )
}

fn tcp_request(port: u16) -> PortMappingRequest {
    PortMappingRequest::new(Protocol::Tcp, port, "natgate", Duration::from_secs(3600))
}

#[tokio::test]
async fn test_upnp_handle_addresses() {
    let device = Arc::new(ScriptedIgd::default());
    let gateway = upnp_gateway(&device);

    assert_eq!(gateway.kind(), "UPNP (IGDv2)");
    assert_eq!(
        gateway.device_address().unwrap(),
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))
    );
    assert_eq!(
        gateway.external_address().await.unwrap(),
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
    );
}

#[tokio::test]
async fn test_upnp_prefers_internal_port() {
    let device = Arc::new(ScriptedIgd::default());
    let gateway = upnp_gateway(&device);

    let external = gateway
        .add_port_mapping(&tcp_request(8080), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(external, 8080);
    assert_eq!(device.added(), vec![8080]);
}

#[tokio::test]
async fn test_upnp_falls_back_to_random_port_and_reuses_it() {
    let device = Arc::new(ScriptedIgd {
        refused: HashSet::from([8080]),
        ..ScriptedIgd::default()
    });
    let gateway = upnp_gateway(&device);

    let external = gateway
        .add_port_mapping(&tcp_request(8080), Duration::from_secs(1))
        .await
        .unwrap();
    assert_ne!(external, 8080);
    assert!(external >= crate::port::MIN_RANDOM_PORT);
    assert_eq!(device.added(), vec![8080, external]);

    // Renewal asks for the port it already holds first
    let renewed = gateway
        .add_port_mapping(&tcp_request(8080), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(renewed, external);
    assert_eq!(device.added(), vec![8080, external, external]);

    // Deletion targets the allocated external port
    tokio_test::assert_ok!(gateway.delete_port_mapping(Protocol::Tcp, 8080).await);
    assert_eq!(device.removed(), vec![external]);
}

#[tokio::test]
async fn test_upnp_gives_up_after_random_candidates() {
    let device = Arc::new(ScriptedIgd {
        refuse_all: true,
        ..ScriptedIgd::default()
    });
    let gateway = upnp_gateway(&device);

    let result = gateway
        .add_port_mapping(&tcp_request(8080), Duration::from_secs(1))
        .await;

    assert!(matches!(result, Err(Error::Mapping(MappingError::Rejected(_)))));
    let tried = device.added();
    assert_eq!(tried.len(), 4, "internal port plus three random ports");
    assert_eq!(tried[0], 8080);
}

#[tokio::test]
async fn test_upnp_delete_unknown_mapping_uses_internal_port() {
    let device = Arc::new(ScriptedIgd::default());
    let gateway = upnp_gateway(&device);

    tokio_test::assert_ok!(gateway.delete_port_mapping(Protocol::Udp, 9000).await);
    assert_eq!(device.removed(), vec![9000]);
}

#[tokio::test(start_paused = true)]
async fn test_upnp_add_port_mapping_times_out() {
    let device = Arc::new(ScriptedIgd {
        latency: Duration::from_millis(500),
        ..ScriptedIgd::default()
    });
    let gateway = upnp_gateway(&device);

    let start = Instant::now();
    let result = gateway
        .add_port_mapping(&tcp_request(8080), Duration::from_millis(20))
        .await;

    assert!(matches!(result, Err(Error::Mapping(MappingError::Timeout))));
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(device.added().is_empty());
}
