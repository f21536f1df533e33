//! External address classification
//!
//! A gateway that reports a private or carrier-grade (RFC 6598) address as its
//! "external" address is itself behind another NAT. Mappings on it will not
//! make the host reachable from the internet, so peers need a relay.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr};
use tracing::{debug, warn};

/// CGNAT (RFC 6598) IP range: 100.64.0.0/10
const CGNAT_RANGE_START: u32 = 0x64400000; // 100.64.0.0
const CGNAT_RANGE_END: u32 = 0x647FFFFF; // 100.127.255.255

/// Where an address reported by a gateway lives
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AddressClass {
    /// Routable on the internet
    Public,
    /// RFC 1918, loopback, link-local, ULA or unspecified
    Private,
    /// Shared address space of a carrier-grade NAT
    CarrierGrade,
}

impl AddressClass {
    /// Whether another NAT sits between the gateway and the internet
    pub fn is_double_nat(&self) -> bool {
        !matches!(self, AddressClass::Public)
    }
}

/// Classify an address reported by a gateway
///
/// # Example
///
/// ```
/// use natgate::{classify_address, AddressClass};
///
/// assert_eq!(classify_address("100.64.0.1".parse().unwrap()), AddressClass::CarrierGrade);
/// assert_eq!(classify_address("203.0.113.5".parse().unwrap()), AddressClass::Public);
/// ```
pub fn classify_address(ip: IpAddr) -> AddressClass {
    let class = if is_carrier_grade(ip) {
        AddressClass::CarrierGrade
    } else if is_private_ip(ip) {
        AddressClass::Private
    } else {
        AddressClass::Public
    };

    match class {
        AddressClass::Public => debug!("External address {} is public", ip),
        _ => warn!(
            "External address {} is {:?}; gateway is behind another NAT",
            ip, class
        ),
    }
    class
}

/// Whether an address falls in 100.64.0.0/10
pub fn is_carrier_grade(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            let ip_u32 = u32::from(ipv4);
            (CGNAT_RANGE_START..=CGNAT_RANGE_END).contains(&ip_u32)
        }
        IpAddr::V6(_) => false,
    }
}

/// Whether an address is private, loopback, link-local or unspecified
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified() || is_ipv6_local(&ipv6),
    }
}

fn is_ipv6_local(ipv6: &Ipv6Addr) -> bool {
    let segments = ipv6.segments();
    // ULA fc00::/7 or link-local fe80::/10
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carrier_grade_bounds() {
        assert!(is_carrier_grade("100.64.0.0".parse().unwrap()));
        assert!(is_carrier_grade("100.100.50.25".parse().unwrap()));
        assert!(is_carrier_grade("100.127.255.255".parse().unwrap()));

        assert!(!is_carrier_grade("100.63.255.255".parse().unwrap()));
        assert!(!is_carrier_grade("100.128.0.0".parse().unwrap()));
        assert!(!is_carrier_grade("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn test_private_addresses() {
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.0.1".parse().unwrap()));
        assert!(is_private_ip("0.0.0.0".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("fd00::1".parse().unwrap()));

        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("100.64.0.1".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn test_classify_address() {
        assert_eq!(
            classify_address("203.0.113.5".parse().unwrap()),
            AddressClass::Public
        );
        assert_eq!(
            classify_address("192.168.0.2".parse().unwrap()),
            AddressClass::Private
        );
        assert_eq!(
            classify_address("100.80.1.1".parse().unwrap()),
            AddressClass::CarrierGrade
        );
        assert!(AddressClass::CarrierGrade.is_double_nat());
        assert!(!AddressClass::Public.is_double_nat());
    }
}
