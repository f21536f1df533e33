//! Default route lookup for different platforms
//!
//! NAT-PMP has no discovery step of its own: the gateway is whatever the
//! default route points at.

use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Find the default gateway IP address
///
/// On Linux this reads the routing table, on macOS and Windows it parses the
/// output of the platform routing tool. Returns `None` when no IPv4 default
/// route exists or the platform is unsupported.
pub fn find_default_gateway() -> Option<IpAddr> {
    #[cfg(target_os = "linux")]
    {
        find_gateway_linux()
    }

    #[cfg(target_os = "macos")]
    {
        find_gateway_macos()
    }

    #[cfg(target_os = "windows")]
    {
        find_gateway_windows()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn find_gateway_linux() -> Option<IpAddr> {
    let route_table = match std::fs::read_to_string("/proc/net/route") {
        Ok(table) => table,
        Err(e) => {
            debug!("Failed to read route table: {}", e);
            return None;
        }
    };
    parse_proc_net_route(&route_table)
}

/// Parse `/proc/net/route`; the gateway of the `00000000` destination is the
/// default route, printed as the host-order value of a network-order address
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_proc_net_route(table: &str) -> Option<IpAddr> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            return None;
        }
        let gateway = u32::from_str_radix(fields[2], 16).ok()?;
        let ip = Ipv4Addr::from(u32::from_be(gateway));
        (!ip.is_unspecified()).then_some(IpAddr::V4(ip))
    })
}

#[cfg(target_os = "macos")]
fn find_gateway_macos() -> Option<IpAddr> {
    use std::process::Command;

    let output = match Command::new("netstat").args(["-rn", "-f", "inet"]).output() {
        Ok(output) => output,
        Err(e) => {
            debug!("Failed to run netstat: {}", e);
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| line.split_whitespace().nth(1)?.parse::<Ipv4Addr>().ok())
        .map(IpAddr::V4)
}

#[cfg(target_os = "windows")]
fn find_gateway_windows() -> Option<IpAddr> {
    use std::process::Command;

    let output = match Command::new("route").args(["print", "0.0.0.0"]).output() {
        Ok(output) => output,
        Err(e) => {
            debug!("Failed to run route: {}", e);
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("0.0.0.0"))
        .find_map(|line| line.split_whitespace().nth(2)?.parse::<Ipv4Addr>().ok())
        .map(IpAddr::V4)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_TABLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
";

    #[test]
    fn test_parse_default_route() {
        let gateway = parse_proc_net_route(ROUTE_TABLE);
        assert_eq!(gateway, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn test_parse_default_route_host_order() {
        // The kernel prints the raw network-order bytes as a native u32
        let raw = u32::from_ne_bytes([10, 0, 0, 1]);
        let table = format!(
            "Iface\tDestination\tGateway\n\
             wlan0\t00000000\t{:08X}\t0003\n",
            raw
        );
        assert_eq!(
            parse_proc_net_route(&table),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }

    #[test]
    fn test_parse_route_without_default() {
        let table = "Iface\tDestination\tGateway\n\
                     eth0\t0000A8C0\t00000000\t0001\n";
        assert_eq!(parse_proc_net_route(table), None);
    }
}
