use anyhow::{anyhow, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, error, info, warn};
use std::cmp::Reverse;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::ScanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    Virtual,
    Loopback,
    Other,
}

impl InterfaceType {
    /// Higher number = preferred for sweeping
    pub fn priority(&self) -> u8 {
        match self {
            Self::Ethernet => 80,
            Self::Wifi => 60,
            Self::Other => 20,
            Self::Virtual => 5,
            Self::Loopback => 0,
        }
    }

    /// Classify an interface from its name and address
    fn detect(name: &str, ip: &Ipv4Addr) -> Self {
        let name = name.to_lowercase();

        if ip.is_loopback() || name == "lo" || name.starts_with("lo0") {
            Self::Loopback
        } else if ["docker", "veth", "br-", "virbr", "vmnet", "utun", "tun", "tap", "zt"]
            .iter()
            .any(|p| name.starts_with(p))
        {
            Self::Virtual
        } else if name.starts_with("wl") || name.contains("wifi") || name.contains("wi-fi") {
            Self::Wifi
        } else if name.starts_with("eth") || name.starts_with("en") || name.contains("ethernet") {
            Self::Ethernet
        } else {
            Self::Other
        }
    }
}

/// An IPv4-capable local network interface
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub interface_type: InterfaceType,
}

impl NetworkInterface {
    pub fn new(name: String, ip: Ipv4Addr) -> Self {
        let interface_type = InterfaceType::detect(&name, &ip);
        Self {
            name,
            ip,
            interface_type,
        }
    }

    pub fn priority(&self) -> u8 {
        self.interface_type.priority()
    }
}

/// Discover all IPv4 interfaces, best candidates first
pub fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    let if_addrs = get_if_addrs().map_err(|err| {
        error!("Failed to get network interfaces: {}", err);
        anyhow!("Failed to get network interfaces: {}", err)
    })?;

    let mut interfaces: Vec<NetworkInterface> = if_addrs
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(addr) if !addr.ip.is_unspecified() && !addr.ip.is_link_local() => {
                Some(NetworkInterface::new(iface.name, addr.ip))
            }
            _ => None,
        })
        .collect();

    interfaces.sort_by(|a, b| b.priority().cmp(&a.priority()));

    for iface in &interfaces {
        debug!("Interface {} ({:?}) - {}", iface.name, iface.interface_type, iface.ip);
    }

    if interfaces.is_empty() {
        warn!("No usable IPv4 interfaces found!");
    }

    Ok(interfaces)
}

/// Pick the highest-priority non-loopback IPv4 interface
pub fn best_ipv4_interface() -> Result<NetworkInterface, ScanError> {
    let interfaces = discover_interfaces().map_err(|e| ScanError::Setup(e.to_string()))?;

    pick_best(interfaces).ok_or(ScanError::NoInterface)
}

fn pick_best(interfaces: Vec<NetworkInterface>) -> Option<NetworkInterface> {
    interfaces
        .into_iter()
        .filter(|iface| iface.interface_type != InterfaceType::Loopback)
        .min_by_key(|iface| Reverse(iface.priority()))
}

/// Get the local machine's main IP address
pub fn get_local_ip() -> Result<IpAddr> {
    match local_ip() {
        Ok(ip) => {
            info!("Local IP: {}", ip);
            Ok(ip)
        }
        Err(err) => {
            error!("Failed to determine local IP: {}", err);
            Err(anyhow!("Failed to determine local IP: {}", err))
        }
    }
}

/// First three octets of `ip`, the prefix swept by a /24 scan
pub fn subnet_prefix(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}", a, b, c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_classification() {
        let lan = Ipv4Addr::new(192, 168, 1, 20);

        assert_eq!(InterfaceType::detect("eth0", &lan), InterfaceType::Ethernet);
        assert_eq!(InterfaceType::detect("enp3s0", &lan), InterfaceType::Ethernet);
        assert_eq!(InterfaceType::detect("wlan0", &lan), InterfaceType::Wifi);
        assert_eq!(InterfaceType::detect("docker0", &lan), InterfaceType::Virtual);
        assert_eq!(InterfaceType::detect("lo", &Ipv4Addr::LOCALHOST), InterfaceType::Loopback);
        assert_eq!(InterfaceType::detect("weird0", &Ipv4Addr::LOCALHOST), InterfaceType::Loopback);
    }

    #[test]
    fn test_pick_best_prefers_wired() {
        let interfaces = vec![
            NetworkInterface::new("lo".to_string(), Ipv4Addr::LOCALHOST),
            NetworkInterface::new("wlan0".to_string(), Ipv4Addr::new(192, 168, 1, 30)),
            NetworkInterface::new("eth0".to_string(), Ipv4Addr::new(10, 0, 0, 4)),
        ];

        let best = pick_best(interfaces).unwrap();
        assert_eq!(best.name, "eth0");
        assert_eq!(subnet_prefix(best.ip), "10.0.0");
    }

    #[test]
    fn test_pick_best_ignores_loopback() {
        let interfaces = vec![NetworkInterface::new("lo".to_string(), Ipv4Addr::LOCALHOST)];
        assert!(pick_best(interfaces).is_none());
    }
}
