//! Gateway discovery and ARP table primitives.

use crate::error::{Error, Result};

use std::{
    collections::{HashMap, HashSet},
    fmt,
    fs,
    net::{Ipv4Addr, UdpSocket},
    process::Command,
    str::FromStr,
};
use tracing::{debug, info};

const ROUTE_TABLE: &str = "/proc/net/route";
const ARP_TABLE: &str = "/proc/net/arp";
const ATF_PERM: u32 = 0x4;
const EMPTY_MAC: &str = "00:00:00:00:00:00";

/// Last trusted gateway binding, stored as `ip,mac`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayRecord {
    pub ip:  String,
    pub mac: String,
}

impl GatewayRecord {
    pub fn new(ip: impl Into<String>, mac: impl Into<String>) -> Self {
        GatewayRecord { ip: ip.into(), mac: mac.into().to_ascii_lowercase() }
    }
}

impl fmt::Display for GatewayRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.ip, self.mac)
    }
}

impl FromStr for GatewayRecord {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once(',') {
            Some((ip, mac)) if !ip.is_empty() && !mac.is_empty() => Ok(GatewayRecord::new(ip, mac)),
            _ => Err(Error::Network(format!("malformed gateway record `{}`", s.trim()))),
        }
    }
}

/// What discovery reports about the live network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    pub device:           String,
    pub internal_ip:      String,
    pub gateway:          GatewayRecord,
    pub gateway_is_static: bool,
}

pub trait NetworkProbe {
    fn discover(&self) -> Result<NetworkInfo>;

    /// True when one MAC answers for more than one IP on the same segment.
    fn duplicated_mac_exists(&self) -> Result<bool>;

    fn set_arp_static(&self, info: &NetworkInfo, binding: &GatewayRecord) -> Result<()>;
}

/// IPv4 probe over procfs and iproute2.
#[derive(Clone, Debug, Default)]
pub struct LinuxProbe;

impl NetworkProbe for LinuxProbe {
    fn discover(&self) -> Result<NetworkInfo> {
        let routes = fs::read_to_string(ROUTE_TABLE)?;
        let (device, gateway_ip) = default_route(&routes)
            .ok_or_else(|| Error::Network("no default route".into()))?;

        let arp = fs::read_to_string(ARP_TABLE)?;
        let entry = parse_arp_table(&arp)
            .into_iter()
            .find(|e| e.ip == gateway_ip.to_string() && e.mac != EMPTY_MAC)
            .ok_or_else(|| Error::Network(format!("gateway {gateway_ip} has no ARP entry")))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((gateway_ip, 9))?;
        let internal_ip = socket.local_addr()?.ip().to_string();

        debug!(%device, %gateway_ip, mac = %entry.mac, %internal_ip, "network discovered");
        Ok(NetworkInfo {
            device,
            internal_ip,
            gateway: GatewayRecord::new(gateway_ip.to_string(), entry.mac),
            gateway_is_static: entry.flags & ATF_PERM != 0,
        })
    }

    fn duplicated_mac_exists(&self) -> Result<bool> {
        let arp = fs::read_to_string(ARP_TABLE)?;
        Ok(has_duplicate_mac(&parse_arp_table(&arp)))
    }

    fn set_arp_static(&self, info: &NetworkInfo, binding: &GatewayRecord) -> Result<()> {
        let status = Command::new("ip")
            .args(["neigh", "replace", &binding.ip, "lladdr", &binding.mac])
            .args(["dev", &info.device, "nud", "permanent"])
            .status()?;
        if !status.success() {
            return Err(Error::Network(format!(
                "`ip neigh replace {} lladdr {}` exited with {status}",
                binding.ip, binding.mac
            )));
        }
        info!(gateway = %binding, device = %info.device, "static ARP entry installed");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip:     String,
    pub flags:  u32,
    pub mac:    String,
    pub device: String,
}

// "IP address  HW type  Flags  HW address  Mask  Device"
pub fn parse_arp_table(table: &str) -> Vec<ArpEntry> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 6 {
                return None;
            }
            let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).ok()?;
            Some(ArpEntry {
                ip:     cols[0].to_string(),
                flags,
                mac:    cols[3].to_ascii_lowercase(),
                device: cols[5].to_string(),
            })
        })
        .collect()
}

pub fn has_duplicate_mac(entries: &[ArpEntry]) -> bool {
    let mut seen: HashMap<(&str, &str), HashSet<&str>> = HashMap::new();
    for e in entries.iter().filter(|e| e.mac != EMPTY_MAC) {
        seen.entry((e.device.as_str(), e.mac.as_str()))
            .or_default()
            .insert(e.ip.as_str());
    }
    seen.values().any(|ips| ips.len() > 1)
}

// "Iface  Destination  Gateway  Flags ..." with little-endian hex addresses
pub fn default_route(table: &str) -> Option<(String, Ipv4Addr)> {
    table.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 || cols[1] != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(cols[2], 16).ok()?;
        let gateway = Ipv4Addr::from(raw.swap_bytes());
        (!gateway.is_unspecified()).then(|| (cols[0].to_string(), gateway))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0000A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
";

    const ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.0.1      0x1         0x2         AA:BB:CC:DD:EE:01     *        eth0
192.168.0.20     0x1         0x2         aa:bb:cc:dd:ee:20     *        eth0
192.168.0.30     0x1         0x0         00:00:00:00:00:00     *        eth0
";

    #[test]
    fn default_route_reads_little_endian_gateway() {
        let (dev, gw) = default_route(ROUTES).unwrap();
        assert_eq!(dev, "eth0");
        assert_eq!(gw, Ipv4Addr::new(192, 168, 0, 1));
    }

    #[test]
    fn arp_table_parses_and_normalizes_macs() {
        let entries = parse_arp_table(ARP);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(entries[0].flags, 0x2);
        assert!(!has_duplicate_mac(&entries));
    }

    #[test]
    fn spoofed_gateway_mac_is_a_duplicate() {
        let spoofed = format!("{ARP}192.168.0.66     0x1         0x2         aa:bb:cc:dd:ee:01     *        eth0\n");
        assert!(has_duplicate_mac(&parse_arp_table(&spoofed)));
    }

    #[test]
    fn gateway_record_round_trips_through_text() {
        let rec: GatewayRecord = "192.168.0.1,AA:BB:CC:DD:EE:01\n".parse().unwrap();
        assert_eq!(rec, GatewayRecord::new("192.168.0.1", "aa:bb:cc:dd:ee:01"));
        assert_eq!(rec.to_string(), "192.168.0.1,aa:bb:cc:dd:ee:01");
        assert!("192.168.0.1".parse::<GatewayRecord>().is_err());
    }
}
