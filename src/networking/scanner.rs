use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::fingerprint::{self, OsFamily};
use super::interface;
use super::mdns::{MdnsBrowser, MdnsResponse, ServiceBrowser};
use super::probe::{IcmpProber, Prober};
use super::resolver::{self, DnsReverseLookup, NameResolver, ReverseLookup};
use crate::error::ScanError;

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(200);
const DEFAULT_MAX_PARALLEL_PROBES: usize = 50;
const DEFAULT_MDNS_WINDOW: Duration = Duration::from_secs(2);
const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(1);

/// Host octets swept within a /24
const HOST_OCTETS: std::ops::RangeInclusive<u8> = 1..=254;

/// A device found on the local segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub ip: String,
    pub name: String,
    pub os_type: String,
}

/// Configuration for discovery scans
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Subnet swept by `scan_local`; derived from the best interface when unset
    pub subnet_prefix: Option<String>,
    /// Timeout for each ICMP echo
    pub ping_timeout: Duration,
    /// Maximum probes in flight at once
    pub max_parallel_probes: usize,
    /// How long mDNS announcements are collected
    pub mdns_window: Duration,
    /// Upper bound on each reverse DNS lookup
    pub dns_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            subnet_prefix: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            max_parallel_probes: DEFAULT_MAX_PARALLEL_PROBES,
            mdns_window: DEFAULT_MDNS_WINDOW,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
        }
    }
}

/// Responsive host from the ICMP sweep, before naming
#[derive(Debug, Clone)]
struct ProbeHit {
    address: Ipv4Addr,
    ttl: Option<u8>,
    reverse_name: Option<String>,
}

/// Seam consumed by outer surfaces such as the HTTP device listing
#[async_trait]
pub trait DeviceService: Send + Sync {
    async fn describe_devices(&self) -> Result<Vec<DeviceRecord>>;
}

/// Sweeps a /24 with ICMP, browses mDNS and merges both into one device list
pub struct DiscoveryScanner {
    config: ScanConfig,
    prober: Arc<dyn Prober>,
    names: NameResolver,
    browser: Arc<dyn ServiceBrowser>,
}

impl DiscoveryScanner {
    /// Create a scanner using ICMP, the system resolver and mDNS
    pub fn new(config: ScanConfig) -> Result<Self, ScanError> {
        let prober = Arc::new(IcmpProber::new()?);
        let browser = Arc::new(MdnsBrowser::new(config.mdns_window));

        Ok(Self::with_backends(config, prober, Arc::new(DnsReverseLookup), browser))
    }

    /// Create a scanner over arbitrary probe, lookup and browse backends
    pub fn with_backends(
        mut config: ScanConfig,
        prober: Arc<dyn Prober>,
        lookup: Arc<dyn ReverseLookup>,
        browser: Arc<dyn ServiceBrowser>,
    ) -> Self {
        if config.max_parallel_probes == 0 {
            warn!(
                "max_parallel_probes must be positive, using {}",
                DEFAULT_MAX_PARALLEL_PROBES
            );
            config.max_parallel_probes = DEFAULT_MAX_PARALLEL_PROBES;
        }

        let names = NameResolver::new(lookup, config.dns_timeout);

        Self {
            config,
            prober,
            names,
            browser,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// The configured subnet, or the subnet of the best local interface
    pub fn local_subnet(&self) -> Result<String, ScanError> {
        match &self.config.subnet_prefix {
            Some(prefix) => Ok(prefix.clone()),
            None => {
                let iface = interface::best_ipv4_interface()?;
                let prefix = interface::subnet_prefix(iface.ip);
                info!("Using subnet {} from interface {} ({})", prefix, iface.name, iface.ip);
                Ok(prefix)
            }
        }
    }

    /// Scan the subnet picked by [`local_subnet`](Self::local_subnet)
    pub async fn scan_local(&self, cancel: &CancellationToken) -> Result<Vec<DeviceRecord>, ScanError> {
        let prefix = self.local_subnet()?;
        self.scan(&prefix, cancel).await
    }

    /// Scan `prefix.1` through `prefix.254` and the local mDNS domain.
    ///
    /// Unreachable hosts and naming failures are absorbed. Only an invalid
    /// prefix or cancellation produce an error.
    pub async fn scan(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<DeviceRecord>, ScanError> {
        let base = parse_subnet_prefix(prefix)?;
        let started = Instant::now();

        info!(
            "Scanning {}.0/24 ({} probes in flight, {:?} timeout)",
            prefix.trim_end_matches('.'),
            self.config.max_parallel_probes,
            self.config.ping_timeout
        );

        let both = async { tokio::join!(self.sweep(base), self.browser.discover(cancel)) };

        let (hits, mdns_responses) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Scan of {} cancelled", prefix);
                return Err(ScanError::Cancelled);
            }
            results = both => results,
        };

        let devices = merge_results(hits, &mdns_responses);

        info!(
            "Scan of {} finished in {:.2}s: {} devices ({} via mDNS)",
            prefix,
            started.elapsed().as_secs_f32(),
            devices.len(),
            mdns_responses.len()
        );

        Ok(devices)
    }

    /// Probe every host octet with bounded concurrency
    async fn sweep(&self, base: [u8; 3]) -> Vec<ProbeHit> {
        let ping_timeout = self.config.ping_timeout;

        stream::iter(HOST_OCTETS)
            .map(|octet| {
                let address = Ipv4Addr::new(base[0], base[1], base[2], octet);
                async move {
                    let result = self.prober.probe(address, ping_timeout).await;
                    if !result.reachable {
                        return None;
                    }

                    let reverse_name = self.names.reverse_name(address).await;
                    debug!("{} is up (reverse name {:?})", address, reverse_name);

                    Some(ProbeHit {
                        address,
                        ttl: result.ttl,
                        reverse_name,
                    })
                }
            })
            .buffer_unordered(self.config.max_parallel_probes)
            .filter_map(|hit| async move { hit })
            .collect()
            .await
    }
}

#[async_trait]
impl DeviceService for DiscoveryScanner {
    async fn describe_devices(&self) -> Result<Vec<DeviceRecord>> {
        let devices = self.scan_local(&CancellationToken::new()).await?;
        Ok(devices)
    }
}

/// Parse the first three octets of an IPv4 /24, e.g. `192.168.0`
pub fn parse_subnet_prefix(prefix: &str) -> Result<[u8; 3], ScanError> {
    let invalid = || ScanError::InvalidSubnet(prefix.to_string());

    let parts: Vec<&str> = prefix.trim().trim_end_matches('.').split('.').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }

    let mut octets = [0u8; 3];
    for (slot, part) in octets.iter_mut().zip(parts) {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        *slot = part.parse().map_err(|_| invalid())?;
    }

    Ok(octets)
}

/// Fold ICMP hits and mDNS responses into one record per address.
///
/// Names prefer reverse DNS, then the mDNS instance name, then the
/// placeholder. The OS guess prefers announced service tags over the TTL.
fn merge_results(hits: Vec<ProbeHit>, mdns_responses: &[MdnsResponse]) -> Vec<DeviceRecord> {
    let mut merged: BTreeMap<IpAddr, DeviceRecord> = BTreeMap::new();

    for hit in hits {
        let address = IpAddr::V4(hit.address);
        let name = resolver::name_with_fallback(hit.address, hit.reverse_name, mdns_responses);

        let announced = mdns_responses
            .iter()
            .filter(|resp| resp.address == address)
            .map(MdnsResponse::os_family)
            .find(OsFamily::is_known);
        let os = announced.unwrap_or_else(|| hit.ttl.map(fingerprint::by_ttl).unwrap_or(OsFamily::Unknown));

        merged.insert(
            address,
            DeviceRecord {
                ip: address.to_string(),
                name,
                os_type: os.label().to_string(),
            },
        );
    }

    // Responders answering on IPv4 too are listed once, under that address
    let named_v4: HashSet<&str> = mdns_responses
        .iter()
        .filter(|resp| resp.address.is_ipv4() && !resp.display_name.is_empty())
        .map(|resp| resp.display_name.as_str())
        .collect();

    for resp in mdns_responses {
        if resp.address.is_ipv6() && named_v4.contains(resp.display_name.as_str()) {
            debug!("Skipping {} for {}, already seen over IPv4", resp.address, resp.display_name);
            continue;
        }
        merged.entry(resp.address).or_insert_with(|| DeviceRecord {
            ip: resp.address.to_string(),
            name: match resp.address {
                _ if !resp.display_name.is_empty() => resp.display_name.clone(),
                IpAddr::V4(v4) => resolver::placeholder_name(v4),
                IpAddr::V6(_) => resp.address.to_string(),
            },
            os_type: resp.os_family().label().to_string(),
        });
    }

    merged.into_values().collect()
}
