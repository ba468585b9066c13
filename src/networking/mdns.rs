use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::fingerprint::{self, OsFamily};

/// DNS-SD meta query enumerating every advertised service type
pub const SERVICE_ENUMERATION_TYPE: &str = "_services._dns-sd._udp.local.";

/// Types browsed even when nobody answers the enumeration query
const WELL_KNOWN_TYPES: &[&str] = &[
    "_device-info._tcp.local.",
    "_workstation._tcp.local.",
    "_smb._tcp.local.",
    "_airplay._tcp.local.",
    "_companion-link._tcp.local.",
    "_apple-mobdev2._tcp.local.",
    "_googlecast._tcp.local.",
    "_androidtvremote2._tcp.local.",
    "_http._tcp.local.",
];

/// One host as seen through mDNS announcements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsResponse {
    pub address: IpAddr,
    pub display_name: String,
    pub service_tags: BTreeSet<String>,
}

impl MdnsResponse {
    pub fn os_family(&self) -> OsFamily {
        fingerprint::by_service_tags(&self.service_tags)
    }
}

/// Discovery of hosts through local service announcements
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Resolve announcements until the browse window closes or `cancel` fires.
    ///
    /// Failures yield an empty list.
    async fn discover(&self, cancel: &CancellationToken) -> Vec<MdnsResponse>;
}

/// Accumulates resolved services into one response per address
#[derive(Debug, Default)]
pub struct ResponseSet {
    hosts: BTreeMap<IpAddr, MdnsResponse>,
}

impl ResponseSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one resolved service instance announced by `address`.
    ///
    /// The first non-empty instance name seen for an address becomes its
    /// display name.
    pub fn record(&mut self, address: IpAddr, fullname: &str, service_type: &str) {
        let instance = instance_name(fullname, service_type);
        let entry = self.hosts.entry(address).or_insert_with(|| MdnsResponse {
            address,
            display_name: String::new(),
            service_tags: BTreeSet::new(),
        });

        if entry.display_name.is_empty() {
            entry.display_name = instance;
        }
        entry.service_tags.insert(service_type.to_string());
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn into_responses(self) -> Vec<MdnsResponse> {
        self.hosts.into_values().collect()
    }
}

/// Human-readable instance part of a service full name
fn instance_name(fullname: &str, service_type: &str) -> String {
    let name = fullname
        .strip_suffix(service_type)
        .unwrap_or(fullname)
        .trim_end_matches('.');

    name.replace("\\032", " ").replace("\\ ", " ")
}

/// mDNS browser backed by an `mdns-sd` daemon
pub struct MdnsBrowser {
    window: Duration,
}

impl MdnsBrowser {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Collect service types answered for the enumeration query
    async fn enumerate_types(
        &self,
        mdns: &ServiceDaemon,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = WELL_KNOWN_TYPES.iter().map(|t| t.to_string()).collect();

        let receiver = match mdns.browse(SERVICE_ENUMERATION_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("Service type enumeration failed: {}", e);
                return types;
            }
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = timeout(deadline - now, receiver.recv_async()) => match event {
                    Ok(Ok(ServiceEvent::ServiceFound(_, service_type))) => {
                        let service_type = service_type.trim_end_matches('.').to_string() + ".";
                        if types.insert(service_type.clone()) {
                            debug!("Enumerated service type {}", service_type);
                        }
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) | Err(_) => break,
                },
            }
        }

        if let Err(e) = mdns.stop_browse(SERVICE_ENUMERATION_TYPE) {
            debug!("Failed to stop enumeration browse: {}", e);
        }

        types
    }

    /// Resolve instances of one service type until the deadline
    async fn resolve_type(
        mdns: &ServiceDaemon,
        service_type: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Vec<(IpAddr, String)> {
        let mut resolved = Vec::new();

        let receiver = match mdns.browse(service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                debug!("Cannot browse {}: {}", service_type, e);
                return resolved;
            }
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = timeout(deadline - now, receiver.recv_async()) => match event {
                    Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                        for addr in info.get_addresses() {
                            resolved.push((IpAddr::from(*addr), info.get_fullname().to_string()));
                        }
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) | Err(_) => break,
                },
            }
        }

        if let Err(e) = mdns.stop_browse(service_type) {
            debug!("Failed to stop browse of {}: {}", service_type, e);
        }

        resolved
    }
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn discover(&self, cancel: &CancellationToken) -> Vec<MdnsResponse> {
        let mdns = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                warn!("mDNS daemon unavailable, skipping service discovery: {}", e);
                return Vec::new();
            }
        };

        let started = Instant::now();
        let types = self.enumerate_types(&mdns, started + self.window / 2, cancel).await;
        debug!("Browsing {} service types", types.len());

        let deadline = started + self.window;
        let browses = types
            .iter()
            .map(|service_type| Self::resolve_type(&mdns, service_type, deadline, cancel));
        let per_type = join_all(browses).await;

        let mut responses = ResponseSet::new();
        for (service_type, resolved) in types.iter().zip(per_type) {
            for (address, fullname) in resolved {
                responses.record(address, &fullname, service_type);
            }
        }

        if let Err(e) = mdns.shutdown() {
            debug!("mDNS daemon shutdown failed: {}", e);
        }

        info!("mDNS discovery found {} hosts", responses.len());
        responses.into_responses()
    }
}
