use async_trait::async_trait;
use log::debug;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use super::mdns::MdnsResponse;

/// Source of reverse DNS answers
#[async_trait]
pub trait ReverseLookup: Send + Sync {
    /// Full host name for `address`, or `None` when there is no PTR record
    async fn lookup(&self, address: IpAddr) -> Option<String>;
}

/// Reverse lookups through the system resolver
pub struct DnsReverseLookup;

#[async_trait]
impl ReverseLookup for DnsReverseLookup {
    async fn lookup(&self, address: IpAddr) -> Option<String> {
        // getnameinfo blocks, keep it off the runtime threads
        match tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&address)).await {
            Ok(Ok(name)) => Some(name),
            Ok(Err(e)) => {
                debug!("Reverse lookup for {} failed: {}", address, e);
                None
            }
            Err(e) => {
                debug!("Reverse lookup task for {} aborted: {}", address, e);
                None
            }
        }
    }
}

/// Bounded reverse DNS for responsive hosts.
///
/// The scanner asks for the reverse name while probing and completes the
/// name with [`name_with_fallback`] once mDNS responses are in.
#[derive(Clone)]
pub struct NameResolver {
    lookup: Arc<dyn ReverseLookup>,
    timeout: Duration,
}

impl NameResolver {
    pub fn new(lookup: Arc<dyn ReverseLookup>, timeout: Duration) -> Self {
        Self { lookup, timeout }
    }

    /// Short host name from reverse DNS, bounded by the resolver timeout
    pub async fn reverse_name(&self, address: Ipv4Addr) -> Option<String> {
        let answer = tokio::time::timeout(self.timeout, self.lookup.lookup(IpAddr::V4(address)))
            .await
            .unwrap_or_else(|_| {
                debug!("Reverse lookup for {} timed out", address);
                None
            })?;

        short_host_name(&answer)
    }
}

/// Host portion of a DNS name, ignoring numeric echoes of the address
fn short_host_name(answer: &str) -> Option<String> {
    let answer = answer.trim().trim_end_matches('.');
    if answer.is_empty() || answer.parse::<IpAddr>().is_ok() {
        return None;
    }

    answer
        .split('.')
        .next()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

/// Pick the reverse DNS name, else a matching mDNS name, else the placeholder
pub fn name_with_fallback(address: Ipv4Addr, reverse: Option<String>, known: &[MdnsResponse]) -> String {
    if let Some(name) = reverse.filter(|n| !n.is_empty()) {
        return name;
    }

    known
        .iter()
        .find(|resp| resp.address == IpAddr::V4(address) && !resp.display_name.is_empty())
        .map(|resp| resp.display_name.clone())
        .unwrap_or_else(|| placeholder_name(address))
}

pub fn placeholder_name(address: Ipv4Addr) -> String {
    format!("Device-{}", address.octets()[3])
}
