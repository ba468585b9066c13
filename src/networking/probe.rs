use async_trait::async_trait;
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use surge_ping::{Client, Config, IcmpPacket, PingIdentifier, PingSequence};

use crate::error::ScanError;

const PING_PAYLOAD: [u8; 56] = [0; 56];

/// Outcome of one reachability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub address: Ipv4Addr,
    pub reachable: bool,
    pub ttl: Option<u8>,
}

impl ProbeResult {
    pub fn unreachable(address: Ipv4Addr) -> Self {
        Self {
            address,
            reachable: false,
            ttl: None,
        }
    }

    pub fn reachable(address: Ipv4Addr, ttl: Option<u8>) -> Self {
        Self {
            address,
            reachable: true,
            ttl,
        }
    }
}

/// A single-address reachability check.
///
/// Implementations must not fail: every error is folded into an unreachable
/// result so one bad host cannot abort a sweep.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: Ipv4Addr, timeout: Duration) -> ProbeResult;
}

/// ICMP echo prober sharing one socket across all probes
pub struct IcmpProber {
    client: Client,
    next_ident: AtomicU16,
}

impl IcmpProber {
    /// Open the ICMP socket.
    ///
    /// Fails when the platform refuses both unprivileged and raw ICMP sockets.
    pub fn new() -> Result<Self, ScanError> {
        let client = Client::new(&Config::default())
            .map_err(|e| ScanError::Setup(format!("cannot open ICMP socket: {}", e)))?;

        info!("ICMP prober ready");

        Ok(Self {
            client,
            next_ident: AtomicU16::new(std::process::id() as u16),
        })
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, address: Ipv4Addr, timeout: Duration) -> ProbeResult {
        let ident = PingIdentifier(self.next_ident.fetch_add(1, Ordering::Relaxed));
        let mut pinger = self.client.pinger(IpAddr::V4(address), ident).await;
        pinger.timeout(timeout);

        // The pinger honours its own timeout; the outer one bounds socket stalls
        let reply = tokio::time::timeout(timeout * 2, pinger.ping(PingSequence(0), &PING_PAYLOAD)).await;

        match reply {
            Ok(Ok((IcmpPacket::V4(packet), rtt))) => {
                let ttl = packet.get_ttl();
                debug!("{} replied in {:?} (ttl {:?})", address, rtt, ttl);
                ProbeResult::reachable(address, ttl)
            }
            Ok(Ok((IcmpPacket::V6(_), _))) => ProbeResult::reachable(address, None),
            Ok(Err(e)) => {
                debug!("No echo reply from {}: {}", address, e);
                ProbeResult::unreachable(address)
            }
            Err(_) => {
                debug!("Probe to {} stalled past {:?}", address, timeout * 2);
                ProbeResult::unreachable(address)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_result_constructors() {
        let addr = Ipv4Addr::new(192, 168, 0, 7);

        let down = ProbeResult::unreachable(addr);
        assert!(!down.reachable);
        assert_eq!(down.ttl, None);

        let up = ProbeResult::reachable(addr, Some(64));
        assert!(up.reachable);
        assert_eq!(up.ttl, Some(64));
        assert_eq!(up.address, addr);
    }
}
