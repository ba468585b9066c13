use anyhow::{Context, Result};
use log::{debug, warn};
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::networking::file_transfer::{FileTransferConfig, ProgressCallback};
use crate::networking::scanner::ScanConfig;

/// Runtime settings for the scanner and the transfer sessions
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Subnet to sweep; derived from the best interface when absent
    pub subnet: Option<String>,
    pub ping_timeout: Duration,
    pub max_parallel_probes: usize,
    pub mdns_window: Duration,
    pub dns_timeout: Duration,
    pub port: u16,
    pub bind_address: IpAddr,
    /// Directory for received files; the working directory when absent
    pub save_dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub connect_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        let scan = ScanConfig::default();
        let transfer = FileTransferConfig::default();

        Self {
            subnet: scan.subnet_prefix,
            ping_timeout: scan.ping_timeout,
            max_parallel_probes: scan.max_parallel_probes,
            mdns_window: scan.mdns_window,
            dns_timeout: scan.dns_timeout,
            port: transfer.port,
            bind_address: transfer.bind_address,
            save_dir: None,
            chunk_size: transfer.chunk_size,
            connect_timeout: transfer.connect_timeout,
        }
    }
}

impl AppConfig {
    /// Load from the process environment after applying an optional `.env` file
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenv::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_parallel_probes = match parse::<i64>(&get, "P2P_MAX_PARALLEL_PROBES")? {
            Some(n) if n > 0 => n as usize,
            Some(n) => {
                warn!(
                    "P2P_MAX_PARALLEL_PROBES must be positive (got {}), using {}",
                    n, defaults.max_parallel_probes
                );
                defaults.max_parallel_probes
            }
            None => defaults.max_parallel_probes,
        };

        let chunk_size = match parse::<usize>(&get, "P2P_CHUNK_SIZE")? {
            Some(0) => {
                warn!("P2P_CHUNK_SIZE must be positive, using {}", defaults.chunk_size);
                defaults.chunk_size
            }
            Some(n) => n,
            None => defaults.chunk_size,
        };

        Ok(Self {
            subnet: get("P2P_SUBNET"),
            ping_timeout: parse(&get, "P2P_PING_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.ping_timeout),
            max_parallel_probes,
            mdns_window: parse(&get, "P2P_MDNS_WINDOW_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.mdns_window),
            dns_timeout: parse(&get, "P2P_DNS_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.dns_timeout),
            port: parse(&get, "P2P_PORT")?.unwrap_or(defaults.port),
            bind_address: parse(&get, "P2P_BIND_ADDRESS")?.unwrap_or(defaults.bind_address),
            save_dir: get("P2P_SAVE_DIR").map(PathBuf::from),
            chunk_size,
            connect_timeout: parse(&get, "P2P_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        })
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            subnet_prefix: self.subnet.clone(),
            ping_timeout: self.ping_timeout,
            max_parallel_probes: self.max_parallel_probes,
            mdns_window: self.mdns_window,
            dns_timeout: self.dns_timeout,
        }
    }

    pub fn transfer_config(&self, progress_callback: Option<ProgressCallback>) -> FileTransferConfig {
        FileTransferConfig {
            port: self.port,
            bind_address: self.bind_address,
            chunk_size: self.chunk_size,
            connect_timeout: self.connect_timeout,
            progress_callback,
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("Invalid value '{}' for {}", raw, key)))
        .transpose()
}
