use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use p2p_lan_rust::config::AppConfig;
use p2p_lan_rust::networking::{
    interface, DeviceRecord, DiscoveryScanner, FileTransferSession, ScanConfig, TransferStatus,
};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// JSON document printed by `scan`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScanReport {
    subnet: String,
    scanned_at: DateTime<Utc>,
    devices: Vec<DeviceRecord>,
}

enum Command {
    Scan { prefix: Option<String> },
    Send { file: PathBuf, ip: IpAddr, port: Option<u16> },
    Receive { save_dir: Option<PathBuf> },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        Some("scan") => Ok(Command::Scan {
            prefix: args.get(1).cloned(),
        }),
        Some("send") => {
            let file = args.get(1).ok_or_else(|| anyhow!("send needs a file path"))?;
            let ip = args.get(2).ok_or_else(|| anyhow!("send needs a destination address"))?;
            let port = args
                .get(3)
                .map(|p| p.parse::<u16>().with_context(|| format!("Invalid port '{}'", p)))
                .transpose()?;

            Ok(Command::Send {
                file: PathBuf::from(file),
                ip: ip.parse().with_context(|| format!("Invalid address '{}'", ip))?,
                port,
            })
        }
        Some("receive") => Ok(Command::Receive {
            save_dir: args.get(1).map(PathBuf::from),
        }),
        Some("help") | Some("-h") | Some("--help") | None => Ok(Command::Help),
        Some(other) => bail!("Unknown command '{}'", other),
    }
}

fn print_help() {
    println!("Usage: p2p-lan-rust <command>");
    println!();
    println!("Commands:");
    println!("  scan [prefix]              - Scan a /24 subnet such as 192.168.1");
    println!("  send <file> <ip> [port]    - Send a file to a receiving peer");
    println!("  receive [save_dir]         - Wait for one incoming file");
    println!("  help                       - Show this help");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = AppConfig::from_env()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let node_name = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    match interface::get_local_ip() {
        Ok(ip) => info!("Node {} at {}", node_name, ip),
        Err(e) => warn!("Node {} has no local address: {}", node_name, e),
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Interrupted, cancelling...");
        on_interrupt.cancel();
    })?;

    match command {
        Command::Scan { prefix } => scan(&config, prefix, &cancel).await,
        Command::Send { file, ip, port } => {
            let mut transfer = config.transfer_config(Some(Arc::new(report_progress)));
            if let Some(port) = port {
                transfer.port = port;
            }

            let session = FileTransferSession::new(transfer);
            session.send_file(&file, ip, &cancel).await?;
            Ok(())
        }
        Command::Receive { save_dir } => {
            let session = FileTransferSession::new(config.transfer_config(Some(Arc::new(report_progress))));
            let save_dir = save_dir.or_else(|| config.save_dir.clone());

            let report = session.receive_file(save_dir.as_deref(), &cancel).await?;
            println!("{}", report.path.display());
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

/// Scanner settings with a command-line prefix taking precedence
fn scan_config_for(config: &AppConfig, prefix: Option<String>) -> ScanConfig {
    let mut scan_config = config.scan_config();
    if prefix.is_some() {
        scan_config.subnet_prefix = prefix;
    }
    scan_config
}

async fn scan(config: &AppConfig, prefix: Option<String>, cancel: &CancellationToken) -> Result<()> {
    let scanner = DiscoveryScanner::new(scan_config_for(config, prefix))?;
    let subnet = scanner.local_subnet()?;
    let devices = scanner.scan(&subnet, cancel).await?;

    let report = ScanReport {
        subnet,
        scanned_at: Utc::now(),
        devices,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// Progress reporting callback
fn report_progress(status: TransferStatus) {
    match status {
        TransferStatus::Started {
            direction,
            file_name,
            file_size,
            ..
        } => {
            let size_mb = file_size as f64 / (1024.0 * 1024.0);
            info!("{:?} started: {} ({:.2} MB)", direction, file_name, size_mb);
        }
        TransferStatus::Progress {
            bytes_transferred,
            total_bytes,
            percent_complete,
            ..
        } => {
            // Only log every 10% to avoid log spam
            if percent_complete % 10 == 0 {
                let transferred_mb = bytes_transferred as f64 / (1024.0 * 1024.0);
                let total_mb = total_bytes as f64 / (1024.0 * 1024.0);
                info!(
                    "Transfer progress: {}% ({:.2}/{:.2} MB)",
                    percent_complete, transferred_mb, total_mb
                );
            }
        }
        TransferStatus::Completed {
            bytes_transferred,
            elapsed_seconds,
            throughput_mbps,
            ..
        } => {
            let size_mb = bytes_transferred as f64 / (1024.0 * 1024.0);
            info!(
                "Transfer completed: {:.2} MB in {:.2}s ({:.2} MB/s)",
                size_mb, elapsed_seconds, throughput_mbps
            );
        }
        TransferStatus::Failed { error, .. } => {
            error!("Transfer failed: {}", error);
        }
    }
}
