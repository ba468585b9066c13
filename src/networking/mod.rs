pub mod fingerprint;
pub mod framing;
pub mod file_transfer;
pub mod interface;
pub mod mdns;
pub mod probe;
pub mod resolver;
pub mod scanner;

// Re-export key components for easier access
pub use fingerprint::OsFamily;
pub use interface::{best_ipv4_interface, get_local_ip, subnet_prefix, InterfaceType, NetworkInterface};
pub use mdns::{MdnsBrowser, MdnsResponse, ServiceBrowser};
pub use probe::{IcmpProber, ProbeResult, Prober};
pub use resolver::{DnsReverseLookup, NameResolver, ReverseLookup};
pub use scanner::{DeviceRecord, DeviceService, DiscoveryScanner, ScanConfig};
pub use file_transfer::{
    FileTransferConfig, FileTransferSession, PendingReceive, ProgressCallback, TransferDirection, TransferReport,
    TransferStatus,
};
