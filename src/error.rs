use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by a discovery scan.
///
/// Individual host failures never show up here; they are absorbed by the
/// probe that hit them.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid subnet prefix '{0}': expected three dotted octets such as 192.168.0")]
    InvalidSubnet(String),

    #[error("No usable IPv4 network interface found")]
    NoInterface,

    #[error("Scanner setup failed: {0}")]
    Setup(String),

    #[error("Scan cancelled")]
    Cancelled,
}

/// Errors surfaced by a file transfer session.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open source file {}: {source}", path.display())]
    SourceFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid transfer header: {0}")]
    InvalidHeader(String),

    #[error("Invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// True when the session ended because its cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
