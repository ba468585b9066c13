pub mod config;
pub mod error;
pub mod networking;

pub use error::{ScanError, TransferError};
