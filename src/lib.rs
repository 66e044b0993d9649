pub mod config;
pub mod connection;
pub mod direct;
pub mod locator;
pub mod relay;
pub mod remote;
pub mod retry;
pub mod transfer;

pub use config::TransferConfig;
pub use transfer::{Collaborators, FileTransfer, TransferError};

/// Result alias used throughout the transfer engine.
pub type Result<T, E = TransferError> = std::result::Result<T, E>;
