//! SPV header synchronization over the Electrum protocol.
//!
//! The crate keeps a tree of block header chains in sync with a set of untrusted
//! Electrum servers. Each server connection follows the server's tip, locating
//! fork points with a backward then binary search, and the connection pool keeps
//! connections spread across network buckets.
//!
//! ```no_run
//! use std::sync::Arc;
//! use electrum_spv::chain::{ChainRegistry, NetworkParams};
//! use electrum_spv::network::{ConnectionPool, ServerAddr, TcpConnector};
//! use electrum_spv::{ClientConfig, Network, SpvError};
//!
//! # async fn run() -> electrum_spv::Result<()> {
//! let main = ServerAddr::from_str_with_inference("testnet.example.org:51002:s").expect("valid address");
//! let config = ClientConfig::new(Network::Testnet).with_main_server(main);
//! config.validate().map_err(SpvError::Config)?;
//!
//! let registry = Arc::new(ChainRegistry::load(NetworkParams::new(config.network), &config.headers_dir()).await?);
//! let pool = ConnectionPool::new(config, registry, Arc::new(TcpConnector::new()));
//! pool.start().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod chain;
pub mod client;
pub mod error;
pub mod logging;
pub mod network;
pub mod sync;

pub use client::ClientConfig;
pub use error::{
    CertError, ChainError, LoggingError, LoggingResult, NetworkError, NetworkResult, Result, SpvError, SyncError,
};
pub use logging::{init_console_logging, init_logging, LogFileConfig, LoggingConfig, LoggingGuard};
pub use tracing::level_filters::LevelFilter;

pub use bitcoin::{BlockHash, Network, Transaction, Txid};

/// Current version of the electrum-spv library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
