//! Error types for the Electrum SPV client.

use std::io;

use thiserror::Error;
use tracing::Level;

use crate::chain::ChainId;

/// Top-level error returned by client entry points.
#[derive(Debug, Error)]
pub enum SpvError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Errors raised by a server connection or one of its requests.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out: {0}")]
    RequestTimedOut(String),

    /// The server answered with something malformed or inconsistent.
    #[error("Response corrupted: {0}")]
    RequestCorrupted(String),

    /// Anticipated disconnect; logged at `level` and never treated as a crash.
    #[error("Disconnecting: {reason}")]
    GracefulDisconnect {
        reason: String,
        level: Level,
    },

    #[error("Server returned error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
    },

    #[error("Session closed")]
    SessionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl NetworkError {
    /// A graceful disconnect logged at info level.
    pub fn graceful(reason: impl Into<String>) -> Self {
        NetworkError::GracefulDisconnect {
            reason: reason.into(),
            level: Level::INFO,
        }
    }

    /// A graceful disconnect logged at warn level.
    pub fn graceful_warn(reason: impl Into<String>) -> Self {
        NetworkError::GracefulDisconnect {
            reason: reason.into(),
            level: Level::WARN,
        }
    }

    /// Timeouts are a flavour of graceful disconnect.
    pub fn is_graceful(&self) -> bool {
        matches!(self, NetworkError::GracefulDisconnect { .. } | NetworkError::RequestTimedOut(_))
    }

    /// Level at which connection teardown caused by this error is logged.
    pub fn log_level(&self) -> Level {
        match self {
            NetworkError::GracefulDisconnect {
                level,
                ..
            } => *level,
            NetworkError::SessionClosed => Level::INFO,
            err if err.is_graceful() => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// Server-reported overload and unsupported methods end the connection
    /// quietly instead of as a protocol failure.
    pub fn into_disconnect(self) -> Self {
        use crate::network::constants::{
            RPC_EXCESSIVE_RESOURCE_USAGE, RPC_METHOD_NOT_FOUND, RPC_SERVER_BUSY,
        };
        match self {
            NetworkError::Rpc {
                code,
                message,
            } if code == RPC_EXCESSIVE_RESOURCE_USAGE
                || code == RPC_SERVER_BUSY
                || code == RPC_METHOD_NOT_FOUND =>
            {
                NetworkError::graceful_warn(format!("server error {}: {}", code, message))
            }
            other => other,
        }
    }
}

/// Certificate pinning and verification errors.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Cannot parse saved certificate: {0}")]
    Parse(String),

    #[error("Certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch {
        expected: String,
        actual: String,
    },

    #[error("Invalid option combination: {0}")]
    InvalidOptionCombination(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Header chain mutation and lookup errors.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Header at height {height} contradicts checkpoint")]
    CheckpointConflict {
        height: u32,
    },

    #[error("Header at height {height} does not connect")]
    DoesNotConnect {
        height: u32,
    },

    #[error("Unknown chain {0}")]
    UnknownChain(ChainId),

    #[error("Cannot truncate to height {height}, chain starts at {floor}")]
    TruncateBelowStart {
        height: u32,
        floor: u32,
    },

    #[error("Invalid forkpoint {forkpoint}: {reason}")]
    InvalidForkpoint {
        forkpoint: u32,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while decoding a serialized header.
#[derive(Debug, Error)]
pub enum HeaderDecodeError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid header: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    #[error("expected a multiple of 80 bytes, got {0}")]
    Length(usize),
}

/// Errors raised by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The server's history disagrees with the hardcoded checkpoints.
    #[error("Checkpoint violation: {reason}")]
    CheckpointViolation {
        reason: String,
    },
}

impl From<SyncError> for NetworkError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Network(e) => e,
            SyncError::Chain(e @ ChainError::Io(_)) | SyncError::Chain(e @ ChainError::Storage(_)) => {
                NetworkError::ConnectionFailed(format!("local chain storage failed: {}", e))
            }
            SyncError::Chain(e) => NetworkError::graceful(e.to_string()),
            SyncError::CheckpointViolation {
                reason,
            } => NetworkError::graceful(reason),
        }
    }
}

/// Type alias for Result with SpvError.
pub type Result<T> = std::result::Result<T, SpvError>;

/// Type alias for network operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for certificate handling results.
pub type CertResult<T> = std::result::Result<T, CertError>;

/// Type alias for chain operation results.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Type alias for sync operation results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::constants::{RPC_EXCESSIVE_RESOURCE_USAGE, RPC_METHOD_NOT_FOUND};

    #[test]
    fn test_graceful_classification() {
        assert!(NetworkError::graceful("bye").is_graceful());
        assert!(NetworkError::RequestTimedOut("server.ping".into()).is_graceful());
        assert!(!NetworkError::RequestCorrupted("bad".into()).is_graceful());
        assert!(!NetworkError::SessionClosed.is_graceful());

        assert_eq!(NetworkError::graceful("x").log_level(), Level::INFO);
        assert_eq!(NetworkError::graceful_warn("x").log_level(), Level::WARN);
        assert_eq!(NetworkError::RequestCorrupted("x".into()).log_level(), Level::WARN);
        assert_eq!(NetworkError::RequestTimedOut("server.ping".into()).log_level(), Level::INFO);
    }

    #[test]
    fn test_overload_rpc_errors_become_disconnects() {
        let err = NetworkError::Rpc {
            code: RPC_EXCESSIVE_RESOURCE_USAGE,
            message: "excessive resource usage".into(),
        }
        .into_disconnect();
        assert!(matches!(err, NetworkError::GracefulDisconnect { .. }));
        assert_eq!(err.log_level(), Level::WARN);

        let err = NetworkError::Rpc {
            code: RPC_METHOD_NOT_FOUND,
            message: "unknown method".into(),
        }
        .into_disconnect();
        assert!(err.is_graceful());

        let err = NetworkError::Rpc {
            code: 1,
            message: "history too large".into(),
        }
        .into_disconnect();
        assert!(matches!(err, NetworkError::Rpc { code: 1, .. }));
    }

    #[test]
    fn test_sync_error_maps_to_disconnect() {
        let err: NetworkError = SyncError::CheckpointViolation {
            reason: "server chain conflicts with checkpoints".into(),
        }
        .into();
        assert!(err.is_graceful());

        let err: NetworkError = SyncError::Chain(ChainError::CheckpointConflict {
            height: 10,
        })
        .into();
        assert!(err.is_graceful());

        let err: NetworkError =
            SyncError::Network(NetworkError::RequestCorrupted("short chunk".into())).into();
        assert!(matches!(err, NetworkError::RequestCorrupted(_)));
    }
}
