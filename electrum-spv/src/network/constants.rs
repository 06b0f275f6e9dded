//! Network constants for Electrum server connections

use std::time::Duration;

// Protocol
pub const PROTOCOL_VERSION: &str = "1.4";
pub const MAX_INCOMING_MSG_SIZE: usize = 1_000_000;
pub const CHUNK_SIZE: u32 = 2016;
/// Gaps up to this many blocks are fetched header by header.
pub const MAX_SINGLE_STEP_GAP: u32 = 10;

// JSON-RPC error codes
pub const RPC_EXCESSIVE_RESOURCE_USAGE: i64 = -102;
pub const RPC_SERVER_BUSY: i64 = -103;
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;

// Supervised task intervals
pub const PING_INTERVAL: Duration = Duration::from_secs(300);
pub const FEE_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

// Certificate fetching
pub const CERT_FETCH_ATTEMPTS: u32 = 10;
pub const CERT_FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

// Connection pool
pub const NUM_TARGET_CONNECTED_SERVERS: usize = 10;
pub const MAX_SERVERS_PER_BUCKET: usize = 1;
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);
/// Minimum delay before dialing a server again after a failed or dropped connection.
pub const SERVER_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const MAIN_SERVER_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const FORK_PRUNE_DEPTH: u32 = 2016;

// Fees
pub const FEE_ETA_TARGETS: &[u32] = &[25, 10, 5, 2];
pub const COIN: f64 = 100_000_000.0;
