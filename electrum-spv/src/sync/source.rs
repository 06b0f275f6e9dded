//! Where the sync engine gets server headers from.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::NetworkResult;

/// Raw header queries against one server.
///
/// Results are returned undecoded; the engine validates them.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// `blockchain.block.header`: hex of a single 80-byte header.
    async fn block_header(&self, height: u32) -> NetworkResult<Value>;

    /// `blockchain.block.headers`: `{count, hex, max}` for a run of headers.
    async fn block_headers(&self, start_height: u32, count: u32) -> NetworkResult<Value>;
}
