//! Bulk header downloads, one 2016-header chunk at a time.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::source::HeaderSource;
use crate::chain::header::headers_from_hex;
use crate::chain::{Header, HEADER_SIZE};
use crate::error::{NetworkError, NetworkResult};
use crate::network::constants::CHUNK_SIZE;
use crate::network::validate;

/// A validated chunk response.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub start_height: u32,
    pub headers: Vec<Header>,
}

impl Chunk {
    pub fn index(&self) -> u32 {
        self.start_height / CHUNK_SIZE
    }

    pub fn count(&self) -> u32 {
        self.headers.len() as u32
    }
}

/// Fetches chunks from one server, remembering which indices are in flight.
pub struct ChunkFetcher<S: HeaderSource + ?Sized> {
    source: Arc<S>,
    in_flight: Arc<Mutex<HashSet<u32>>>,
}

impl<S: HeaderSource + ?Sized> Clone for ChunkFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<S: HeaderSource + ?Sized> ChunkFetcher<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Number of headers to ask for in the chunk containing `height`, given the
    /// server's claimed tip.
    pub fn chunk_size(height: u32, tip: Option<u32>) -> u32 {
        let index = height / CHUNK_SIZE;
        match tip {
            None => CHUNK_SIZE,
            Some(tip) => {
                let remaining = i64::from(tip) - i64::from(index * CHUNK_SIZE) + 1;
                remaining.clamp(0, i64::from(CHUNK_SIZE)) as u32
            }
        }
    }

    /// Download and validate the chunk containing `height`.
    pub async fn fetch(&self, height: u32, tip: Option<u32>) -> NetworkResult<Chunk> {
        let index = height / CHUNK_SIZE;
        self.in_flight.lock().await.insert(index);
        let result = self.download(height, tip).await;
        self.in_flight.lock().await.remove(&index);
        result
    }

    /// Like [`fetch`](Self::fetch), but yields `Ok(None)` when the chunk is already
    /// being downloaded.
    pub async fn fetch_if_idle(&self, height: u32, tip: Option<u32>) -> NetworkResult<Option<Chunk>> {
        let index = height / CHUNK_SIZE;
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(index) {
                return Ok(None);
            }
        }
        let result = self.download(height, tip).await;
        self.in_flight.lock().await.remove(&index);
        result.map(Some)
    }

    async fn download(&self, height: u32, tip: Option<u32>) -> NetworkResult<Chunk> {
        let start_height = height / CHUNK_SIZE * CHUNK_SIZE;
        let size = Self::chunk_size(height, tip);
        tracing::info!("requesting chunk from height {}", height);
        let response = validate::chunk_response(&self.source.block_headers(start_height, size).await?)?;
        if response.hex.len() != HEADER_SIZE * 2 * response.count as usize {
            return Err(NetworkError::RequestCorrupted("inconsistent chunk hex and count".to_string()));
        }
        if response.count != size {
            return Err(NetworkError::RequestCorrupted(format!(
                "expected {} headers but only got {}",
                size, response.count
            )));
        }
        let headers = headers_from_hex(&response.hex, start_height)
            .map_err(|e| NetworkError::RequestCorrupted(format!("undecodable chunk: {}", e)))?;
        Ok(Chunk {
            start_height,
            headers,
        })
    }

    pub async fn is_in_flight(&self, index: u32) -> bool {
        self.in_flight.lock().await.contains(&index)
    }
}
