use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chain::Header;
use crate::error::{NetworkError, NetworkResult};
use crate::network::constants::CHUNK_SIZE;
use crate::sync::HeaderSource;

/// A [`HeaderSource`] serving a fixed set of headers and counting requests.
pub struct ScriptedHeaderSource {
    headers: Mutex<BTreeMap<u32, Header>>,
    chunk_override: Mutex<Option<Value>>,
    header_fetches: AtomicUsize,
    chunk_fetches: AtomicUsize,
}

impl ScriptedHeaderSource {
    pub fn new(headers: Vec<Header>) -> Self {
        Self {
            headers: Mutex::new(headers.into_iter().map(|header| (header.height(), header)).collect()),
            chunk_override: Mutex::new(None),
            header_fetches: AtomicUsize::new(0),
            chunk_fetches: AtomicUsize::new(0),
        }
    }

    /// Answer every chunk request with `response` verbatim.
    pub fn with_chunk_response(self, response: Value) -> Self {
        *self.chunk_override.lock().unwrap() = Some(response);
        self
    }

    /// Swap in a different header at its height.
    pub fn replace(&self, header: Header) {
        self.headers.lock().unwrap().insert(header.height(), header);
    }

    pub fn header_fetches(&self) -> usize {
        self.header_fetches.load(Ordering::SeqCst)
    }

    pub fn chunk_fetches(&self) -> usize {
        self.chunk_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeaderSource for ScriptedHeaderSource {
    async fn block_header(&self, height: u32) -> NetworkResult<Value> {
        self.header_fetches.fetch_add(1, Ordering::SeqCst);
        match self.headers.lock().unwrap().get(&height) {
            Some(header) => Ok(Value::String(header.to_hex())),
            None => Err(NetworkError::Rpc {
                code: 1,
                message: format!("height {} out of range", height),
            }),
        }
    }

    async fn block_headers(&self, start_height: u32, count: u32) -> NetworkResult<Value> {
        self.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.chunk_override.lock().unwrap().clone() {
            return Ok(response);
        }
        let headers = self.headers.lock().unwrap();
        let hex: Vec<String> = (start_height..start_height.saturating_add(count))
            .map_while(|height| headers.get(&height).map(Header::to_hex))
            .collect();
        Ok(json!({
            "count": hex.len(),
            "hex": hex.concat(),
            "max": CHUNK_SIZE,
        }))
    }
}
