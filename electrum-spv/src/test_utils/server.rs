use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use rustls::pki_types::CertificateDer;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chain::Header;
use crate::error::NetworkResult;
use crate::network::constants::CHUNK_SIZE;
use crate::network::{Connected, Connector, ServerAddr, TrustRoot};

struct ServerState {
    headers: BTreeMap<u32, Header>,
    fee: f64,
    reject_version: bool,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    methods: Vec<String>,
}

/// An in-memory Electrum server answering the header, fee and broadcast methods
/// from a scripted header set.
#[derive(Clone)]
pub struct MockElectrumServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockElectrumServer {
    pub fn new(headers: Vec<Header>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                headers: headers.into_iter().map(|header| (header.height(), header)).collect(),
                fee: 0.0001,
                reject_version: false,
                subscribers: Vec::new(),
                methods: Vec::new(),
            })),
        }
    }

    pub fn with_fee(self, btc_per_kb: f64) -> Self {
        self.state.lock().unwrap().fee = btc_per_kb;
        self
    }

    /// Answer `server.version` with an RPC error.
    pub fn rejecting_version(self) -> Self {
        self.state.lock().unwrap().reject_version = true;
        self
    }

    /// Add or replace headers; the highest one becomes the tip.
    pub fn extend(&self, headers: &[Header]) {
        let mut state = self.state.lock().unwrap();
        for header in headers {
            state.headers.insert(header.height(), *header);
        }
    }

    /// Push the current tip to every subscribed session.
    pub fn announce_tip(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(tip) = state.tip() else {
            return;
        };
        let line = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.headers.subscribe",
            "params": [tip],
        })
        .to_string();
        state.subscribers.retain(|subscriber| subscriber.send(line.clone()).is_ok());
    }

    /// Methods called so far, in arrival order.
    pub fn methods(&self) -> Vec<String> {
        self.state.lock().unwrap().methods.clone()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
            remote_addr: None,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serve one client over `stream` until it hangs up.
    pub fn serve(&self, stream: DuplexStream) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
            loop {
                let outgoing = tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let mut state = state.lock().unwrap();
                            state.handle(&line, &push_tx)
                        }
                        _ => break,
                    },
                    Some(push) = push_rx.recv() => Some(push),
                };
                if let Some(mut outgoing) = outgoing {
                    outgoing.push('\n');
                    if write.write_all(outgoing.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}

impl ServerState {
    fn tip(&self) -> Option<Value> {
        self.headers.values().next_back().map(|tip| json!({"height": tip.height(), "hex": tip.to_hex()}))
    }

    fn handle(&mut self, line: &str, push: &mpsc::UnboundedSender<String>) -> Option<String> {
        let request: Value = serde_json::from_str(line).ok()?;
        let id = request.get("id")?.clone();
        let method = request.get("method")?.as_str()?.to_string();
        let params = request.get("params").and_then(Value::as_array).cloned().unwrap_or_default();
        self.methods.push(method.clone());

        let reply = match method.as_str() {
            "server.version" if self.reject_version => Err((1, "unsupported protocol version".to_string())),
            "server.version" => Ok(json!(["MockServer 1.0", "1.4"])),
            "server.ping" => Ok(Value::Null),
            "blockchain.headers.subscribe" => {
                self.subscribers.push(push.clone());
                self.tip().ok_or((2, "no headers".to_string()))
            }
            "blockchain.block.header" => {
                let height = params.first().and_then(Value::as_u64).unwrap_or(u64::MAX);
                u32::try_from(height)
                    .ok()
                    .and_then(|height| self.headers.get(&height))
                    .map(|header| json!(header.to_hex()))
                    .ok_or((1, format!("height {} out of range", height)))
            }
            "blockchain.block.headers" => {
                let start = params.first().and_then(Value::as_u64).unwrap_or(0) as u32;
                let count = params.get(1).and_then(Value::as_u64).unwrap_or(0) as u32;
                let hex: Vec<String> = (start..start.saturating_add(count.min(CHUNK_SIZE)))
                    .map_while(|height| self.headers.get(&height).map(Header::to_hex))
                    .collect();
                Ok(json!({"count": hex.len(), "hex": hex.concat(), "max": CHUNK_SIZE}))
            }
            "blockchain.estimatefee" => Ok(json!(self.fee)),
            "blockchain.transaction.broadcast" => params
                .first()
                .and_then(Value::as_str)
                .and_then(|raw| hex::decode(raw).ok())
                .and_then(|bytes| deserialize::<Transaction>(&bytes).ok())
                .map(|tx| json!(tx.compute_txid().to_string()))
                .ok_or((1, "the transaction was rejected by network rules".to_string())),
            _ => Err((-32601, format!("unknown method {}", method))),
        };

        let body = match reply {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };
        Some(body.to_string())
    }
}

/// A [`Connector`] that attaches every connection to a [`MockElectrumServer`].
#[derive(Clone)]
pub struct MockConnector {
    server: MockElectrumServer,
    remote_addr: Option<SocketAddr>,
    connects: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Report `addr` as the peer address of every connection.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _server: &ServerAddr, _trust: &TrustRoot, _timeout: Duration) -> NetworkResult<Connected> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(256 * 1024);
        self.server.serve(server);
        Ok(Connected {
            stream: Box::new(client),
            remote_addr: self.remote_addr,
        })
    }

    async fn check_ca_signed(&self, _server: &ServerAddr, _timeout: Duration) -> NetworkResult<bool> {
        Ok(true)
    }

    async fn fetch_certificate(
        &self,
        _server: &ServerAddr,
        _timeout: Duration,
    ) -> NetworkResult<Option<CertificateDer<'static>>> {
        Ok(None)
    }
}
