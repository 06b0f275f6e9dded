//! Lifecycle of one server connection.
//!
//! A connection resolves how to trust the server, opens a session, negotiates the
//! protocol version, asks the pool for room in the server's network bucket and then
//! supervises four tasks: keepalive pings, fee polling, the header subscription that
//! drives the sync engine, and a liveness monitor. The first task to fail tears the
//! whole connection down.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, OnceCell, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use super::bucket::{bucket_for, NetworkBucket};
use super::constants::{COIN, FEE_POLL_INTERVAL, MONITOR_INTERVAL, PING_INTERVAL, PROTOCOL_VERSION};
use super::server_addr::ServerAddr;
use super::session::ServerSession;
use super::timeout::Timeouts;
use super::tls;
use super::transport::Connector;
use super::validate::{self, Balance, HistoryItem, MerkleProof, TxidFromPos, Utxo};
use crate::chain::{ChainId, ChainRegistry, Chains, Header};
use crate::error::{NetworkError, NetworkResult, SyncError};
use crate::sync::{ChunkFetcher, HeaderSource, SyncEngine};

/// Callbacks from a connection into the pool that owns it.
#[async_trait]
pub trait PoolHandle: Send + Sync {
    /// Whether `server` may stay connected given the buckets already in use.
    async fn check_bucket(&self, server: &ServerAddr, bucket: Option<NetworkBucket>) -> bool;

    async fn fee_estimates_updated(&self, server: &ServerAddr, estimates: BTreeMap<u32, u64>);

    /// Called after every processed tip; `updated` is false when the tip was
    /// already known.
    async fn tip_processed(&self, server: &ServerAddr, updated: bool);

    async fn connection_down(&self, server: &ServerAddr);
}

/// Per-connection settings derived from the client configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub client_name: String,
    pub timeouts: Timeouts,
    pub certs_dir: PathBuf,
    /// Only set for the main server.
    pub expected_fingerprint: Option<String>,
    pub fee_eta_targets: Vec<u32>,
    pub debug_rpc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Cancelled,
}

/// What the server claims and which chain it was matched to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Latest claimed tip, recorded before verification.
    pub tip: u32,
    pub chain: Option<ChainId>,
    pub chain_height: Option<u32>,
}

/// Header queries over a connection's session.
pub struct SessionHeaderSource {
    session: Arc<ServerSession>,
    header_timeout: Duration,
}

impl SessionHeaderSource {
    pub fn new(session: Arc<ServerSession>, header_timeout: Duration) -> Self {
        Self {
            session,
            header_timeout,
        }
    }
}

#[async_trait]
impl HeaderSource for SessionHeaderSource {
    async fn block_header(&self, height: u32) -> NetworkResult<Value> {
        self.session.send_request("blockchain.block.header", vec![json!(height)], Some(self.header_timeout)).await
    }

    async fn block_headers(&self, start_height: u32, count: u32) -> NetworkResult<Value> {
        self.session.send_request("blockchain.block.headers", vec![json!(start_height), json!(count)], None).await
    }
}

enum Exit {
    Error(NetworkError),
    Panic(Box<dyn Any + Send + 'static>),
}

impl From<NetworkError> for Exit {
    fn from(err: NetworkError) -> Self {
        Exit::Error(err)
    }
}

pub struct ServerConnection {
    server: ServerAddr,
    registry: Arc<ChainRegistry>,
    pool: Arc<dyn PoolHandle>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    session: OnceCell<Arc<ServerSession>>,
    chunks: OnceCell<ChunkFetcher<SessionHeaderSource>>,
    bucket: OnceCell<Option<NetworkBucket>>,
    ready: watch::Sender<ReadyState>,
    status: watch::Sender<ConnectionStatus>,
    fee_estimates: RwLock<BTreeMap<u32, u64>>,
    closing: CancellationToken,
    disconnected: CancellationToken,
}

impl ServerConnection {
    pub fn new(
        server: ServerAddr,
        registry: Arc<ChainRegistry>,
        pool: Arc<dyn PoolHandle>,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            registry,
            pool,
            connector,
            settings,
            session: OnceCell::new(),
            chunks: OnceCell::new(),
            bucket: OnceCell::new(),
            ready: watch::Sender::new(ReadyState::Pending),
            status: watch::Sender::new(ConnectionStatus::default()),
            fee_estimates: RwLock::new(BTreeMap::new()),
            closing: CancellationToken::new(),
            disconnected: CancellationToken::new(),
        })
    }

    /// Run the connection in the background.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn tip(&self) -> u32 {
        self.status.borrow().tip
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() == ReadyState::Ready
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_cancelled()
    }

    /// Bucket assigned once the connection passed the diversity check.
    pub fn bucket(&self) -> Option<NetworkBucket> {
        self.bucket.get().cloned().flatten()
    }

    pub async fn fee_estimates(&self) -> BTreeMap<u32, u64> {
        self.fee_estimates.read().await.clone()
    }

    /// Resolves once the first tip was accepted, or fails if the connection died
    /// or was cancelled before that.
    pub async fn wait_ready(&self) -> NetworkResult<()> {
        let mut rx = self.ready.subscribe();
        let state = rx
            .wait_for(|state| *state != ReadyState::Pending)
            .await
            .map(|state| *state)
            .map_err(|_| NetworkError::SessionClosed)?;
        match state {
            ReadyState::Ready => Ok(()),
            _ => Err(NetworkError::SessionClosed),
        }
    }

    pub async fn wait_disconnected(&self) {
        self.disconnected.cancelled().await
    }

    /// Give up waiting for readiness. Has no effect once ready.
    pub fn cancel_ready(&self) {
        self.ready.send_if_modified(|state| {
            if *state == ReadyState::Pending {
                *state = ReadyState::Cancelled;
                true
            } else {
                false
            }
        });
    }

    pub async fn close(&self) {
        self.closing.cancel();
        if let Some(session) = self.session.get() {
            session.close().await;
        }
    }

    pub async fn run(self: Arc<Self>) {
        let result = tokio::select! {
            result = self.run_inner() => result,
            _ = self.closing.cancelled() => Err(Exit::Error(NetworkError::graceful("connection closed locally"))),
        };

        let panic = match result {
            Ok(()) => None,
            Err(Exit::Error(e)) => {
                self.log_disconnect(&e);
                None
            }
            Err(Exit::Panic(payload)) => {
                tracing::error!("[{}] connection task panicked", self.server);
                Some(payload)
            }
        };

        self.cancel_ready();
        if let Some(session) = self.session.get() {
            session.close().await;
        }
        self.pool.connection_down(&self.server).await;
        self.disconnected.cancel();

        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
    }

    fn log_disconnect(&self, err: &NetworkError) {
        let level = err.log_level();
        if level == Level::ERROR {
            tracing::error!("[{}] disconnecting due to {}", self.server, err);
        } else if level == Level::WARN {
            tracing::warn!("[{}] disconnecting due to {}", self.server, err);
        } else if level == Level::INFO {
            tracing::info!("[{}] disconnecting due to {}", self.server, err);
        } else {
            tracing::debug!("[{}] disconnecting due to {}", self.server, err);
        }
    }

    async fn run_inner(self: &Arc<Self>) -> Result<(), Exit> {
        let timeouts = self.settings.timeouts;
        let cert_path = tls::cert_path(&self.settings.certs_dir, self.server.host());
        let trust = tls::resolve_trust(
            &*self.connector,
            &self.server,
            &cert_path,
            self.settings.expected_fingerprint.as_deref(),
            Utc::now(),
            timeouts.generic,
        )
        .await?;

        let connected = self.connector.connect(&self.server, &trust, timeouts.generic).await?;
        let session = Arc::new(ServerSession::new(
            connected.stream,
            self.server.net_addr_str(),
            connected.remote_addr,
            timeouts.generic,
            self.settings.debug_rpc,
        ));
        let _ = self.session.set(session.clone());

        let version = session
            .send_request(
                "server.version",
                vec![json!(self.settings.client_name), json!(PROTOCOL_VERSION)],
                None,
            )
            .await
            .map_err(|e| match e {
                // most likely an unsupported protocol version
                NetworkError::Rpc {
                    ..
                } => NetworkError::graceful(e.to_string()),
                other => other,
            })?;
        let (software, protocol) = validate::server_version(&version)?;

        let remote_ip = connected.remote_addr.map(|addr| addr.ip()).or_else(|| self.server.ip());
        let bucket = bucket_for(self.server.host(), remote_ip);
        if !self.pool.check_bucket(&self.server, bucket.clone()).await {
            let name = bucket.map(|b| b.to_string()).unwrap_or_default();
            return Err(NetworkError::graceful(format!("too many connected servers already in bucket {}", name)).into());
        }
        let _ = self.bucket.set(bucket);
        tracing::info!("[{}] connection established. version: {} {}", self.server, software, protocol);

        self.supervise(session).await
    }

    async fn supervise(self: &Arc<Self>, session: Arc<ServerSession>) -> Result<(), Exit> {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().ping_loop(session.clone()));
        tasks.spawn(self.clone().fee_loop(session.clone()));
        tasks.spawn(self.clone().header_loop(session.clone()));
        tasks.spawn(self.clone().monitor_loop(session));

        let outcome = loop {
            match tasks.join_next().await {
                None => break Ok(()),
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => break Err(Exit::Error(e.into_disconnect())),
                Some(Err(e)) if e.is_panic() => break Err(Exit::Panic(e.into_panic())),
                Some(Err(_)) => continue,
            }
        };
        tasks.shutdown().await;
        outcome
    }

    async fn ping_loop(self: Arc<Self>, session: Arc<ServerSession>) -> NetworkResult<()> {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;
            session.send_request("server.ping", vec![], None).await?;
        }
    }

    async fn monitor_loop(self: Arc<Self>, session: Arc<ServerSession>) -> NetworkResult<()> {
        loop {
            tokio::time::sleep(MONITOR_INTERVAL).await;
            if session.is_closing() {
                return Err(NetworkError::graceful("session was closed"));
            }
        }
    }

    async fn fee_loop(self: Arc<Self>, session: Arc<ServerSession>) -> NetworkResult<()> {
        loop {
            let session = &session;
            let replies = futures::future::try_join_all(self.settings.fee_eta_targets.iter().map(|&target| async move {
                let reply = session.send_request("blockchain.estimatefee", vec![json!(target)], None).await?;
                Ok::<_, NetworkError>((target, validate::real_number(&reply)?))
            }))
            .await?;

            let snapshot = {
                let mut estimates = self.fee_estimates.write().await;
                for (target, btc_per_kb) in replies {
                    let fee = (btc_per_kb * COIN) as i64;
                    if fee < 0 {
                        continue;
                    }
                    estimates.insert(target, fee as u64);
                }
                estimates.clone()
            };
            self.pool.fee_estimates_updated(&self.server, snapshot).await;
            tokio::time::sleep(FEE_POLL_INTERVAL).await;
        }
    }

    async fn header_loop(self: Arc<Self>, session: Arc<ServerSession>) -> NetworkResult<()> {
        let source = Arc::new(SessionHeaderSource::new(session.clone(), self.settings.timeouts.urgent));
        let max_checkpoint = self.registry.params().max_checkpoint();
        let mut engine = SyncEngine::new(source, self.server.to_string(), max_checkpoint);
        let _ = self.chunks.set(engine.chunks().clone());

        let (queue, mut notifications) = mpsc::unbounded_channel();
        session.subscribe("blockchain.headers.subscribe", vec![], queue).await?;

        while let Some(item) = notifications.recv().await {
            let raw = item
                .first()
                .ok_or_else(|| NetworkError::RequestCorrupted("empty header notification".to_string()))?;
            let (height, hex) = validate::header_notification(raw)?;
            let header = Header::from_hex(&hex, height)
                .map_err(|e| NetworkError::RequestCorrupted(format!("bad tip header: {}", e)))?;

            engine.set_tip(header);
            self.status.send_modify(|status| status.tip = height);
            if height < max_checkpoint {
                return Err(NetworkError::graceful("server tip below max checkpoint"));
            }

            let updated = {
                let mut chains = self.registry.lock().await;
                self.mark_ready(&mut engine, &chains)?;
                let updated = engine.process_tip(&mut *chains).await.map_err(NetworkError::from)?;
                self.publish_status(&engine, &chains);
                updated
            };
            if updated {
                tracing::info!("[{}] new chain tip. height={}", self.server, height);
            } else {
                tracing::debug!("[{}] skipping header {}", self.server, height);
            }
            self.pool.tip_processed(&self.server, updated).await;
        }
        Err(NetworkError::graceful("header subscription ended"))
    }

    fn mark_ready(&self, engine: &mut SyncEngine<SessionHeaderSource>, chains: &Chains) -> NetworkResult<()> {
        let state = *self.ready.borrow();
        match state {
            ReadyState::Cancelled => {
                Err(NetworkError::graceful("conn establishment was too slow; ready signal was cancelled"))
            }
            ReadyState::Ready => Ok(()),
            ReadyState::Pending => {
                engine.mark_ready(chains);
                self.publish_status(engine, chains);
                self.ready.send_replace(ReadyState::Ready);
                Ok(())
            }
        }
    }

    fn publish_status(&self, engine: &SyncEngine<SessionHeaderSource>, chains: &Chains) {
        let chain = engine.chain();
        self.status.send_replace(ConnectionStatus {
            tip: engine.tip(),
            chain,
            chain_height: chain.and_then(|id| chains.height_of(id)),
        });
    }

    fn session(&self) -> NetworkResult<&Arc<ServerSession>> {
        self.session.get().ok_or(NetworkError::NotConnected)
    }

    pub async fn get_block_header(&self, height: u32) -> NetworkResult<Header> {
        tracing::info!("[{}] requesting block header {}", self.server, height);
        let reply = self
            .session()?
            .send_request("blockchain.block.header", vec![json!(height)], Some(self.settings.timeouts.urgent))
            .await?;
        Header::from_hex(validate::hex_str(&reply)?, height)
            .map_err(|e| NetworkError::RequestCorrupted(format!("bad header at {}: {}", height, e)))
    }

    /// Download the chunk containing `height` and connect it to this server's chain.
    ///
    /// Returns whether the chunk connected and how many headers it held, or `None`
    /// when `can_return_early` and the chunk is already being fetched.
    pub async fn request_chunk(
        &self,
        height: u32,
        tip: Option<u32>,
        can_return_early: bool,
    ) -> NetworkResult<Option<(bool, u32)>> {
        let chunks = self.chunks.get().ok_or(NetworkError::NotConnected)?;
        let chunk = if can_return_early {
            match chunks.fetch_if_idle(height, tip).await? {
                Some(chunk) => chunk,
                None => return Ok(None),
            }
        } else {
            chunks.fetch(height, tip).await?
        };

        let followed = self.status.borrow().chain;
        let mut chains = self.registry.lock().await;
        let chain = followed.filter(|id| chains.contains(*id)).unwrap_or_else(|| chains.best_id());
        let connected = chains
            .connect_chunk(chain, chunk.start_height, &chunk.headers)
            .map_err(|e| NetworkError::from(SyncError::from(e)))?;
        Ok(Some((connected, if connected { chunk.count() } else { 0 })))
    }

    pub async fn get_merkle_for_transaction(&self, tx_hash: &str, tx_height: u32) -> NetworkResult<MerkleProof> {
        validate::require_hash256(tx_hash, "txid")?;
        let reply = self
            .session()?
            .send_request("blockchain.transaction.get_merkle", vec![json!(tx_hash), json!(tx_height)], None)
            .await?;
        // tx_height is only a hint; the reply's block_height is not required to match
        validate::merkle_proof(&reply)
    }

    /// Raw transaction hex, checked to decode to the requested txid.
    pub async fn get_transaction(&self, tx_hash: &str, timeout: Option<Duration>) -> NetworkResult<String> {
        validate::require_hash256(tx_hash, "txid")?;
        let reply = self.session()?.send_request("blockchain.transaction.get", vec![json!(tx_hash)], timeout).await?;
        let raw = validate::hex_str(&reply)?;
        let bytes = hex::decode(raw)
            .map_err(|e| NetworkError::RequestCorrupted(format!("cannot decode transaction {}: {}", tx_hash, e)))?;
        let tx: Transaction = deserialize(&bytes).map_err(|e| {
            NetworkError::RequestCorrupted(format!("cannot deserialize received transaction (txid {}): {}", tx_hash, e))
        })?;
        let txid = tx.compute_txid().to_string();
        if txid != tx_hash.to_ascii_lowercase() {
            return Err(NetworkError::RequestCorrupted(format!(
                "received tx does not match expected txid {} (got {})",
                tx_hash, txid
            )));
        }
        Ok(raw.to_string())
    }

    pub async fn get_history_for_scripthash(&self, scripthash: &str) -> NetworkResult<Vec<HistoryItem>> {
        validate::require_hash256(scripthash, "scripthash")?;
        let reply = self.session()?.send_request("blockchain.scripthash.get_history", vec![json!(scripthash)], None).await?;
        validate::history(&reply)
    }

    pub async fn listunspent_for_scripthash(&self, scripthash: &str) -> NetworkResult<Vec<Utxo>> {
        validate::require_hash256(scripthash, "scripthash")?;
        let reply = self.session()?.send_request("blockchain.scripthash.listunspent", vec![json!(scripthash)], None).await?;
        validate::listunspent(&reply)
    }

    pub async fn get_balance_for_scripthash(&self, scripthash: &str) -> NetworkResult<Balance> {
        validate::require_hash256(scripthash, "scripthash")?;
        let reply = self.session()?.send_request("blockchain.scripthash.get_balance", vec![json!(scripthash)], None).await?;
        validate::balance(&reply)
    }

    pub async fn get_txid_from_txpos(&self, tx_height: u32, tx_pos: u32, merkle: bool) -> NetworkResult<TxidFromPos> {
        let reply = self
            .session()?
            .send_request(
                "blockchain.transaction.id_from_pos",
                vec![json!(tx_height), json!(tx_pos), json!(merkle)],
                None,
            )
            .await?;
        validate::txid_from_pos(&reply, merkle)
    }

    /// Broadcast a raw transaction and return the txid the server reports.
    pub async fn broadcast_raw(&self, raw_tx: &str, timeout: Option<Duration>) -> NetworkResult<String> {
        let reply = self.session()?.send_request("blockchain.transaction.broadcast", vec![json!(raw_tx)], timeout).await?;
        Ok(validate::hash256_str(&reply)?.to_string())
    }
}
