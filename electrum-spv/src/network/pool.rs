//! Pool of server connections.
//!
//! The pool keeps a target number of connections open, spread over distinct network
//! buckets, and designates one of them as the main server that wallet queries are
//! routed through. With auto-connect enabled the main server follows the best chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Transaction, Txid};
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::bucket::NetworkBucket;
use super::connection::{PoolHandle, ServerConnection};
use super::constants::{MAINTENANCE_INTERVAL, MAIN_SERVER_RETRY_INTERVAL, SERVER_RETRY_INTERVAL};
use super::event::NetworkEvent;
use super::server_addr::ServerAddr;
use super::transport::Connector;
use super::validate::TxidFromPos;
use crate::chain::ChainRegistry;
use crate::client::ClientConfig;
use crate::error::{NetworkError, NetworkResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Limits on how many connected servers may share a network bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
    pub num_target_connected: usize,
    pub max_servers_per_bucket: usize,
}

impl BucketPolicy {
    /// Whether a server in `bucket` may join the servers in `accepted`.
    ///
    /// The main server and servers without a bucket are always allowed. Onion servers
    /// are capped at half the connection target.
    pub fn allows<'a>(
        &self,
        bucket: Option<&NetworkBucket>,
        is_main: bool,
        accepted: impl IntoIterator<Item = &'a NetworkBucket>,
    ) -> bool {
        if is_main {
            return true;
        }
        let Some(bucket) = bucket else {
            return true;
        };
        let sharing = accepted.into_iter().filter(|other| *other == bucket).count();
        match bucket {
            NetworkBucket::Onion => sharing <= self.num_target_connected / 2,
            NetworkBucket::Supernet(_) => sharing < self.max_servers_per_bucket,
        }
    }
}

#[derive(Default)]
struct PoolState {
    main_server: Option<ServerAddr>,
    /// Connections that are running, ready or not.
    connections: HashMap<ServerAddr, Arc<ServerConnection>>,
    /// Servers that passed the bucket check.
    buckets: HashMap<ServerAddr, Option<NetworkBucket>>,
    fee_estimates: HashMap<ServerAddr, BTreeMap<u32, u64>>,
    last_attempt: HashMap<ServerAddr, Instant>,
}

impl PoolState {
    fn ready_connections(&self) -> impl Iterator<Item = &Arc<ServerConnection>> {
        self.connections.values().filter(|connection| connection.is_ready())
    }

    fn main_connection(&self) -> Option<&Arc<ServerConnection>> {
        self.main_server.as_ref().and_then(|server| self.connections.get(server))
    }

    fn can_retry(&self, server: &ServerAddr, interval: Duration) -> bool {
        self.last_attempt.get(server).map_or(true, |at| at.elapsed() >= interval)
    }
}

/// Middle value of `values`; the mean of the two middle values for even counts.
fn median(mut values: Vec<u64>) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2)
    }
}

pub struct ConnectionPool {
    config: ClientConfig,
    registry: Arc<ChainRegistry>,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    tasks: Mutex<JoinSet<()>>,
    events: broadcast::Sender<NetworkEvent>,
    shutdown: CancellationToken,
    this: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(config: ClientConfig, registry: Arc<ChainRegistry>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let main_server =
            config.main_server.clone().or_else(|| config.servers.choose(&mut rand::thread_rng()).cloned());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            config,
            registry,
            connector,
            state: Mutex::new(PoolState {
                main_server,
                ..PoolState::default()
            }),
            tasks: Mutex::new(JoinSet::new()),
            events,
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NetworkEvent) {
        tracing::debug!("network event: {}", event.description());
        let _ = self.events.send(event);
    }

    fn policy(&self) -> BucketPolicy {
        BucketPolicy {
            num_target_connected: self.config.target_connections(),
            max_servers_per_bucket: self.config.max_servers_per_bucket,
        }
    }

    /// Start the maintenance loop, which opens the main connection on its first pass.
    pub async fn start(&self) -> NetworkResult<()> {
        let this = self.this.upgrade().ok_or(NetworkError::NotConnected)?;
        tracing::info!("starting connection pool for {}", self.config.network);
        self.tasks.lock().await.spawn(this.maintain());
        Ok(())
    }

    pub async fn stop(&self) {
        tracing::info!("stopping connection pool");
        self.shutdown.cancel();
        let connections: Vec<_> = self.state.lock().await.connections.values().cloned().collect();
        for connection in &connections {
            connection.close().await;
        }
        for connection in &connections {
            connection.wait_disconnected().await;
        }
        self.tasks.lock().await.shutdown().await;
        if let Err(e) = self.registry.flush().await {
            tracing::warn!("failed to flush header files: {}", e);
        }
    }

    pub async fn main_server(&self) -> Option<ServerAddr> {
        self.state.lock().await.main_server.clone()
    }

    /// The main connection, once it is ready.
    pub async fn main_connection(&self) -> Option<Arc<ServerConnection>> {
        self.state.lock().await.main_connection().filter(|connection| connection.is_ready()).cloned()
    }

    pub async fn connection(&self, server: &ServerAddr) -> Option<Arc<ServerConnection>> {
        self.state.lock().await.connections.get(server).cloned()
    }

    /// Servers whose connection is ready.
    pub async fn connected_servers(&self) -> Vec<ServerAddr> {
        self.state.lock().await.ready_connections().map(|connection| connection.server().clone()).collect()
    }

    /// Open a connection to `server` unless one is already running.
    pub async fn connect_to(&self, server: ServerAddr) -> NetworkResult<Arc<ServerConnection>> {
        let this = self.this.upgrade().ok_or(NetworkError::NotConnected)?;
        let connection = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.connections.get(&server) {
                return Ok(existing.clone());
            }
            state.last_attempt.insert(server.clone(), Instant::now());
            let handle: Arc<dyn PoolHandle> = this.clone();
            let connection = ServerConnection::new(
                server.clone(),
                self.registry.clone(),
                handle,
                self.connector.clone(),
                self.config.connection_settings(&server),
            );
            state.connections.insert(server.clone(), connection.clone());
            connection
        };

        tracing::info!("[{}] connecting", server);
        let mut tasks = self.tasks.lock().await;
        let runner = connection.clone();
        tasks.spawn(async move { runner.run().await });
        tasks.spawn(this.watch_ready(connection.clone()));
        Ok(connection)
    }

    /// Close connections that are not ready within the urgent timeout.
    async fn watch_ready(self: Arc<Self>, connection: Arc<ServerConnection>) {
        let deadline = self.config.timeouts().urgent;
        match tokio::time::timeout(deadline, connection.wait_ready()).await {
            Ok(Ok(())) => {
                tracing::info!("[{}] connection ready", connection.server());
                self.emit(NetworkEvent::ServerConnected {
                    server: connection.server().clone(),
                });
                self.emit_status().await;
            }
            Ok(Err(_)) => {
                tracing::debug!("[{}] connection died before becoming ready", connection.server());
            }
            Err(_) => {
                tracing::info!(
                    "[{}] couldn't launch connection: connection establishment was too slow",
                    connection.server()
                );
                connection.cancel_ready();
                connection.close().await;
            }
        }
    }

    /// Make `server` the main server, connecting to it if needed.
    pub async fn switch_to(&self, server: ServerAddr) -> NetworkResult<()> {
        let previous = {
            let mut state = self.state.lock().await;
            if state.main_server.as_ref() == Some(&server) && state.connections.contains_key(&server) {
                return Ok(());
            }
            state.main_server.replace(server.clone())
        };
        tracing::info!("switching main server to {}", server);
        self.connect_to(server.clone()).await?;

        if self.config.one_server {
            if let Some(old) = previous.filter(|old| *old != server) {
                if let Some(connection) = self.connection(&old).await {
                    connection.close().await;
                }
            }
        }
        self.emit(NetworkEvent::MainServerChanged {
            server,
        });
        Ok(())
    }

    /// Move the main server to one following the best chain when it falls behind.
    async fn switch_lagging_main(&self) {
        if !self.config.auto_connect {
            return;
        }
        let (best_id, best_height) = self.registry.best_chain().await;
        let candidate = {
            let state = self.state.lock().await;
            let lagging = match state.main_connection().filter(|connection| connection.is_ready()) {
                Some(main) => best_height.saturating_sub(main.tip()) > 1,
                None => true,
            };
            if !lagging {
                return;
            }
            let on_best: Vec<ServerAddr> = state
                .ready_connections()
                .filter(|connection| {
                    let status = connection.status();
                    status.chain == Some(best_id) && status.tip == best_height
                })
                .map(|connection| connection.server().clone())
                .collect();
            on_best.choose(&mut rand::thread_rng()).cloned()
        };
        if let Some(server) = candidate {
            if let Err(e) = self.switch_to(server).await {
                tracing::warn!("failed to switch away from lagging main server: {}", e);
            }
        }
    }

    /// Fee estimates in sat/kB: the median over connected servers with auto-connect,
    /// otherwise the main server's.
    pub async fn fee_estimates(&self) -> BTreeMap<u32, u64> {
        let state = self.state.lock().await;
        self.merged_fee_estimates(&state)
    }

    fn merged_fee_estimates(&self, state: &PoolState) -> BTreeMap<u32, u64> {
        if !self.config.auto_connect {
            return state
                .main_server
                .as_ref()
                .and_then(|server| state.fee_estimates.get(server))
                .cloned()
                .unwrap_or_default();
        }
        self.config
            .fee_eta_targets
            .iter()
            .filter_map(|target| {
                let values: Vec<u64> = state
                    .fee_estimates
                    .values()
                    .filter_map(|estimates| estimates.get(target).copied())
                    .filter(|fee| *fee > 0)
                    .collect();
                median(values).map(|fee| (*target, fee))
            })
            .collect()
    }

    async fn main_for_query(&self) -> NetworkResult<Arc<ServerConnection>> {
        self.main_connection().await.ok_or(NetworkError::NotConnected)
    }

    pub async fn get_txid_from_txpos(&self, tx_height: u32, tx_pos: u32, merkle: bool) -> NetworkResult<TxidFromPos> {
        self.main_for_query().await?.get_txid_from_txpos(tx_height, tx_pos, merkle).await
    }

    /// Broadcast through the main server, which must echo the transaction's txid.
    pub async fn broadcast_transaction(&self, tx: &Transaction, timeout: Option<Duration>) -> NetworkResult<Txid> {
        let main = self.main_for_query().await?;
        let txid = tx.compute_txid();
        let returned = main.broadcast_raw(&serialize_hex(tx), timeout).await?;
        if returned != txid.to_string() {
            tracing::info!(
                "[{}] unexpected txid for broadcast_transaction: {} != {}",
                main.server(),
                returned,
                txid
            );
            return Err(NetworkError::RequestCorrupted("server returned unexpected transaction id".to_string()));
        }
        Ok(txid)
    }

    async fn emit_status(&self) {
        let (_, best_height) = self.registry.best_chain().await;
        let (connected_count, main_server) = {
            let state = self.state.lock().await;
            (state.ready_connections().count(), state.main_server.clone())
        };
        self.emit(NetworkEvent::StatusUpdated {
            connected_count,
            main_server,
            best_height,
        });
    }

    async fn maintain(self: Arc<Self>) {
        loop {
            self.reap_tasks().await;
            self.ensure_main().await;
            self.fill_connections().await;
            self.prune_forks().await;

            tokio::select! {
                _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                _ = self.shutdown.cancelled() => {
                    tracing::info!("maintenance loop shutting down");
                    break;
                }
            }
        }
    }

    async fn reap_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("connection task panicked: {}", e);
                }
            }
        }
    }

    /// Keep the main server connected, or replace it when auto-connect allows.
    async fn ensure_main(&self) {
        let (main, running, retry) = {
            let mut state = self.state.lock().await;
            if state.main_server.is_none() {
                state.main_server = self.config.servers.choose(&mut rand::thread_rng()).cloned();
            }
            let Some(main) = state.main_server.clone() else {
                return;
            };
            let running = state.connections.contains_key(&main);
            let retry = state.can_retry(&main, MAIN_SERVER_RETRY_INTERVAL);
            (main, running, retry)
        };
        if running {
            return;
        }

        if self.config.auto_connect {
            let (best_id, _) = self.registry.best_chain().await;
            let replacement = {
                let state = self.state.lock().await;
                let on_best: Vec<ServerAddr> = state
                    .ready_connections()
                    .filter(|connection| connection.status().chain == Some(best_id))
                    .map(|connection| connection.server().clone())
                    .collect();
                on_best.choose(&mut rand::thread_rng()).cloned()
            };
            if let Some(server) = replacement {
                if let Err(e) = self.switch_to(server).await {
                    tracing::warn!("failed to switch main server: {}", e);
                }
                return;
            }
        }

        if retry {
            if let Err(e) = self.connect_to(main).await {
                tracing::warn!("failed to reconnect to main server: {}", e);
            }
        }
    }

    async fn fill_connections(&self) {
        if self.config.one_server {
            return;
        }
        let target = self.config.target_connections();
        let candidates: Vec<ServerAddr> = {
            let state = self.state.lock().await;
            let missing = target.saturating_sub(state.connections.len());
            let mut candidates: Vec<ServerAddr> = self
                .config
                .servers
                .iter()
                .filter(|server| !state.connections.contains_key(*server))
                .filter(|server| state.can_retry(server, SERVER_RETRY_INTERVAL))
                .cloned()
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(missing);
            candidates
        };
        for server in candidates {
            if let Err(e) = self.connect_to(server).await {
                tracing::warn!("failed to start connection: {}", e);
            }
        }
    }

    async fn prune_forks(&self) {
        let removed = self.registry.lock().await.prune_forks(self.config.fork_prune_depth);
        if !removed.is_empty() {
            tracing::info!("pruned {} stale fork(s)", removed.len());
        }
    }
}

#[async_trait]
impl PoolHandle for ConnectionPool {
    async fn check_bucket(&self, server: &ServerAddr, bucket: Option<NetworkBucket>) -> bool {
        let mut state = self.state.lock().await;
        let is_main = state.main_server.as_ref() == Some(server);
        let accepted = state
            .buckets
            .iter()
            .filter(|(other, _)| *other != server)
            .filter_map(|(_, bucket)| bucket.as_ref());
        if !self.policy().allows(bucket.as_ref(), is_main, accepted) {
            return false;
        }
        state.buckets.insert(server.clone(), bucket);
        true
    }

    async fn fee_estimates_updated(&self, server: &ServerAddr, estimates: BTreeMap<u32, u64>) {
        let merged = {
            let mut state = self.state.lock().await;
            state.fee_estimates.insert(server.clone(), estimates);
            self.merged_fee_estimates(&state)
        };
        self.emit(NetworkEvent::FeeEstimatesUpdated {
            estimates: merged,
        });
    }

    async fn tip_processed(&self, server: &ServerAddr, updated: bool) {
        if updated {
            let (_, best_height) = self.registry.best_chain().await;
            self.emit(NetworkEvent::BlockchainUpdated {
                server: server.clone(),
                best_height,
            });
        }
        self.switch_lagging_main().await;
    }

    async fn connection_down(&self, server: &ServerAddr) {
        {
            let mut state = self.state.lock().await;
            state.connections.remove(server);
            state.buckets.remove(server);
            state.fee_estimates.remove(server);
        }
        self.emit(NetworkEvent::ServerDisconnected {
            server: server.clone(),
        });
        self.emit_status().await;
    }
}
