//! Configuration for the Electrum SPV client.

use std::path::PathBuf;

use bitcoin::Network;

use crate::network::constants::{FEE_ETA_TARGETS, FORK_PRUNE_DEPTH, MAX_SERVERS_PER_BUCKET, NUM_TARGET_CONNECTED_SERVERS};
use crate::network::{ConnectionSettings, Protocol, ServerAddr, TimeoutLevel, Timeouts};

/// Configuration for the Electrum SPV client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Network to follow.
    pub network: Network,

    /// Root for certificate pins and header files. Defaults to ./electrum-spv-data
    pub data_dir: PathBuf,

    /// Candidate servers the pool picks connections from.
    pub servers: Vec<ServerAddr>,

    /// Server that wallet queries are routed through. Picked at random when unset.
    pub main_server: Option<ServerAddr>,

    /// Expected SHA-256 fingerprint of the main server's certificate, hex encoded.
    pub server_fingerprint: Option<String>,

    /// Let the pool switch the main server to one following the best chain.
    pub auto_connect: bool,

    /// Connect to the main server only.
    pub one_server: bool,

    pub timeout_level: TimeoutLevel,

    /// Connections the pool tries to keep open.
    pub num_target_connected: usize,

    /// Connected servers allowed per network bucket, main server excluded.
    pub max_servers_per_bucket: usize,

    /// Confirmation targets, in blocks, to poll fee estimates for.
    pub fee_eta_targets: Vec<u32>,

    /// Name sent in the version handshake.
    pub client_name: String,

    /// Log every request and response line at debug level.
    pub debug_rpc: bool,

    /// Load and save headers under `data_dir`. Chains are memory-only otherwise.
    pub persist_headers: bool,

    /// Forks more than this many blocks below the best tip are dropped.
    pub fork_prune_depth: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            data_dir: PathBuf::from("./electrum-spv-data"),
            servers: Vec::new(),
            main_server: None,
            server_fingerprint: None,
            auto_connect: true,
            one_server: false,
            timeout_level: TimeoutLevel::Normal,
            num_target_connected: NUM_TARGET_CONNECTED_SERVERS,
            max_servers_per_bucket: MAX_SERVERS_PER_BUCKET,
            fee_eta_targets: FEE_ETA_TARGETS.to_vec(),
            client_name: format!("electrum-spv/{}", crate::VERSION),
            debug_rpc: false,
            persist_headers: true,
            fork_prune_depth: FORK_PRUNE_DEPTH,
        }
    }
}

impl ClientConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn mainnet() -> Self {
        Self::new(Network::Bitcoin)
    }

    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    pub fn regtest() -> Self {
        Self::new(Network::Regtest)
    }

    pub fn add_server(&mut self, server: ServerAddr) -> &mut Self {
        self.servers.push(server);
        self
    }

    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    pub fn with_servers(mut self, servers: Vec<ServerAddr>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_main_server(mut self, server: ServerAddr) -> Self {
        self.main_server = Some(server);
        self
    }

    pub fn with_server_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.server_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Only keep the main server connected. Also disables auto-connect.
    pub fn with_one_server(mut self, one_server: bool) -> Self {
        self.one_server = one_server;
        if one_server {
            self.auto_connect = false;
        }
        self
    }

    pub fn with_timeout_level(mut self, level: TimeoutLevel) -> Self {
        self.timeout_level = level;
        self
    }

    pub fn with_num_target_connected(mut self, count: usize) -> Self {
        self.num_target_connected = count;
        self
    }

    pub fn with_max_servers_per_bucket(mut self, count: usize) -> Self {
        self.max_servers_per_bucket = count;
        self
    }

    pub fn with_fee_eta_targets(mut self, targets: Vec<u32>) -> Self {
        self.fee_eta_targets = targets;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_debug_rpc(mut self, enabled: bool) -> Self {
        self.debug_rpc = enabled;
        self
    }

    pub fn with_persist_headers(mut self, enabled: bool) -> Self {
        self.persist_headers = enabled;
        self
    }

    pub fn with_fork_prune_depth(mut self, depth: u32) -> Self {
        self.fork_prune_depth = depth;
        self
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    pub fn headers_dir(&self) -> PathBuf {
        self.data_dir.join("headers")
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::for_level(self.timeout_level)
    }

    /// Number of connections the pool maintains.
    pub fn target_connections(&self) -> usize {
        if self.one_server {
            1
        } else {
            self.num_target_connected
        }
    }

    /// Connection settings for `server`; the fingerprint only applies to the main server.
    pub fn connection_settings(&self, server: &ServerAddr) -> ConnectionSettings {
        let is_main = self.main_server.as_ref() == Some(server);
        ConnectionSettings {
            client_name: self.client_name.clone(),
            timeouts: self.timeouts(),
            certs_dir: self.certs_dir(),
            expected_fingerprint: if is_main {
                self.server_fingerprint.clone()
            } else {
                None
            },
            fee_eta_targets: self.fee_eta_targets.clone(),
            debug_rpc: self.debug_rpc,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_target_connected == 0 {
            return Err("num_target_connected must be > 0".to_string());
        }

        if self.fee_eta_targets.is_empty() {
            return Err("fee_eta_targets must not be empty".to_string());
        }

        if let Some(fingerprint) = &self.server_fingerprint {
            if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("server_fingerprint must be 64 hex characters".to_string());
            }
            match &self.main_server {
                Some(server) if server.protocol() == Protocol::Tls => {}
                _ => {
                    return Err("server_fingerprint requires a main_server using TLS".to_string());
                }
            }
        }

        if self.main_server.is_none() && self.servers.is_empty() {
            return Err("at least one server must be configured".to_string());
        }

        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            format!("A valid data directory must be provided to the ClientConfig {:?}: {e}", self.data_dir)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_server() -> ServerAddr {
        "electrum.example.org:50002:s".parse().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.network, Network::Bitcoin);
        assert_eq!(config.fee_eta_targets, vec![25, 10, 5, 2]);
        assert_eq!(config.max_servers_per_bucket, 1);
        assert!(config.auto_connect);
        assert!(config.client_name.starts_with("electrum-spv/"));
    }

    #[test]
    fn test_one_server_targets_single_connection() {
        let config = ClientConfig::regtest().with_num_target_connected(8).with_one_server(true);
        assert_eq!(config.target_connections(), 1);
        assert!(!config.auto_connect);
    }

    #[test]
    fn test_fingerprint_only_for_main_server() {
        let other: ServerAddr = "other.example.org:50002:s".parse().unwrap();
        let config = ClientConfig::mainnet().with_main_server(tls_server()).with_server_fingerprint("ab".repeat(32));
        assert_eq!(config.connection_settings(&tls_server()).expected_fingerprint, Some("ab".repeat(32)));
        assert_eq!(config.connection_settings(&other).expected_fingerprint, None);
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = ClientConfig::regtest().with_data_dir(dir.path()).with_main_server(tls_server());
        assert!(base.validate().is_ok());

        assert!(base.clone().with_num_target_connected(0).validate().is_err());
        assert!(base.clone().with_fee_eta_targets(vec![]).validate().is_err());
        assert!(base.clone().with_server_fingerprint("xyz").validate().is_err());
        assert!(base.clone().with_server_fingerprint("AB".repeat(32)).validate().is_ok());

        let plaintext: ServerAddr = "electrum.example.org:50001:t".parse().unwrap();
        let tcp_main = ClientConfig::regtest()
            .with_data_dir(dir.path())
            .with_main_server(plaintext)
            .with_server_fingerprint("ab".repeat(32));
        assert!(tcp_main.validate().is_err());

        assert!(ClientConfig::regtest().with_data_dir(dir.path()).validate().is_err());
    }
}
