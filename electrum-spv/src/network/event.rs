//! Events emitted by the connection pool.

use std::collections::BTreeMap;

use super::server_addr::ServerAddr;

/// Changes in pool state that observers may react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A connection became ready.
    ServerConnected {
        server: ServerAddr,
    },

    ServerDisconnected {
        server: ServerAddr,
    },

    /// A connection processed a new tip.
    BlockchainUpdated {
        server: ServerAddr,
        /// Height of the best chain after the update.
        best_height: u32,
    },

    /// Merged fee estimates in sat/kB keyed by confirmation target.
    FeeEstimatesUpdated {
        estimates: BTreeMap<u32, u64>,
    },

    MainServerChanged {
        server: ServerAddr,
    },

    /// Summary of the pool after any connect or disconnect.
    StatusUpdated {
        connected_count: usize,
        main_server: Option<ServerAddr>,
        best_height: u32,
    },
}

impl NetworkEvent {
    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            NetworkEvent::ServerConnected {
                server,
            } => format!("ServerConnected({})", server),
            NetworkEvent::ServerDisconnected {
                server,
            } => format!("ServerDisconnected({})", server),
            NetworkEvent::BlockchainUpdated {
                server,
                best_height,
            } => format!("BlockchainUpdated({}, best_height={})", server, best_height),
            NetworkEvent::FeeEstimatesUpdated {
                estimates,
            } => format!("FeeEstimatesUpdated(targets={})", estimates.len()),
            NetworkEvent::MainServerChanged {
                server,
            } => format!("MainServerChanged({})", server),
            NetworkEvent::StatusUpdated {
                connected_count,
                main_server,
                best_height,
            } => format!(
                "StatusUpdated(connected={}, main={}, best_height={})",
                connected_count,
                main_server.as_ref().map(ToString::to_string).unwrap_or_else(|| "none".to_string()),
                best_height
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_description() {
        let server: ServerAddr = "electrum.example.org:50002:s".parse().unwrap();
        let event = NetworkEvent::BlockchainUpdated {
            server: server.clone(),
            best_height: 840_000,
        };
        assert!(event.description().contains("BlockchainUpdated"));
        assert!(event.description().contains("840000"));

        let status = NetworkEvent::StatusUpdated {
            connected_count: 3,
            main_server: None,
            best_height: 7,
        };
        assert_eq!(status.description(), "StatusUpdated(connected=3, main=none, best_height=7)");
    }
}
