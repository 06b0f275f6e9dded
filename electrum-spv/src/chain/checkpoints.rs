//! Checkpoints are hardcoded block hashes below which history cannot be rewritten.

use std::str::FromStr;

use bitcoin::constants::genesis_block;
use bitcoin::{BlockHash, Network};

const MAINNET_CHECKPOINTS: &[(u32, &str)] = &[
    (11111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    (33333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    (74000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    (105000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    (134444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
    (168000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
    (193000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
    (210000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
    (216116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
    (225430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
    (250000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
    (279000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
    (295000, "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
];

const TESTNET_CHECKPOINTS: &[(u32, &str)] =
    &[(546, "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70")];

fn checkpoint_table(network: Network) -> &'static [(u32, &'static str)] {
    match network {
        Network::Bitcoin => MAINNET_CHECKPOINTS,
        Network::Testnet => TESTNET_CHECKPOINTS,
        // Signet and regtest only pin their genesis block
        _ => &[],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

impl Checkpoint {
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self {
            height,
            hash,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    // sorted by height, genesis first
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(network: Network) -> Self {
        let genesis = Checkpoint::new(0, genesis_block(network).block_hash());
        let table = checkpoint_table(network);

        let mut checkpoints = Vec::with_capacity(table.len() + 1);
        checkpoints.push(genesis);
        checkpoints.extend(table.iter().filter_map(|(height, hash)| {
            BlockHash::from_str(hash).ok().map(|hash| Checkpoint::new(*height, hash))
        }));
        debug_assert_eq!(checkpoints.len(), table.len() + 1, "hardcoded checkpoint hash failed to parse");

        Self::new_with_checkpoints(checkpoints)
    }

    /// The input must start at genesis and be sorted by height.
    pub fn new_with_checkpoints(checkpoints: Vec<Checkpoint>) -> Self {
        debug_assert!(!checkpoints.is_empty(), "Checkpoints must contain, at least, genesis");
        debug_assert_eq!(checkpoints[0].height, 0, "The first checkpoint must be at height 0");
        debug_assert!(
            checkpoints.windows(2).all(|pair| pair[0].height < pair[1].height),
            "The checkpoints must be sorted by height in ascending order"
        );

        Self {
            checkpoints,
        }
    }

    pub fn genesis(&self) -> &Checkpoint {
        &self.checkpoints[0]
    }

    /// Highest checkpoint; nothing at or below it may be replaced.
    pub fn max_checkpoint(&self) -> &Checkpoint {
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    pub fn hash_at(&self, height: u32) -> Option<BlockHash> {
        self.checkpoints
            .binary_search_by_key(&height, |checkpoint| checkpoint.height)
            .ok()
            .map(|index| self.checkpoints[index].hash)
    }

    /// Whether `hash` is acceptable at `height`. Heights without a checkpoint accept anything.
    pub fn allows(&self, height: u32, hash: &BlockHash) -> bool {
        self.hash_at(height).map_or(true, |expected| expected == *hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }
}

/// Network-wide constants the sync core depends on.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    pub checkpoints: CheckpointManager,
}

impl NetworkParams {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            checkpoints: CheckpointManager::new(network),
        }
    }

    pub fn with_checkpoints(network: Network, checkpoints: CheckpointManager) -> Self {
        Self {
            network,
            checkpoints,
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.checkpoints.genesis().hash
    }

    pub fn max_checkpoint(&self) -> u32 {
        self.checkpoints.max_checkpoint().height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::from_byte_array([byte; 32])
    }

    fn manager() -> CheckpointManager {
        CheckpointManager::new_with_checkpoints(vec![
            Checkpoint::new(0, hash(0)),
            Checkpoint::new(100, hash(1)),
            Checkpoint::new(500, hash(2)),
        ])
    }

    #[test]
    fn test_allows_only_matching_hash_at_checkpoint() {
        let manager = manager();
        assert!(manager.allows(100, &hash(1)));
        assert!(!manager.allows(100, &hash(9)));
        assert!(manager.allows(101, &hash(9)));
        assert_eq!(manager.max_checkpoint().height, 500);
    }

    #[test]
    fn test_network_tables_are_sorted_and_start_at_genesis() {
        for network in [Network::Bitcoin, Network::Testnet, Network::Signet, Network::Regtest] {
            let params = NetworkParams::new(network);
            assert_eq!(params.genesis_hash(), genesis_block(network).block_hash());
            let heights: Vec<u32> = params.checkpoints.iter().map(|cp| cp.height).collect();
            assert_eq!(heights[0], 0);
            assert!(heights.windows(2).all(|pair| pair[0] < pair[1]));
        }
        assert_eq!(NetworkParams::new(Network::Bitcoin).max_checkpoint(), 295000);
        assert_eq!(NetworkParams::new(Network::Regtest).max_checkpoint(), 0);
    }
}
