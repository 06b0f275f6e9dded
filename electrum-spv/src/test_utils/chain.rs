use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, Network, TxMerkleNode};

use crate::chain::{Checkpoint, CheckpointManager, Header, NetworkParams};

impl Header {
    /// A regtest-difficulty header; `nonce` tells siblings at the same height apart.
    pub fn dummy(height: u32, prev_blockhash: BlockHash, nonce: u32) -> Header {
        let inner = BlockHeader {
            version: Version::ONE,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000 + height,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce,
        };
        Header::new(height, inner)
    }

    pub fn dummy_genesis() -> Header {
        Header::dummy(0, BlockHash::all_zeros(), 0)
    }

    /// `first` followed by `count` headers extending it.
    pub fn dummy_chain(first: Header, count: u32) -> Vec<Header> {
        let mut headers = Vec::with_capacity(count as usize + 1);
        headers.push(first);
        let mut tip = first;
        for _ in 0..count {
            let height = tip.height() + 1;
            tip = Header::dummy(height, tip.block_hash(), height);
            headers.push(tip);
        }
        headers
    }
}

impl NetworkParams {
    /// Regtest parameters whose only checkpoint is `genesis`.
    pub fn dummy(genesis: BlockHash) -> NetworkParams {
        let checkpoints = CheckpointManager::new_with_checkpoints(vec![Checkpoint::new(0, genesis)]);
        NetworkParams::with_checkpoints(Network::Regtest, checkpoints)
    }

    pub fn dummy_with_checkpoint(genesis: BlockHash, checkpoint: Header) -> NetworkParams {
        let checkpoints = CheckpointManager::new_with_checkpoints(vec![
            Checkpoint::new(0, genesis),
            Checkpoint::new(checkpoint.height(), checkpoint.block_hash()),
        ]);
        NetworkParams::with_checkpoints(Network::Regtest, checkpoints)
    }
}
