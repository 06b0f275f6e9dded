//! Block headers as served by Electrum servers.
//!
//! Servers hand out headers as hex-encoded 80-byte consensus records. A [`Header`]
//! pairs the decoded record with the height it was requested at and caches its hash,
//! so linkage checks never recompute double-SHA256.

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::BlockHash;

use crate::error::HeaderDecodeError;

/// Size of one serialized header in bytes.
pub const HEADER_SIZE: usize = 80;

/// An immutable block header at a known height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    height: u32,
    inner: BlockHeader,
    hash: BlockHash,
}

impl Header {
    pub fn new(height: u32, inner: BlockHeader) -> Self {
        Self {
            height,
            hash: inner.block_hash(),
            inner,
        }
    }

    /// Decode a single 80-byte record.
    pub fn from_bytes(bytes: &[u8], height: u32) -> Result<Self, HeaderDecodeError> {
        if bytes.len() != HEADER_SIZE {
            return Err(HeaderDecodeError::Length(bytes.len()));
        }
        let inner: BlockHeader = deserialize(bytes)?;
        Ok(Self::new(height, inner))
    }

    /// Decode a single hex-encoded header.
    pub fn from_hex(hex_str: &str, height: u32) -> Result<Self, HeaderDecodeError> {
        let bytes = hex::decode(hex_str)?;
        Self::from_bytes(&bytes, height)
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn block_hash(&self) -> BlockHash {
        self.hash
    }

    pub fn prev_blockhash(&self) -> BlockHash {
        self.inner.prev_blockhash
    }

    pub fn inner(&self) -> &BlockHeader {
        &self.inner
    }

    /// Whether `self` directly extends `parent`.
    pub fn extends(&self, parent: &Header) -> bool {
        parent.height.checked_add(1) == Some(self.height) && self.prev_blockhash() == parent.hash
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(&self.inner)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Decode a run of concatenated headers starting at `start_height`.
pub fn headers_from_bytes(bytes: &[u8], start_height: u32) -> Result<Vec<Header>, HeaderDecodeError> {
    if bytes.len() % HEADER_SIZE != 0 {
        return Err(HeaderDecodeError::Length(bytes.len()));
    }
    bytes
        .chunks_exact(HEADER_SIZE)
        .zip(start_height..)
        .map(|(record, height)| Header::from_bytes(record, height))
        .collect()
}

/// Decode the `hex` field of a `blockchain.block.headers` response.
pub fn headers_from_hex(hex_str: &str, start_height: u32) -> Result<Vec<Header>, HeaderDecodeError> {
    let bytes = hex::decode(hex_str)?;
    headers_from_bytes(&bytes, start_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn test_hex_round_trip_keeps_hash() {
        let header = Header::dummy(7, BlockHash::from_byte_array([3; 32]), 42);
        let decoded = Header::from_hex(&header.to_hex(), 7).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.block_hash(), header.inner().block_hash());
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(matches!(Header::from_bytes(&[0u8; 79], 0), Err(HeaderDecodeError::Length(79))));
        assert!(matches!(Header::from_hex("zz", 0), Err(HeaderDecodeError::Hex(_))));
        assert!(matches!(headers_from_bytes(&[0u8; 81], 0), Err(HeaderDecodeError::Length(81))));
    }

    #[test]
    fn test_headers_from_hex_assigns_heights_and_links() {
        let chain = Header::dummy_chain(Header::dummy_genesis(), 5);
        let hex: String = chain[1..].iter().map(Header::to_hex).collect();

        let decoded = headers_from_hex(&hex, 1).unwrap();
        assert_eq!(decoded.len(), 5);
        for (i, header) in decoded.iter().enumerate() {
            assert_eq!(header.height(), i as u32 + 1);
        }
        assert!(decoded[0].extends(&chain[0]));
        assert!(decoded.windows(2).all(|pair| pair[1].extends(&pair[0])));
    }
}
