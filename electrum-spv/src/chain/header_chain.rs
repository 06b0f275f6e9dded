//! A single candidate chain of headers.

use std::fmt;

use bitcoin::BlockHash;

use super::checkpoints::Checkpoint;
use super::header::Header;
use crate::error::{ChainError, ChainResult};

/// Identifies a chain by the hash of the first header it owns.
///
/// The main chain is identified by the genesis hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(BlockHash);

impl ChainId {
    pub fn new(hash: BlockHash) -> Self {
        Self(hash)
    }

    pub fn hash(&self) -> BlockHash {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.to_string();
        // leading zeros carry no information for block hashes
        let trimmed = hex.trim_start_matches('0');
        write!(f, "{}", &trimmed[..trimmed.len().min(12)])
    }
}

/// One candidate chain.
///
/// A chain stores headers contiguously from `start` onward. Heights below `start`
/// belong to the parent chain, except for the main chain, which instead trusts its
/// `anchor` checkpoint: it knows the anchor's hash without holding the header itself.
#[derive(Debug, Clone)]
pub struct HeaderChain {
    id: ChainId,
    parent: Option<ChainId>,
    forkpoint: u32,
    anchor: Option<Checkpoint>,
    headers: Vec<Header>,
}

impl HeaderChain {
    /// The main chain, anchored at the highest checkpoint.
    pub fn new_main(genesis: BlockHash, anchor: Checkpoint) -> Self {
        Self {
            id: ChainId(genesis),
            parent: None,
            forkpoint: 0,
            anchor: Some(anchor),
            headers: Vec::new(),
        }
    }

    /// A fork of `parent` whose first header is `first`.
    pub fn new_fork(parent: ChainId, first: Header) -> Self {
        Self {
            id: ChainId(first.block_hash()),
            parent: Some(parent),
            forkpoint: first.height(),
            anchor: None,
            headers: vec![first],
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn parent(&self) -> Option<ChainId> {
        self.parent
    }

    pub fn forkpoint(&self) -> u32 {
        self.forkpoint
    }

    pub fn anchor(&self) -> Option<&Checkpoint> {
        self.anchor.as_ref()
    }

    pub fn is_main(&self) -> bool {
        self.parent.is_none()
    }

    /// First height whose header is stored by this chain.
    pub fn start(&self) -> u32 {
        match self.anchor {
            Some(anchor) => anchor.height + 1,
            None => self.forkpoint,
        }
    }

    /// Height of the last known header.
    pub fn height(&self) -> u32 {
        (self.start() + self.headers.len() as u32).saturating_sub(1)
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn tip(&self) -> Option<&Header> {
        self.headers.last()
    }

    /// Header stored by this chain itself (never the parent's).
    pub fn own_header(&self, height: u32) -> Option<&Header> {
        let index = height.checked_sub(self.start())?;
        self.headers.get(index as usize)
    }

    /// Hash known by this chain itself: stored headers plus the anchor.
    pub fn own_hash(&self, height: u32) -> Option<BlockHash> {
        if let Some(header) = self.own_header(height) {
            return Some(header.block_hash());
        }
        self.anchor.filter(|anchor| anchor.height == height).map(|anchor| anchor.hash)
    }

    /// Whether `height` must be resolved through the parent chain.
    pub(crate) fn delegates(&self, height: u32) -> bool {
        self.parent.is_some() && height < self.forkpoint
    }

    /// Append the next header. Linkage against the predecessor is the caller's
    /// job when this chain holds no predecessor itself.
    pub(crate) fn push(&mut self, header: Header) -> ChainResult<()> {
        if header.height() != self.start() + self.headers.len() as u32 {
            return Err(ChainError::DoesNotConnect {
                height: header.height(),
            });
        }
        if let Some(tip) = self.headers.last() {
            if !header.extends(tip) {
                return Err(ChainError::DoesNotConnect {
                    height: header.height(),
                });
            }
        }
        self.headers.push(header);
        Ok(())
    }

    /// Drop every header above `height`. The main chain never gives up its anchor
    /// and a fork never gives up its first header.
    pub(crate) fn truncate(&mut self, height: u32) -> ChainResult<()> {
        let floor = match self.anchor {
            Some(anchor) => anchor.height,
            None => self.forkpoint,
        };
        if height < floor {
            return Err(ChainError::TruncateBelowStart {
                height,
                floor,
            });
        }
        self.headers.truncate((height + 1 - self.start()) as usize);
        Ok(())
    }

    /// Every stored header extends its predecessor.
    pub fn verify_linkage(&self) -> bool {
        let anchored = match (self.anchor, self.headers.first()) {
            (Some(anchor), Some(first)) => first.prev_blockhash() == anchor.hash,
            _ => true,
        };
        anchored && self.headers.windows(2).all(|pair| pair[1].extends(&pair[0]))
    }
}
