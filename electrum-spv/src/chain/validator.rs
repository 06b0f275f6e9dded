//! The chain operations the sync engine relies on.

use super::header::Header;
use super::header_chain::ChainId;
use super::registry::Chains;
use crate::error::ChainResult;

/// Chain membership, linkage and mutation as seen by the sync engine.
///
/// [`Chains`] is the production implementation. The engine only ever calls these
/// while holding the registry lock, so implementations need no interior locking.
pub trait HeaderValidator: Send {
    /// Chain already holding this exact header.
    fn check_header(&self, header: &Header) -> Option<ChainId>;

    /// Whether `chain` holds this exact header.
    fn chain_contains(&self, chain: ChainId, header: &Header) -> bool;

    /// Chain whose tip this header directly extends.
    fn can_connect(&self, header: &Header) -> Option<ChainId>;

    /// Whether `header` links onto `chain` at its height, optionally requiring it
    /// to extend the tip.
    fn can_connect_to(&self, chain: ChainId, header: &Header, check_height: bool) -> bool;

    fn chain_height(&self, chain: ChainId) -> Option<u32>;

    /// Highest height over all known chains, `None` when unknown.
    fn max_known_height(&self) -> Option<u32>;

    fn best_chain(&self) -> ChainId;

    fn save_header(&mut self, chain: ChainId, header: Header) -> ChainResult<()>;

    fn connect_chunk(&mut self, chain: ChainId, start_height: u32, headers: &[Header]) -> ChainResult<bool>;

    fn fork(&mut self, parent: ChainId, header: Header) -> ChainResult<ChainId>;
}

impl HeaderValidator for Chains {
    fn check_header(&self, header: &Header) -> Option<ChainId> {
        Chains::check_header(self, header)
    }

    fn chain_contains(&self, chain: ChainId, header: &Header) -> bool {
        Chains::chain_contains(self, chain, header)
    }

    fn can_connect(&self, header: &Header) -> Option<ChainId> {
        Chains::can_connect(self, header)
    }

    fn can_connect_to(&self, chain: ChainId, header: &Header, check_height: bool) -> bool {
        Chains::can_connect_to(self, chain, header, check_height)
    }

    fn chain_height(&self, chain: ChainId) -> Option<u32> {
        self.height_of(chain)
    }

    fn max_known_height(&self) -> Option<u32> {
        Some(self.max_height())
    }

    fn best_chain(&self) -> ChainId {
        self.best_id()
    }

    fn save_header(&mut self, chain: ChainId, header: Header) -> ChainResult<()> {
        Chains::save_header(self, chain, header)
    }

    fn connect_chunk(&mut self, chain: ChainId, start_height: u32, headers: &[Header]) -> ChainResult<bool> {
        Chains::connect_chunk(self, chain, start_height, headers)
    }

    fn fork(&mut self, parent: ChainId, header: Header) -> ChainResult<ChainId> {
        Chains::fork(self, parent, header)
    }
}
