use crate::chain::{ChainId, Header, HeaderValidator};
use crate::error::ChainResult;

type Predicate = Box<dyn Fn(&Header) -> bool + Send>;

/// A [`HeaderValidator`] whose answers come from closures, recording every mutation.
///
/// By default nothing checks or connects, `can_connect_to` accepts everything and
/// chunks connect.
pub struct ScriptedValidator {
    chain: ChainId,
    height: u32,
    check: Predicate,
    connect: Predicate,
    connect_to: Predicate,
    chunk_result: bool,
    pub saved: Vec<Header>,
    pub forked: Vec<Header>,
    pub chunk_calls: Vec<(u32, usize)>,
}

impl ScriptedValidator {
    pub fn new(chain: ChainId, height: u32) -> Self {
        Self {
            chain,
            height,
            check: Box::new(|_| false),
            connect: Box::new(|_| false),
            connect_to: Box::new(|_| true),
            chunk_result: true,
            saved: Vec::new(),
            forked: Vec::new(),
            chunk_calls: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: impl Fn(&Header) -> bool + Send + 'static) -> Self {
        self.check = Box::new(check);
        self
    }

    pub fn with_connect(mut self, connect: impl Fn(&Header) -> bool + Send + 'static) -> Self {
        self.connect = Box::new(connect);
        self
    }

    pub fn with_connect_to(mut self, connect_to: impl Fn(&Header) -> bool + Send + 'static) -> Self {
        self.connect_to = Box::new(connect_to);
        self
    }

    pub fn with_chunk_result(mut self, connects: bool) -> Self {
        self.chunk_result = connects;
        self
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl HeaderValidator for ScriptedValidator {
    fn check_header(&self, header: &Header) -> Option<ChainId> {
        (self.check)(header).then_some(self.chain)
    }

    fn chain_contains(&self, chain: ChainId, header: &Header) -> bool {
        chain == self.chain && (self.check)(header)
    }

    fn can_connect(&self, header: &Header) -> Option<ChainId> {
        (self.connect)(header).then_some(self.chain)
    }

    fn can_connect_to(&self, _chain: ChainId, header: &Header, _check_height: bool) -> bool {
        (self.connect_to)(header)
    }

    fn chain_height(&self, chain: ChainId) -> Option<u32> {
        if chain == self.chain {
            return Some(self.height);
        }
        self.forked.iter().find(|header| ChainId::new(header.block_hash()) == chain).map(Header::height)
    }

    fn max_known_height(&self) -> Option<u32> {
        None
    }

    fn best_chain(&self) -> ChainId {
        self.chain
    }

    fn save_header(&mut self, _chain: ChainId, header: Header) -> ChainResult<()> {
        self.height = header.height();
        self.saved.push(header);
        Ok(())
    }

    fn connect_chunk(&mut self, _chain: ChainId, start_height: u32, headers: &[Header]) -> ChainResult<bool> {
        self.chunk_calls.push((start_height, headers.len()));
        if self.chunk_result && !headers.is_empty() {
            self.height = self.height.max(start_height + headers.len() as u32 - 1);
        }
        Ok(self.chunk_result)
    }

    fn fork(&mut self, _parent: ChainId, header: Header) -> ChainResult<ChainId> {
        self.forked.push(header);
        Ok(ChainId::new(header.block_hash()))
    }
}
