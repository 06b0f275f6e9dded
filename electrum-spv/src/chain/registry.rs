//! The process-wide set of known header chains.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bitcoin::BlockHash;
use tokio::sync::{Mutex, MutexGuard};

use super::checkpoints::NetworkParams;
use super::header::{headers_from_bytes, Header};
use super::header_chain::{ChainId, HeaderChain};
use super::store::{HeaderStore, StoreWriter};
use crate::error::{ChainError, ChainResult};

/// Chain tree state. Only reachable through [`ChainRegistry::lock`].
#[derive(Debug)]
pub struct Chains {
    params: Arc<NetworkParams>,
    chains: HashMap<ChainId, HeaderChain>,
    main: ChainId,
    best: ChainId,
    store: Option<StoreWriter>,
}

impl Chains {
    pub fn new(params: Arc<NetworkParams>) -> Self {
        let main = HeaderChain::new_main(params.genesis_hash(), *params.checkpoints.max_checkpoint());
        let main_id = main.id();
        Self {
            params,
            chains: HashMap::from([(main_id, main)]),
            main: main_id,
            best: main_id,
            store: None,
        }
    }

    /// Rebuild the chain tree from `store`. Blocking.
    fn restore(params: Arc<NetworkParams>, store: &HeaderStore) -> ChainResult<Self> {
        let mut chains = Self::new(params);

        let main_start = chains.main().start();
        let bytes = store.load_main(main_start)?;
        let records = bytes.len() / super::header::HEADER_SIZE;
        let headers = headers_from_bytes(&bytes[..records * super::header::HEADER_SIZE], main_start)
            .map_err(|e| ChainError::Storage(format!("corrupted main chain file: {}", e)))?;
        let loaded = chains.restore_headers(chains.main, headers);
        tracing::info!("Loaded {} main chain headers from {}", loaded, store.dir().display());

        for fork in store.load_forks()? {
            let usable = fork.bytes.len() / super::header::HEADER_SIZE * super::header::HEADER_SIZE;
            let headers = match headers_from_bytes(&fork.bytes[..usable], fork.forkpoint) {
                Ok(headers) if !headers.is_empty() => headers,
                _ => {
                    tracing::warn!("Skipping unreadable fork file at {}", fork.forkpoint);
                    continue;
                }
            };
            if headers[0].block_hash() != fork.id.hash() || !chains.chains.contains_key(&fork.parent) {
                tracing::warn!("Skipping inconsistent fork {} at {}", fork.id, fork.forkpoint);
                continue;
            }
            match chains.insert_fork(fork.parent, headers[0]) {
                Ok(id) => {
                    chains.restore_headers(id, headers[1..].to_vec());
                }
                Err(e) => tracing::warn!("Skipping fork {}: {}", fork.id, e),
            }
        }

        chains.refresh_best();
        Ok(chains)
    }

    /// Append headers read from disk, stopping at the first one that does not connect.
    fn restore_headers(&mut self, id: ChainId, headers: Vec<Header>) -> usize {
        let mut restored = 0;
        for header in headers {
            if !self.can_connect_to(id, &header, true) {
                tracing::warn!("Stored header at {} does not connect, truncating", header.height());
                break;
            }
            match self.chains.get_mut(&id).map(|chain| chain.push(header)) {
                Some(Ok(())) => restored += 1,
                _ => break,
            }
        }
        restored
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn get(&self, id: ChainId) -> Option<&HeaderChain> {
        self.chains.get(&id)
    }

    pub fn contains(&self, id: ChainId) -> bool {
        self.chains.contains_key(&id)
    }

    pub fn main(&self) -> &HeaderChain {
        &self.chains[&self.main]
    }

    pub fn main_id(&self) -> ChainId {
        self.main
    }

    pub fn best_id(&self) -> ChainId {
        self.best
    }

    pub fn best(&self) -> &HeaderChain {
        &self.chains[&self.best]
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderChain> {
        self.chains.values()
    }

    /// Chain ids in lookup order: main first, then by forkpoint.
    fn ordered_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<&HeaderChain> = self.chains.values().collect();
        ids.sort_by_key(|chain| (!chain.is_main(), chain.forkpoint(), chain.id()));
        ids.into_iter().map(HeaderChain::id).collect()
    }

    pub fn height_of(&self, id: ChainId) -> Option<u32> {
        self.chains.get(&id).map(HeaderChain::height)
    }

    /// Highest height over all chains.
    pub fn max_height(&self) -> u32 {
        self.chains.values().map(HeaderChain::height).max().unwrap_or(0)
    }

    /// Resolve `height` on chain `id`, walking up to parents as needed.
    fn resolve(&self, id: ChainId, height: u32) -> Option<&HeaderChain> {
        let mut chain = self.chains.get(&id)?;
        if height > chain.height() {
            return None;
        }
        while chain.delegates(height) {
            chain = self.chains.get(&chain.parent()?)?;
        }
        Some(chain)
    }

    pub fn header_at(&self, id: ChainId, height: u32) -> Option<Header> {
        self.resolve(id, height)?.own_header(height).copied()
    }

    pub fn hash_at(&self, id: ChainId, height: u32) -> Option<BlockHash> {
        self.resolve(id, height)?.own_hash(height)
    }

    /// Whether chain `id` holds exactly this header.
    pub fn chain_contains(&self, id: ChainId, header: &Header) -> bool {
        self.hash_at(id, header.height()) == Some(header.block_hash())
    }

    /// First chain holding this header, if any.
    pub fn check_header(&self, header: &Header) -> Option<ChainId> {
        self.ordered_ids().into_iter().find(|id| self.chain_contains(*id, header))
    }

    /// Whether `header` links onto chain `id` at `header.height() - 1`.
    ///
    /// With `check_height` the header must also extend the chain's tip.
    pub fn can_connect_to(&self, id: ChainId, header: &Header, check_height: bool) -> bool {
        let Some(chain) = self.chains.get(&id) else {
            return false;
        };
        let height = header.height();
        if check_height && chain.height().checked_add(1) != Some(height) {
            return false;
        }
        if !self.params.checkpoints.allows(height, &header.block_hash()) {
            return false;
        }
        if height == 0 {
            return header.block_hash() == self.params.genesis_hash();
        }
        self.hash_at(id, height - 1) == Some(header.prev_blockhash())
    }

    /// First chain whose tip this header extends.
    pub fn can_connect(&self, header: &Header) -> Option<ChainId> {
        self.ordered_ids().into_iter().find(|id| self.can_connect_to(*id, header, true))
    }

    /// Append `header` to the tip of chain `id`.
    pub fn save_header(&mut self, id: ChainId, header: Header) -> ChainResult<()> {
        if !self.params.checkpoints.allows(header.height(), &header.block_hash()) {
            return Err(ChainError::CheckpointConflict {
                height: header.height(),
            });
        }
        if !self.chains.contains_key(&id) {
            return Err(ChainError::UnknownChain(id));
        }
        if !self.can_connect_to(id, &header, true) {
            return Err(ChainError::DoesNotConnect {
                height: header.height(),
            });
        }
        let chain = self.chains.get_mut(&id).ok_or(ChainError::UnknownChain(id))?;
        chain.push(header)?;
        self.persist(id, header.height())?;
        self.refresh_best();
        Ok(())
    }

    /// Connect a run of consecutive headers starting at `start_height` to chain `id`.
    ///
    /// Headers the chain already knows must match exactly; only headers past the
    /// chain's tip are stored. Returns `Ok(false)` when the run does not fit the chain.
    pub fn connect_chunk(&mut self, id: ChainId, start_height: u32, headers: &[Header]) -> ChainResult<bool> {
        let chain = self.chains.get(&id).ok_or(ChainError::UnknownChain(id))?;
        let chain_height = chain.height();

        if headers.iter().zip(start_height..).any(|(header, height)| header.height() != height) {
            return Ok(false);
        }
        if !headers.windows(2).all(|pair| pair[1].extends(&pair[0])) {
            return Ok(false);
        }
        if headers.iter().any(|header| !self.params.checkpoints.allows(header.height(), &header.block_hash())) {
            return Ok(false);
        }
        let Some(first) = headers.first() else {
            return Ok(true);
        };

        // Every overlapping height must agree with what the chain already knows,
        // and at least one known hash must anchor the run.
        let mut anchored = start_height == 0 && first.block_hash() == self.params.genesis_hash();
        if start_height > 0 {
            if let Some(prev) = self.hash_at(id, start_height - 1) {
                if prev != first.prev_blockhash() {
                    return Ok(false);
                }
                anchored = true;
            }
        }
        for header in headers.iter().take_while(|header| header.height() <= chain_height) {
            match self.hash_at(id, header.height()) {
                Some(known) if known == header.block_hash() => anchored = true,
                Some(_) => return Ok(false),
                None => {}
            }
        }
        if !anchored {
            return Ok(false);
        }

        let new_headers: Vec<Header> =
            headers.iter().filter(|header| header.height() > chain_height).copied().collect();
        if new_headers.is_empty() {
            return Ok(true);
        }
        // the first new header must follow a known hash
        if self.hash_at(id, new_headers[0].height() - 1) != Some(new_headers[0].prev_blockhash()) {
            return Ok(false);
        }

        let chain = self.chains.get_mut(&id).ok_or(ChainError::UnknownChain(id))?;
        for header in &new_headers {
            chain.push(*header)?;
        }
        self.persist(id, new_headers[0].height())?;
        self.refresh_best();
        Ok(true)
    }

    /// Create a fork of `parent` seeded with `header`.
    ///
    /// Forking at or below the max checkpoint is refused.
    pub fn fork(&mut self, parent: ChainId, header: Header) -> ChainResult<ChainId> {
        let max_checkpoint = self.params.max_checkpoint();
        if header.height() <= max_checkpoint {
            return Err(ChainError::CheckpointConflict {
                height: header.height(),
            });
        }
        let id = self.insert_fork(parent, header)?;
        self.persist(id, header.height())?;
        self.refresh_best();
        Ok(id)
    }

    fn insert_fork(&mut self, parent: ChainId, header: Header) -> ChainResult<ChainId> {
        if !self.chains.contains_key(&parent) {
            return Err(ChainError::UnknownChain(parent));
        }
        if !self.can_connect_to(parent, &header, false) {
            return Err(ChainError::InvalidForkpoint {
                forkpoint: header.height(),
                reason: "forking header does not connect to parent chain".to_string(),
            });
        }
        if self.chain_contains(parent, &header) {
            return Err(ChainError::InvalidForkpoint {
                forkpoint: header.height(),
                reason: "header already belongs to parent chain".to_string(),
            });
        }
        let fork = HeaderChain::new_fork(parent, header);
        let id = fork.id();
        if self.chains.contains_key(&id) {
            return Ok(id);
        }
        tracing::info!("New fork {} off {} at height {}", id, parent, header.height());
        self.chains.insert(id, fork);
        Ok(id)
    }

    /// Drop every header of chain `id` above `height` and rewrite its file.
    ///
    /// Refused while a fork branches off the chain above `height`.
    pub fn truncate(&mut self, id: ChainId, height: u32) -> ChainResult<()> {
        let stranded = self
            .chains
            .values()
            .find(|chain| chain.parent() == Some(id) && chain.forkpoint() > height.saturating_add(1));
        if let Some(child) = stranded {
            return Err(ChainError::InvalidForkpoint {
                forkpoint: child.forkpoint(),
                reason: format!("fork {} branches above height {}", child.id(), height),
            });
        }
        let chain = self.chains.get_mut(&id).ok_or(ChainError::UnknownChain(id))?;
        let previous = chain.height();
        chain.truncate(height)?;
        if chain.height() == previous {
            return Ok(());
        }
        tracing::info!("Truncated chain {} from {} to {}", id, previous, height);
        self.persist(id, height + 1)?;
        if id == self.best {
            self.best = self.main;
        }
        self.refresh_best();
        Ok(())
    }

    fn persist(&self, id: ChainId, from_height: u32) -> ChainResult<()> {
        match (&self.store, self.chains.get(&id)) {
            (Some(store), Some(chain)) => store.write_from(chain, from_height),
            _ => Ok(()),
        }
    }

    /// Tallest chain wins; ties keep the current best.
    fn refresh_best(&mut self) {
        let current = self.height_of(self.best).unwrap_or(0);
        let tallest = self
            .chains
            .values()
            .filter(|chain| chain.height() > current)
            .max_by_key(|chain| (chain.height(), std::cmp::Reverse(chain.forkpoint())));
        if let Some(chain) = tallest {
            tracing::info!("Best chain is now {} at height {}", chain.id(), chain.height());
            self.best = chain.id();
        }
        if !self.chains.contains_key(&self.best) {
            self.best = self.main;
        }
    }

    /// Drop leaf forks lagging more than `depth` blocks behind the best chain.
    ///
    /// The main chain, the best chain and forks with children are never removed.
    pub fn prune_forks(&mut self, depth: u32) -> Vec<ChainId> {
        let best_height = self.best().height();
        let parents: Vec<ChainId> = self.chains.values().filter_map(HeaderChain::parent).collect();
        let doomed: Vec<ChainId> = self
            .chains
            .values()
            .filter(|chain| {
                !chain.is_main()
                    && chain.id() != self.best
                    && !parents.contains(&chain.id())
                    && chain.height().saturating_add(depth) < best_height
            })
            .map(HeaderChain::id)
            .collect();

        for id in &doomed {
            if let Some(chain) = self.chains.remove(id) {
                tracing::info!("Pruning fork {} at height {}", id, chain.height());
                if let Some(store) = &self.store {
                    if let Err(e) = store.remove(&chain) {
                        tracing::warn!("Failed to queue removal of fork file for {}: {}", id, e);
                    }
                }
            }
        }
        doomed
    }
}

/// Shared handle to the chain tree.
///
/// The inner mutex is the single lock serializing every chain mutation across
/// connections; it is a tokio mutex so holders may await network fetches.
#[derive(Debug)]
pub struct ChainRegistry {
    params: Arc<NetworkParams>,
    chains: Mutex<Chains>,
}

impl ChainRegistry {
    /// In-memory registry.
    pub fn new(params: NetworkParams) -> Self {
        let params = Arc::new(params);
        Self {
            chains: Mutex::new(Chains::new(params.clone())),
            params,
        }
    }

    /// Registry persisted under `dir`, restoring previously saved chains.
    pub async fn load(params: NetworkParams, dir: &Path) -> ChainResult<Self> {
        let params = Arc::new(params);
        let dir = dir.to_path_buf();
        let (mut chains, store) = tokio::task::spawn_blocking({
            let params = params.clone();
            move || {
                let store = HeaderStore::open(dir)?;
                let chains = Chains::restore(params, &store)?;
                Ok::<_, ChainError>((chains, store))
            }
        })
        .await
        .map_err(|e| ChainError::Storage(format!("Task join error: {}", e)))??;
        chains.store = Some(store.spawn_writer());

        Ok(Self {
            params,
            chains: Mutex::new(chains),
        })
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Acquire the chain lock.
    pub async fn lock(&self) -> MutexGuard<'_, Chains> {
        self.chains.lock().await
    }

    pub async fn best_chain(&self) -> (ChainId, u32) {
        let chains = self.chains.lock().await;
        (chains.best_id(), chains.best().height())
    }

    pub async fn height_of(&self, id: ChainId) -> Option<u32> {
        self.chains.lock().await.height_of(id)
    }

    /// Wait until every header write queued so far has reached disk.
    pub async fn flush(&self) -> ChainResult<()> {
        let writer = self.chains.lock().await.store.clone();
        match writer {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_with(count: u32) -> (Chains, Vec<Header>) {
        let headers = Header::dummy_chain(Header::dummy_genesis(), count);
        let mut chains = Chains::new(Arc::new(NetworkParams::dummy(headers[0].block_hash())));
        for header in &headers[1..] {
            chains.save_header(chains.main_id(), *header).unwrap();
        }
        (chains, headers)
    }

    #[test]
    fn test_check_and_connect() {
        let (chains, headers) = registry_with(3);
        let main = chains.main_id();

        assert_eq!(chains.check_header(&headers[2]), Some(main));
        assert_eq!(chains.check_header(&Header::dummy(2, headers[1].block_hash(), 77)), None);

        let next = Header::dummy(4, headers[3].block_hash(), 1);
        assert_eq!(chains.can_connect(&next), Some(main));
        // links to height 1 but main is taller
        let sibling = Header::dummy(2, headers[1].block_hash(), 9);
        assert_eq!(chains.can_connect(&sibling), None);
        assert!(chains.can_connect_to(main, &sibling, false));
    }

    #[test]
    fn test_fork_lookups_delegate_to_parent() {
        let (mut chains, headers) = registry_with(3);
        let main = chains.main_id();
        let fork_first = Header::dummy(2, headers[1].block_hash(), 9);

        let fork = chains.fork(main, fork_first).unwrap();
        assert_eq!(chains.get(fork).unwrap().forkpoint(), 2);
        assert_eq!(chains.header_at(fork, 1), Some(headers[1]));
        assert_eq!(chains.header_at(fork, 2), Some(fork_first));
        assert_eq!(chains.header_at(main, 2), Some(headers[2]));
        assert_eq!(chains.check_header(&fork_first), Some(fork));

        // main (height 3) is still best
        assert_eq!(chains.best_id(), main);
        let mut tip = fork_first;
        for nonce in 0..2 {
            tip = Header::dummy(tip.height() + 1, tip.block_hash(), 100 + nonce);
            chains.save_header(fork, tip).unwrap();
        }
        assert_eq!(chains.best_id(), fork);
    }

    #[test]
    fn test_fork_below_max_checkpoint_refused() {
        let headers = Header::dummy_chain(Header::dummy_genesis(), 12);
        let params = NetworkParams::dummy_with_checkpoint(headers[0].block_hash(), headers[10]);
        let mut chains = Chains::new(Arc::new(params));
        let main = chains.main_id();
        assert_eq!(chains.main().height(), 10);

        let conflicting = Header::dummy(10, headers[9].block_hash(), 5);
        assert!(matches!(chains.fork(main, conflicting), Err(ChainError::CheckpointConflict { height: 10 })));
        assert!(matches!(
            chains.save_header(main, conflicting),
            Err(ChainError::CheckpointConflict { height: 10 })
        ));
        assert_eq!(chains.len(), 1);

        chains.save_header(main, headers[11]).unwrap();
        assert_eq!(chains.main().height(), 11);
    }

    #[test]
    fn test_connect_chunk_overlapping_known_headers() {
        let (mut chains, headers) = registry_with(3);
        let main = chains.main_id();
        let more = Header::dummy_chain(headers[3], 4);

        let mut chunk = headers[1..].to_vec();
        chunk.extend_from_slice(&more[1..]);
        assert!(chains.connect_chunk(main, 1, &chunk).unwrap());
        assert_eq!(chains.main().height(), 7);
        assert!(chains.main().verify_linkage());

        // conflicting overlap is refused without mutation
        let rival = Header::dummy_chain(Header::dummy(2, headers[1].block_hash(), 55), 8);
        assert!(!chains.connect_chunk(main, 2, &rival).unwrap());
        assert_eq!(chains.main().height(), 7);
    }

    #[test]
    fn test_connect_chunk_anchored_by_checkpoint_inside_run() {
        let headers = Header::dummy_chain(Header::dummy_genesis(), 20);
        let params = NetworkParams::dummy_with_checkpoint(headers[0].block_hash(), headers[10]);
        let mut chains = Chains::new(Arc::new(params));
        let main = chains.main_id();

        assert!(chains.connect_chunk(main, 4, &headers[4..]).unwrap());
        assert_eq!(chains.main().height(), 20);
        assert!(chains.header_at(main, 9).is_none());
        assert_eq!(chains.header_at(main, 11), Some(headers[11]));

        // a run that never touches a known hash cannot be anchored
        let mut fresh = Chains::new(Arc::new(NetworkParams::dummy_with_checkpoint(
            headers[0].block_hash(),
            headers[10],
        )));
        let id = fresh.main_id();
        assert!(!fresh.connect_chunk(id, 12, &headers[12..]).unwrap());
    }

    #[test]
    fn test_prune_never_removes_best_or_parents() {
        let (mut chains, headers) = registry_with(3);
        let main = chains.main_id();
        let stale = chains.fork(main, Header::dummy(2, headers[1].block_hash(), 9)).unwrap();

        let mut tip = headers[3];
        for nonce in 0..10 {
            tip = Header::dummy(tip.height() + 1, tip.block_hash(), nonce);
            chains.save_header(main, tip).unwrap();
        }
        assert_eq!(chains.prune_forks(100), Vec::<ChainId>::new());
        assert_eq!(chains.prune_forks(5), vec![stale]);
        assert!(chains.contains(main));
        assert_eq!(chains.best_id(), main);
    }

    #[tokio::test]
    async fn test_registry_reload_restores_forks() {
        let temp_dir = TempDir::new().unwrap();
        let headers = Header::dummy_chain(Header::dummy_genesis(), 3);
        let params = NetworkParams::dummy(headers[0].block_hash());
        let fork_first = Header::dummy(2, headers[1].block_hash(), 9);

        {
            let registry = ChainRegistry::load(params.clone(), temp_dir.path()).await.unwrap();
            let mut chains = registry.lock().await;
            let main = chains.main_id();
            for header in &headers[1..] {
                chains.save_header(main, *header).unwrap();
            }
            chains.fork(main, fork_first).unwrap();
            drop(chains);
            registry.flush().await.unwrap();
        }

        let registry = ChainRegistry::load(params, temp_dir.path()).await.unwrap();
        let chains = registry.lock().await;
        assert_eq!(chains.len(), 2);
        assert_eq!(chains.main().height(), 3);
        assert_eq!(chains.check_header(&headers[3]), Some(chains.main_id()));
        assert_eq!(chains.check_header(&fork_first), Some(ChainId::new(fork_first.block_hash())));
    }

    #[test]
    fn test_truncate_moves_best_and_accepts_new_tip() {
        let (mut chains, headers) = registry_with(3);
        let main = chains.main_id();
        let fork_first = Header::dummy(2, headers[1].block_hash(), 9);
        let fork = chains.fork(main, fork_first).unwrap();
        let mut tip = fork_first;
        for nonce in 0..3 {
            tip = Header::dummy(tip.height() + 1, tip.block_hash(), 100 + nonce);
            chains.save_header(fork, tip).unwrap();
        }
        assert_eq!(chains.best_id(), fork);

        chains.truncate(fork, 2).unwrap();
        assert_eq!(chains.height_of(fork), Some(2));
        assert_eq!(chains.best_id(), main);

        let replacement = Header::dummy(3, fork_first.block_hash(), 500);
        assert_eq!(chains.can_connect(&replacement), Some(fork));
        chains.save_header(fork, replacement).unwrap();
        assert!(chains.get(fork).unwrap().verify_linkage());
    }

    #[test]
    fn test_truncate_refused_under_a_fork() {
        let (mut chains, headers) = registry_with(4);
        let main = chains.main_id();
        chains.fork(main, Header::dummy(3, headers[2].block_hash(), 9)).unwrap();

        assert!(matches!(chains.truncate(main, 1), Err(ChainError::InvalidForkpoint { forkpoint: 3, .. })));
        assert_eq!(chains.main().height(), 4);
        chains.truncate(main, 2).unwrap();
        assert_eq!(chains.main().height(), 2);
        assert!(matches!(
            chains.truncate(ChainId::new(headers[4].block_hash()), 1),
            Err(ChainError::UnknownChain(_))
        ));
    }

    #[tokio::test]
    async fn test_truncate_rewrites_stored_file() {
        let temp_dir = TempDir::new().unwrap();
        let headers = Header::dummy_chain(Header::dummy_genesis(), 6);
        let params = NetworkParams::dummy(headers[0].block_hash());

        {
            let registry = ChainRegistry::load(params.clone(), temp_dir.path()).await.unwrap();
            let mut chains = registry.lock().await;
            let main = chains.main_id();
            for header in &headers[1..] {
                chains.save_header(main, *header).unwrap();
            }
            chains.truncate(main, 4).unwrap();
            drop(chains);
            registry.flush().await.unwrap();
        }

        let registry = ChainRegistry::load(params, temp_dir.path()).await.unwrap();
        let chains = registry.lock().await;
        assert_eq!(chains.main().height(), 4);
        assert_eq!(chains.header_at(chains.main_id(), 4), Some(headers[4]));
        assert!(chains.main().verify_linkage());
    }
}
