//! Fork resolution driven by a server's tip notifications.
//!
//! The engine walks a server's claimed chain against the local chain tree: it catches up
//! header by header or chunk by chunk, and when the server's headers stop connecting it
//! brackets the fork point with an exponential backward search, pins it down with a
//! binary search and then either resumes on the existing chain or registers a new fork.
//!
//! Every entry point takes the chain state as `&mut V`; callers hold the registry lock
//! for the whole call so no other connection can mutate chains in between.

use std::sync::Arc;

use super::chunks::{Chunk, ChunkFetcher};
use super::source::HeaderSource;
use crate::chain::{ChainId, Header, HeaderValidator};
use crate::error::{NetworkError, SyncError, SyncResult};
use crate::network::constants::MAX_SINGLE_STEP_GAP;
use crate::network::validate;

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStatus {
    /// The header was known or appended; continue at the next height.
    Catchup,
    /// The fork point is the tip of the current chain; continue there.
    NoFork,
    /// A new fork was registered.
    Fork,
}

/// Outcome of probing one height during the backward search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStep {
    /// The fetched header is unknown; try `height` next.
    Continue {
        height: i64,
    },
    /// The fetched header agrees with a known chain at `point`.
    ForkFound {
        point: u32,
    },
    /// The server disagrees with a checkpoint.
    FatalViolation {
        reason: String,
    },
}

/// Result of the backward search: a known-good header below a known-bad one.
struct Bracket {
    good: u32,
    good_header: Header,
    bad: u32,
    bad_header: Header,
}

pub struct SyncEngine<S: HeaderSource + ?Sized> {
    source: Arc<S>,
    chunks: ChunkFetcher<S>,
    label: String,
    max_checkpoint: u32,
    tip: u32,
    tip_header: Option<Header>,
    chain: Option<ChainId>,
}

impl<S: HeaderSource + ?Sized> SyncEngine<S> {
    pub fn new(source: Arc<S>, label: impl Into<String>, max_checkpoint: u32) -> Self {
        Self {
            chunks: ChunkFetcher::new(source.clone()),
            source,
            label: label.into(),
            max_checkpoint,
            tip: 0,
            tip_header: None,
            chain: None,
        }
    }

    pub fn chunks(&self) -> &ChunkFetcher<S> {
        &self.chunks
    }

    pub fn tip(&self) -> u32 {
        self.tip
    }

    pub fn tip_header(&self) -> Option<&Header> {
        self.tip_header.as_ref()
    }

    /// The chain this server is believed to follow.
    pub fn chain(&self) -> Option<ChainId> {
        self.chain
    }

    pub fn set_chain(&mut self, chain: ChainId) {
        self.chain = Some(chain);
    }

    /// Record the server's claimed tip before it is verified.
    pub fn set_tip(&mut self, header: Header) {
        self.tip = header.height();
        self.tip_header = Some(header);
    }

    /// Pick the chain to follow on first contact: the one holding the tip header, or
    /// the best chain.
    pub fn mark_ready<V: HeaderValidator + ?Sized>(&mut self, validator: &V) -> ChainId {
        if let Some(chain) = self.chain.filter(|chain| validator.chain_height(*chain).is_some()) {
            return chain;
        }
        let chain = self
            .tip_header
            .as_ref()
            .and_then(|header| validator.check_header(header))
            .unwrap_or_else(|| validator.best_chain());
        tracing::info!(
            "[{}] set blockchain with height {}",
            self.label,
            validator.chain_height(chain).unwrap_or(0)
        );
        self.chain = Some(chain);
        chain
    }

    /// Current chain, falling back to the best chain when it is unset or was pruned.
    fn current_chain<V: HeaderValidator + ?Sized>(&mut self, validator: &V) -> ChainId {
        match self.chain {
            Some(chain) if validator.chain_height(chain).is_some() => chain,
            _ => {
                let best = validator.best_chain();
                self.chain = Some(best);
                best
            }
        }
    }

    /// Bring the local chains up to the recorded tip.
    ///
    /// Returns `false` when the tip was already part of the followed chain.
    pub async fn process_tip<V: HeaderValidator + ?Sized>(&mut self, validator: &mut V) -> SyncResult<bool> {
        let Some(header) = self.tip_header else {
            return Ok(false);
        };
        let height = self.tip;
        let chain = self.current_chain(validator);
        if validator.chain_height(chain).is_some_and(|h| h >= height) && validator.chain_contains(chain, &header) {
            // another connection already extended this chain
            return Ok(false);
        }

        let (_, next) = self.step(validator, height, Some(header)).await?;
        if next <= self.tip {
            self.sync_until(validator, next, None).await?;
        }
        Ok(true)
    }

    async fn fetch_header(&self, height: u32, mode: &str) -> SyncResult<Header> {
        tracing::info!("[{}] requesting block header {} in mode {}", self.label, height, mode);
        let response = self.source.block_header(height).await?;
        let hex = validate::hex_str(&response)?;
        Header::from_hex(hex, height).map_err(|e| {
            SyncError::Network(NetworkError::RequestCorrupted(format!("bad header at {}: {}", height, e)))
        })
    }

    async fn fetch_chunk(&self, height: u32, tip: u32) -> SyncResult<Chunk> {
        Ok(self.chunks.fetch(height, Some(tip)).await?)
    }

    /// Process the server's header at `height`, fetching it when not supplied.
    pub async fn step<V: HeaderValidator + ?Sized>(
        &mut self,
        validator: &mut V,
        height: u32,
        header: Option<Header>,
    ) -> SyncResult<(StepStatus, u32)> {
        debug_assert!(height <= self.tip, "step at {} beyond tip {}", height, self.tip);
        let header = match header {
            Some(header) => header,
            None => self.fetch_header(height, "catchup").await?,
        };

        // Known hash is enough here even if the header itself was never stored
        // (a chain holding only its anchor); the next block resolves that.
        if let Some(chain) = validator.check_header(&header) {
            self.chain = Some(chain);
            return Ok((StepStatus::Catchup, height + 1));
        }

        let (height, header, bracket) = match validator.can_connect(&header) {
            Some(_) => (height, header, None),
            None => {
                tracing::info!("[{}] can't connect new block: height={}", self.label, height);
                let bracket = self.search_backwards(validator, height, header).await?;
                (bracket.good, bracket.good_header, Some((bracket.bad, bracket.bad_header)))
            }
        };

        if let Some(target) = validator.can_connect(&header) {
            tracing::info!("[{}] new block: height={}", self.label, height);
            self.chain = Some(target);
            validator.save_header(target, header)?;
            return Ok((StepStatus::Catchup, height + 1));
        }

        let chain = validator.check_header(&header);
        let Some((bad, bad_header)) = bracket else {
            return Err(SyncError::Network(NetworkError::RequestCorrupted(format!(
                "header at {} neither checks nor connects",
                height
            ))));
        };
        let (good, bad, bad_header) = self.search_binary(validator, height, bad, bad_header, chain).await?;
        self.resolve_fork(validator, good, bad, bad_header)
    }

    /// Catch up from `height` to `next_height` (the tip by default), in chunks when
    /// far behind.
    pub async fn sync_until<V: HeaderValidator + ?Sized>(
        &mut self,
        validator: &mut V,
        mut height: u32,
        next_height: Option<u32>,
    ) -> SyncResult<(StepStatus, u32)> {
        let next_height = next_height.unwrap_or(self.tip);
        let mut last: Option<StepStatus> = None;
        while last.is_none() || height <= next_height {
            let (prev_last, prev_height) = (last, height);
            if next_height > height.saturating_add(MAX_SINGLE_STEP_GAP) {
                let chunk = self.fetch_chunk(height, next_height).await?;
                let chain = self.current_chain(validator);
                if !validator.connect_chunk(chain, chunk.start_height, &chunk.headers)? {
                    if height <= self.max_checkpoint {
                        return Err(SyncError::CheckpointViolation {
                            reason: "server chain conflicts with checkpoints or genesis".to_string(),
                        });
                    }
                    let (status, next) = self.step(validator, height, None).await?;
                    last = Some(status);
                    height = next;
                    continue;
                }
                height = chunk.start_height + chunk.count();
                last = Some(StepStatus::Catchup);
            } else {
                let (status, next) = self.step(validator, height, None).await?;
                last = Some(status);
                height = next;
            }
            assert!(
                (prev_last, prev_height) != (last, height),
                "had to prevent infinite loop in sync_until: stuck at {:?} height {}",
                last,
                height
            );
        }
        Ok((last.unwrap_or(StepStatus::Catchup), height))
    }

    /// Classify the header fetched at `height` during the backward search.
    fn step_backwards<V: HeaderValidator + ?Sized>(&self, validator: &V, header: &Header, at_checkpoint: bool) -> SearchStep {
        if validator.check_header(header).is_some() || validator.can_connect(header).is_some() {
            return SearchStep::ForkFound {
                point: header.height(),
            };
        }
        if at_checkpoint {
            return SearchStep::FatalViolation {
                reason: "server chain conflicts with checkpoints".to_string(),
            };
        }
        let tip = i64::from(self.tip);
        let delta = tip - i64::from(header.height());
        SearchStep::Continue {
            height: tip - 2 * delta,
        }
    }

    async fn search_backwards<V: HeaderValidator + ?Sized>(
        &mut self,
        validator: &mut V,
        height: u32,
        header: Header,
    ) -> SyncResult<Bracket> {
        assert_unknown(validator, &header);
        let (mut bad, mut bad_header) = (height, header);

        let local_max = validator.max_known_height().map_or(i64::MAX, |h| i64::from(h) + 1);
        let mut candidate = local_max.min(i64::from(height) - 1);
        loop {
            let at_checkpoint = candidate <= i64::from(self.max_checkpoint);
            let back_height = if at_checkpoint {
                self.max_checkpoint
            } else {
                candidate as u32
            };
            let fetched = self.fetch_header(back_height, "backward").await?;
            match self.step_backwards(validator, &fetched, at_checkpoint) {
                SearchStep::ForkFound {
                    point,
                } => {
                    assert_unknown(validator, &bad_header);
                    tracing::info!("[{}] exiting backward mode at {}", self.label, point);
                    return Ok(Bracket {
                        good: point,
                        good_header: fetched,
                        bad,
                        bad_header,
                    });
                }
                SearchStep::FatalViolation {
                    reason,
                } => {
                    tracing::warn!("[{}] {} at height {}", self.label, reason, back_height);
                    return Err(SyncError::CheckpointViolation {
                        reason,
                    });
                }
                SearchStep::Continue {
                    height: next,
                } => {
                    bad = back_height;
                    bad_header = fetched;
                    candidate = next;
                }
            }
        }
    }

    async fn search_binary<V: HeaderValidator + ?Sized>(
        &mut self,
        validator: &mut V,
        good: u32,
        bad: u32,
        bad_header: Header,
        chain: Option<ChainId>,
    ) -> SyncResult<(u32, u32, Header)> {
        assert_unknown(validator, &bad_header);
        if let Some(chain) = chain {
            self.chain = Some(chain);
        }

        let (mut good, mut bad, mut bad_header) = (good, bad, bad_header);
        loop {
            if good >= bad {
                return Err(SyncError::Network(NetworkError::RequestCorrupted(format!(
                    "inconsistent headers during binary search: good {} bad {}",
                    good, bad
                ))));
            }
            let height = good + (bad - good) / 2;
            tracing::info!("[{}] binary step. good {}, bad {}, height {}", self.label, good, bad, height);
            let header = self.fetch_header(height, "binary").await?;
            match validator.check_header(&header) {
                Some(chain) => {
                    self.chain = Some(chain);
                    good = height;
                }
                None => {
                    bad = height;
                    bad_header = header;
                }
            }
            if good + 1 == bad {
                break;
            }
        }

        let chain = self.current_chain(validator);
        if !validator.can_connect_to(chain, &bad_header, false) {
            return Err(SyncError::Network(NetworkError::RequestCorrupted(format!(
                "unexpected bad header during binary search at height {}",
                bad
            ))));
        }
        assert_unknown(validator, &bad_header);
        tracing::info!("[{}] binary search exited. good {}, bad {}", self.label, good, bad);
        Ok((good, bad, bad_header))
    }

    fn resolve_fork<V: HeaderValidator + ?Sized>(
        &mut self,
        validator: &mut V,
        good: u32,
        bad: u32,
        bad_header: Header,
    ) -> SyncResult<(StepStatus, u32)> {
        debug_assert_eq!(good + 1, bad);
        let chain = self.current_chain(validator);
        let chain_height = validator.chain_height(chain).unwrap_or(0);
        assert!(chain_height >= good, "chain height {} below fork point {}", chain_height, good);

        if chain_height == good {
            tracing::info!("[{}] catching up from {}", self.label, good + 1);
            return Ok((StepStatus::NoFork, good + 1));
        }

        tracing::info!("[{}] new fork at bad height {}", self.label, bad);
        let fork = validator.fork(chain, bad_header)?;
        self.chain = Some(fork);
        Ok((StepStatus::Fork, bad + 1))
    }
}

/// A header classified as bad must not belong to any chain.
fn assert_unknown<V: HeaderValidator + ?Sized>(validator: &V, header: &Header) {
    assert!(
        validator.check_header(header).is_none(),
        "bad header at height {} unexpectedly checks against a known chain",
        header.height()
    );
}
