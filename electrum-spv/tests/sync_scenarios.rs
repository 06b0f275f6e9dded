//! End-to-end header sync scenarios against real chain state.

use std::sync::Arc;

use serde_json::json;

use electrum_spv::chain::{ChainRegistry, Chains, Header, NetworkParams};
use electrum_spv::error::{NetworkError, SyncError};
use electrum_spv::sync::{StepStatus, SyncEngine};
use electrum_spv::test_utils::{ScriptedHeaderSource, ScriptedValidator};

/// Main chain holding `headers[0..=count]` on regtest-like params.
fn local_chain(count: u32) -> (Chains, Vec<Header>) {
    let headers = Header::dummy_chain(Header::dummy_genesis(), count);
    let mut chains = Chains::new(Arc::new(NetworkParams::dummy(headers[0].block_hash())));
    let main = chains.main_id();
    for header in &headers[1..] {
        chains.save_header(main, *header).unwrap();
    }
    (chains, headers)
}

/// `canonical[..=shared]` followed by a rival branch up to `tip`.
fn rival_branch(canonical: &[Header], shared: u32, tip: u32) -> Vec<Header> {
    let first = Header::dummy(shared + 1, canonical[shared as usize].block_hash(), 7_000 + shared);
    let mut headers = canonical[..=shared as usize].to_vec();
    headers.extend(Header::dummy_chain(first, tip - shared - 1));
    headers
}

fn ceil_log2(n: u32) -> u32 {
    u32::BITS - (n - 1).leading_zeros()
}

#[tokio::test]
async fn test_single_block_reorg_creates_fork() {
    let (mut chains, canonical) = local_chain(2);
    let main = chains.main_id();
    let server_chain = rival_branch(&canonical, 1, 2);
    let rival_tip = server_chain[2];
    let source = Arc::new(ScriptedHeaderSource::new(server_chain));

    let mut engine = SyncEngine::new(source.clone(), "reorg", 0);
    engine.set_tip(rival_tip);
    engine.mark_ready(&chains);
    assert!(engine.process_tip(&mut chains).await.unwrap());

    assert_eq!(chains.len(), 2);
    let fork = chains.check_header(&rival_tip).unwrap();
    assert_ne!(fork, main);
    assert_eq!(chains.get(fork).unwrap().forkpoint(), 2);
    assert_eq!(chains.header_at(fork, 2), Some(rival_tip));
    assert_eq!(chains.header_at(main, 2), Some(canonical[2]));
    assert_eq!(engine.chain(), Some(fork));
    // one backward fetch, one bisection fetch
    assert_eq!(source.header_fetches(), 2);
}

#[tokio::test]
async fn test_fork_point_found_in_logarithmic_fetches() {
    const LOCAL_HEIGHT: u32 = 300;
    for depth in [1u32, 5, 37, 200] {
        let (mut chains, canonical) = local_chain(LOCAL_HEIGHT);
        let shared = LOCAL_HEIGHT - depth;
        let server_chain = rival_branch(&canonical, shared, LOCAL_HEIGHT);
        let rival_tip = server_chain[LOCAL_HEIGHT as usize];
        let source = Arc::new(ScriptedHeaderSource::new(server_chain));

        let mut engine = SyncEngine::new(source.clone(), "deep-fork", 0);
        engine.set_tip(rival_tip);
        engine.mark_ready(&chains);
        let (status, next) = engine.step(&mut chains, LOCAL_HEIGHT, Some(rival_tip)).await.unwrap();

        assert_eq!(status, StepStatus::Fork, "depth {}", depth);
        assert_eq!(next, shared + 2, "depth {}", depth);
        let fork = engine.chain().unwrap();
        assert_eq!(chains.get(fork).unwrap().forkpoint(), shared + 1, "depth {}", depth);

        let bound = 2 * ceil_log2(depth) as usize + 2;
        assert!(
            source.header_fetches() <= bound,
            "depth {} took {} fetches, bound {}",
            depth,
            source.header_fetches(),
            bound
        );
    }
}

#[tokio::test]
async fn test_rival_chain_below_checkpoint_is_rejected() {
    let canonical = Header::dummy_chain(Header::dummy_genesis(), 12);
    let params = NetworkParams::dummy_with_checkpoint(canonical[0].block_hash(), canonical[10]);
    let mut chains = Chains::new(Arc::new(params));
    let main = chains.main_id();
    assert!(chains.connect_chunk(main, 11, &canonical[11..]).unwrap());
    assert_eq!(chains.main().height(), 12);

    // diverges at height 5, below the checkpoint at 10
    let server_chain = rival_branch(&canonical, 4, 15);
    let rival_tip = server_chain[15];
    let source = Arc::new(ScriptedHeaderSource::new(server_chain.clone()));

    let mut engine = SyncEngine::new(source, "rival", 10);
    engine.set_tip(rival_tip);
    engine.mark_ready(&chains);
    let result = engine.process_tip(&mut chains).await;
    assert!(matches!(result, Err(SyncError::CheckpointViolation { .. })));

    assert_eq!(chains.len(), 1);
    assert_eq!(chains.main().height(), 12);
    assert_eq!(chains.header_at(main, 11), Some(canonical[11]));

    // the chunk path refuses the same headers without mutation
    assert!(!chains.connect_chunk(main, 5, &server_chain[5..]).unwrap());
    assert_eq!(chains.main().height(), 12);
    assert_eq!(chains.len(), 1);
}

#[tokio::test]
async fn test_known_headers_are_idempotent() {
    let (mut chains, canonical) = local_chain(5);
    let source = Arc::new(ScriptedHeaderSource::new(canonical.clone()));
    let mut engine = SyncEngine::new(source.clone(), "idempotent", 0);
    engine.set_tip(canonical[5]);
    engine.mark_ready(&chains);

    for _ in 0..2 {
        let (status, next) = engine.step(&mut chains, 3, Some(canonical[3])).await.unwrap();
        assert_eq!((status, next), (StepStatus::Catchup, 4));
    }
    assert!(!engine.process_tip(&mut chains).await.unwrap());

    assert_eq!(chains.len(), 1);
    assert_eq!(chains.main().height(), 5);
    assert_eq!(source.header_fetches(), 0);
}

#[tokio::test]
async fn test_corrupted_chunk_leaves_chains_untouched() {
    let headers = Header::dummy_chain(Header::dummy_genesis(), 2000);
    let hex: String = headers[1..].iter().map(Header::to_hex).collect();
    let source = Arc::new(ScriptedHeaderSource::new(Vec::new()).with_chunk_response(json!({
        "count": 2016,
        "hex": hex,
        "max": 2016,
    })));
    let mut validator = ScriptedValidator::new(electrum_spv::chain::ChainId::new(headers[0].block_hash()), 0);

    let mut engine = SyncEngine::new(source, "corrupt", 0);
    engine.set_tip(Header::dummy(3000, headers[2000].block_hash(), 1));
    let result = engine.sync_until(&mut validator, 1, Some(3000)).await;

    assert!(matches!(result, Err(SyncError::Network(NetworkError::RequestCorrupted(_)))));
    assert!(validator.chunk_calls.is_empty());
    assert!(validator.saved.is_empty());
}

#[tokio::test]
async fn test_concurrent_tips_extend_chain_once() {
    let headers = Header::dummy_chain(Header::dummy_genesis(), 3);
    let registry = Arc::new(ChainRegistry::new(NetworkParams::dummy(headers[0].block_hash())));
    {
        let mut chains = registry.lock().await;
        let main = chains.main_id();
        for header in &headers[1..3] {
            chains.save_header(main, *header).unwrap();
        }
    }

    let mut tasks = Vec::new();
    for label in ["first", "second"] {
        let registry = registry.clone();
        let source = Arc::new(ScriptedHeaderSource::new(headers.clone()));
        let tip = headers[3];
        tasks.push(tokio::spawn(async move {
            let mut engine = SyncEngine::new(source, label, 0);
            engine.set_tip(tip);
            let mut chains = registry.lock().await;
            engine.mark_ready(&*chains);
            engine.process_tip(&mut *chains).await.unwrap()
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results.sort();
    assert_eq!(results, vec![false, true]);
    assert_eq!(registry.best_chain().await.1, 3);
    assert_eq!(registry.lock().await.len(), 1);
}

#[tokio::test]
#[should_panic(expected = "infinite loop")]
async fn test_stagnating_sync_panics() {
    let headers = Header::dummy_chain(Header::dummy_genesis(), 10);
    let chain = electrum_spv::chain::ChainId::new(headers[0].block_hash());
    // the header at 10 never checks or connects, yet the chain already reaches 9
    let mut validator = ScriptedValidator::new(chain, 9).with_check(|header| header.height() < 10);
    let source = Arc::new(ScriptedHeaderSource::new(headers.clone()));

    let mut engine = SyncEngine::new(source, "stuck", 0);
    engine.set_tip(headers[10]);
    assert_eq!(engine.step(&mut validator, 10, None).await.unwrap(), (StepStatus::NoFork, 10));
    let _ = engine.sync_until(&mut validator, 10, Some(10)).await;
}
