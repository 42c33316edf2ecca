use cfsync_chainstate::{ChainEvent, ChainEvents, HeaderOracle, HeaderStore, OracleConfig, Reorg};
use cfsync_consensus::{chain_params, Chain, Hash256};
use cfsync_pow::{compact_to_target, hash_meets_target};
use cfsync_primitives::{BlockHeader, Position};
use cfsync_storage::memory::MemoryStore;

const REGTEST_BITS: u32 = 0x207f_ffff;
const BASE_TIME: u32 = 1_600_000_000;
const NOW: i64 = 1_700_000_000;

fn new_oracle() -> HeaderOracle<MemoryStore> {
    let params = chain_params(Chain::Regtest);
    let store = HeaderStore::open(MemoryStore::new(), &params).expect("open store");
    HeaderOracle::new(store, params, OracleConfig::default(), ChainEvents::new())
}

fn mine(prev_block: Hash256, time: u32, tag: u8) -> BlockHeader {
    let target = compact_to_target(REGTEST_BITS).expect("target");
    let mut header = BlockHeader {
        version: 4,
        prev_block,
        merkle_root: [tag; 32],
        time,
        bits: REGTEST_BITS,
        nonce: 0,
    };
    while !hash_meets_target(&header.hash(), &target) {
        header.nonce += 1;
    }
    header
}

fn build_chain(parent: Hash256, len: usize, tag: u8) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(len);
    let mut prev = parent;
    for index in 0..len {
        let header = mine(prev, BASE_TIME + index as u32 * 600, tag);
        prev = header.hash();
        headers.push(header);
    }
    headers
}

fn genesis(oracle: &HeaderOracle<MemoryStore>) -> Hash256 {
    oracle.best_block(0).expect("genesis")
}

#[test]
fn extending_batches_raise_best_height() {
    let oracle = new_oracle();
    let chain = build_chain(genesis(&oracle), 8, 1);

    let first = oracle.add_headers_at(&chain[..5], NOW).expect("first batch");
    assert_eq!(first.connected, 5);
    assert_eq!(oracle.best_tip(), Position::new(5, chain[4].hash()));
    assert!(first.reorg.is_none());

    let second = oracle.add_headers_at(&chain[5..], NOW).expect("second batch");
    assert_eq!(second.connected, 3);
    assert_eq!(oracle.current_best().height, 8);
    for (index, header) in chain.iter().enumerate() {
        assert_eq!(oracle.best_block(index as i32 + 1), Ok(header.hash()));
    }
    assert!(oracle.best_block(9).expect_err("past tip").is_not_found());
}

#[test]
fn heavier_fork_reorgs_and_reports_fork_point() {
    let oracle = new_oracle();
    let genesis = genesis(&oracle);
    let main = build_chain(genesis, 3, 1);
    let fork = build_chain(genesis, 4, 2);
    oracle.add_headers_at(&main, NOW).expect("main chain");

    let mut events = oracle.events().subscribe();
    let outcome = oracle.add_headers_at(&fork, NOW).expect("fork");

    let expected = Reorg {
        old_tip: Position::new(3, main[2].hash()),
        new_tip: Position::new(4, fork[3].hash()),
        fork_point: Position::new(0, genesis),
    };
    assert_eq!(outcome.reorg, Some(expected.clone()));
    assert_eq!(
        events.try_recv().expect("reorg event"),
        ChainEvent::Reorg(expected)
    );
    assert_eq!(
        events.try_recv().expect("tip event"),
        ChainEvent::BestTip(Position::new(4, fork[3].hash()))
    );

    for (index, header) in fork.iter().enumerate() {
        assert_eq!(oracle.best_block(index as i32 + 1), Ok(header.hash()));
    }
    for header in &main {
        let stored = oracle
            .store()
            .load_header(&header.hash())
            .expect("losing branch kept in index");
        assert!(!oracle
            .store()
            .is_on_best_chain(&stored.position())
            .expect("best chain lookup"));
    }
    assert!(oracle.is_sibling(&main[2].hash()).expect("sibling"));
    assert!(!oracle.is_sibling(&fork[3].hash()).expect("sibling"));
}

#[test]
fn equal_work_keeps_first_seen_tip() {
    let oracle = new_oracle();
    let genesis = genesis(&oracle);
    let a = mine(genesis, BASE_TIME, 1);
    let b = mine(genesis, BASE_TIME, 2);

    oracle.add_headers_at(&[a], NOW).expect("a");
    let outcome = oracle.add_headers_at(&[b], NOW).expect("b");
    assert!(outcome.best.is_none());
    assert_eq!(oracle.best_tip().hash, a.hash());
    assert!(oracle.is_sibling(&b.hash()).expect("sibling"));

    // Reprocessing the same headers changes nothing.
    let replay = oracle.add_headers_at(&[b, a], NOW).expect("replay");
    assert_eq!(replay.duplicates, 2);
    assert_eq!(replay.connected, 0);
    assert_eq!(oracle.best_tip().hash, a.hash());
}

#[test]
fn equal_work_in_one_batch_prefers_earlier_header() {
    let oracle = new_oracle();
    let genesis = genesis(&oracle);
    let a = mine(genesis, BASE_TIME, 1);
    let b = mine(genesis, BASE_TIME, 2);
    oracle.add_headers_at(&[b, a], NOW).expect("batch");
    assert_eq!(oracle.best_tip().hash, b.hash());
    assert_eq!(
        oracle.sibling_hashes().expect("siblings").into_iter().collect::<Vec<_>>(),
        vec![a.hash()]
    );
}

#[test]
fn orphan_connects_when_parent_arrives() {
    let oracle = new_oracle();
    let chain = build_chain(genesis(&oracle), 3, 1);

    let waiting = oracle.add_headers_at(&chain[1..], NOW).expect("orphans");
    assert_eq!(waiting.orphaned, 2);
    assert_eq!(oracle.current_best().height, 0);
    assert!(oracle
        .has_disconnected_children(&chain[0].hash())
        .expect("disconnected"));

    let outcome = oracle.add_headers_at(&chain[..1], NOW).expect("parent");
    assert_eq!(outcome.connected, 3);
    assert_eq!(outcome.resolved, 2);
    assert_eq!(oracle.best_tip(), Position::new(3, chain[2].hash()));
    assert!(oracle.disconnected_hashes().expect("list").is_empty());
}

#[test]
fn orphan_resolution_resumes_on_next_batch() {
    let params = chain_params(Chain::Regtest);
    let store = HeaderStore::open(MemoryStore::new(), &params).expect("open store");
    let config = OracleConfig {
        orphan_resolve_limit: 1,
        ..OracleConfig::default()
    };
    let oracle = HeaderOracle::new(store, params, config, ChainEvents::new());
    let chain = build_chain(genesis(&oracle), 4, 1);

    oracle.add_headers_at(&chain[1..], NOW).expect("orphans");
    oracle.add_headers_at(&chain[..1], NOW).expect("parent");
    assert_eq!(oracle.current_best().height, 2);

    oracle.add_headers_at(&[], NOW).expect("empty batch");
    assert_eq!(oracle.current_best().height, 3);
    oracle.add_headers_at(&[], NOW).expect("empty batch");
    assert_eq!(oracle.best_tip(), Position::new(4, chain[3].hash()));
    assert!(oracle.disconnected_hashes().expect("list").is_empty());
}

#[test]
fn malformed_header_rejected_without_failing_batch() {
    let oracle = new_oracle();
    let genesis = genesis(&oracle);
    let good = mine(genesis, BASE_TIME, 1);
    let mut bad = mine(genesis, BASE_TIME, 2);
    bad.bits = 0x1d00_ffff;
    let child_of_bad = mine(bad.hash(), BASE_TIME + 600, 3);

    let outcome = oracle
        .add_headers_at(&[bad, good, child_of_bad], NOW)
        .expect("batch");
    assert_eq!(outcome.connected, 1);
    assert_eq!(outcome.rejected.len(), 2);
    assert_eq!(oracle.best_tip().hash, good.hash());
    assert!(!oracle.store().header_exists(&bad.hash()).expect("exists"));
}

#[test]
fn headers_below_checkpoint_must_match_best_chain() {
    let oracle = new_oracle();
    let genesis = genesis(&oracle);
    let main = build_chain(genesis, 3, 1);
    oracle.add_headers_at(&main, NOW).expect("main");
    oracle
        .add_checkpoint(Position::new(2, main[1].hash()))
        .expect("checkpoint");

    let fork = build_chain(genesis, 5, 2);
    let outcome = oracle.add_headers_at(&fork, NOW).expect("fork");
    assert_eq!(outcome.connected, 0);
    assert_eq!(outcome.rejected.len(), 5);
    assert_eq!(oracle.best_tip(), Position::new(3, main[2].hash()));
    assert_eq!(
        oracle.store().current_checkpoint(),
        Position::new(2, main[1].hash())
    );
}
