use std::sync::Arc;
use std::time::{Duration, Instant};

use cfsync_chainstate::{
    ChainEvents, FilterConfig, FilterError, FilterOracle, FilterRequest, FilterStore, FilterSync,
    HeaderOracle, HeaderStore, OracleConfig,
};
use cfsync_consensus::{chain_params, Chain, FilterType, Hash256};
use cfsync_pow::{compact_to_target, hash_meets_target};
use cfsync_primitives::{filter_hash, BlockHeader, FilterHeaderChain, Position};
use cfsync_storage::memory::MemoryStore;
use tokio::sync::mpsc;

const REGTEST_BITS: u32 = 0x207f_ffff;
const NOW: i64 = 1_700_000_000;
const BASIC: FilterType = FilterType::Basic;

type Store = Arc<MemoryStore>;

struct Fixture {
    headers: Arc<HeaderOracle<Store>>,
    sync: FilterSync<Store>,
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

fn extend(headers: &HeaderOracle<Store>, from: Hash256, count: usize, tag: u8) {
    let mut batch = Vec::with_capacity(count);
    let mut prev = from;
    for index in 0..count {
        let header = mine(prev, 1_600_000_000 + index as u32 * 600, tag);
        prev = header.hash();
        batch.push(header);
    }
    headers.add_headers_at(&batch, NOW).expect("extend chain");
}

fn fixture(height: usize, config: FilterConfig) -> Fixture {
    let store: Store = Arc::new(MemoryStore::new());
    let params = chain_params(Chain::Regtest);
    let events = ChainEvents::new();
    let header_store = HeaderStore::open(store.clone(), &params).expect("open headers");
    let headers = Arc::new(HeaderOracle::new(
        header_store,
        params,
        OracleConfig::default(),
        events.clone(),
    ));
    let genesis = headers.best_block(0).expect("genesis");
    extend(&headers, genesis, height, 1);
    let sync = FilterSync::new(
        headers.clone(),
        FilterStore::new(store),
        config,
        events,
    );
    Fixture { headers, sync }
}

fn basic_config() -> FilterConfig {
    FilterConfig::new(vec![BASIC])
}

fn filter_bytes(height: i32) -> Vec<u8> {
    vec![0x01, height as u8, (height >> 8) as u8, 0xab]
}

fn filter_hashes(range: std::ops::RangeInclusive<i32>) -> Vec<Hash256> {
    range.map(|height| filter_hash(&filter_bytes(height))).collect()
}

fn last_header(previous: Hash256, hashes: &[Hash256]) -> Hash256 {
    FilterHeaderChain::new(previous, hashes)
        .last()
        .map(|(_, header)| header)
        .expect("non-empty")
}

#[test]
fn filter_headers_chain_and_readd_is_noop() {
    let fx = fixture(60, basic_config());
    let stop = fx.headers.best_block(40).expect("stop");
    let hashes = filter_hashes(0..=40);

    let outcome = fx
        .sync
        .add_headers(BASIC, &stop, &[0u8; 32], &hashes)
        .expect("first range");
    assert_eq!(outcome.stored, 41);
    assert_eq!(outcome.tip, Position::new(40, stop));

    let again = fx
        .sync
        .add_headers(BASIC, &stop, &[0u8; 32], &hashes)
        .expect("same range");
    assert_eq!(again.stored, 0);
    assert_eq!(again.tip, Position::new(40, stop));

    let previous = last_header([0u8; 32], &hashes);
    let next_stop = fx.headers.best_block(60).expect("stop");
    let next = fx
        .sync
        .add_headers(BASIC, &next_stop, &previous, &filter_hashes(41..=60))
        .expect("second range");
    assert_eq!(next.stored, 20);
    assert_eq!(
        fx.sync.filter_header_tip(BASIC).expect("tip"),
        Position::new(60, next_stop)
    );
}

#[test]
fn filter_headers_not_chaining_are_rejected() {
    let fx = fixture(60, basic_config());
    let stop = fx.headers.best_block(40).expect("stop");
    let hashes = filter_hashes(0..=40);
    fx.sync
        .add_headers(BASIC, &stop, &[0u8; 32], &hashes)
        .expect("first range");

    let next_stop = fx.headers.best_block(60).expect("stop");
    let err = fx
        .sync
        .add_headers(BASIC, &next_stop, &[7u8; 32], &filter_hashes(41..=60))
        .expect_err("bad previous header");
    assert!(err.is_protocol_violation());
    assert!(!fx
        .sync
        .store()
        .have_filter_header(BASIC, &next_stop)
        .expect("lookup"));

    let mut forged = hashes.clone();
    forged[10] = [9u8; 32];
    let err = fx
        .sync
        .add_headers(BASIC, &stop, &[0u8; 32], &forged)
        .expect_err("conflicting range");
    assert!(matches!(
        err,
        FilterError::InvalidChain { height: 10, .. }
    ));
    assert_eq!(
        fx.sync.filter_header_tip(BASIC).expect("tip"),
        Position::new(40, stop)
    );
}

#[test]
fn filters_must_match_their_filter_header() {
    let fx = fixture(10, basic_config());
    let stop = fx.headers.best_block(5).expect("stop");
    fx.sync
        .add_headers(BASIC, &stop, &[0u8; 32], &filter_hashes(0..=5))
        .expect("filter headers");

    let block1 = fx.headers.best_block(1).expect("block 1");
    let err = fx
        .sync
        .add_filter(BASIC, &block1, &filter_bytes(2))
        .expect_err("wrong bytes");
    assert_eq!(
        err,
        FilterError::InvalidFilter {
            filter_type: BASIC,
            block: block1
        }
    );

    let block8 = fx.headers.best_block(8).expect("block 8");
    assert!(matches!(
        fx.sync.add_filter(BASIC, &block8, &filter_bytes(8)),
        Err(FilterError::MissingFilterHeader { .. })
    ));

    // Out of order: the tip only moves once the gap closes.
    let tip = fx
        .sync
        .add_filter(BASIC, &block1, &filter_bytes(1))
        .expect("filter 1");
    assert!(tip.is_blank());
    let block0 = fx.headers.best_block(0).expect("genesis");
    let tip = fx
        .sync
        .add_filter(BASIC, &block0, &filter_bytes(0))
        .expect("filter 0");
    assert_eq!(tip, Position::new(1, block1));
    assert_eq!(
        fx.sync.store().load_filter(BASIC, &block1).expect("load"),
        Some(filter_bytes(1))
    );
}

#[test]
fn check_blocks_requests_from_filter_header_tip() {
    let fx = fixture(100, basic_config());
    let stop = fx.headers.best_block(40).expect("stop");
    fx.sync
        .add_headers(BASIC, &stop, &[0u8; 32], &filter_hashes(0..=40))
        .expect("filter headers to 40");

    let start = Instant::now();
    let requests = fx.sync.check_blocks_at(start).expect("check");
    let tip_hash = fx.headers.best_block(100).expect("tip");
    assert!(requests.contains(&FilterRequest::Headers {
        filter_type: BASIC,
        start_height: 41,
        stop_hash: tip_hash,
    }));
    assert!(requests.contains(&FilterRequest::Filters {
        filter_type: BASIC,
        start_height: 0,
        stop_hash: stop,
    }));

    // Still in flight: nothing new.
    let repeat = fx
        .sync
        .check_blocks_at(start + Duration::from_secs(1))
        .expect("check");
    assert!(repeat.is_empty());

    // Timed out: reissued from the same height.
    let later = start + fx.sync.config().request_timeout + Duration::from_secs(1);
    let reissued = fx.sync.check_blocks_at(later).expect("check");
    assert!(reissued
        .iter()
        .any(|request| matches!(request, FilterRequest::Headers { start_height: 41, .. })));
}

#[test]
fn check_blocks_window_bounds_request() {
    let mut config = basic_config();
    config.cfheaders_window = 25;
    let fx = fixture(100, config);
    let requests = fx.sync.check_blocks_at(Instant::now()).expect("check");
    assert_eq!(
        requests,
        vec![FilterRequest::Headers {
            filter_type: BASIC,
            start_height: 0,
            stop_hash: fx.headers.best_block(24).expect("stop"),
        }]
    );
}

#[test]
fn reorg_rewinds_filter_tips_to_fork_point() {
    let fx = fixture(50, basic_config());
    let stop = fx.headers.best_block(40).expect("stop");
    fx.sync
        .add_headers(BASIC, &stop, &[0u8; 32], &filter_hashes(0..=40))
        .expect("filter headers");

    let fork_base = fx.headers.best_block(30).expect("fork base");
    extend(&fx.headers, fork_base, 30, 2);
    assert_eq!(fx.headers.current_best().height, 60);

    let requests = fx.sync.check_blocks_at(Instant::now()).expect("check");
    assert_eq!(
        fx.sync.filter_header_tip(BASIC).expect("tip"),
        Position::new(30, fork_base)
    );
    assert!(requests
        .iter()
        .any(|request| matches!(request, FilterRequest::Headers { start_height: 31, .. })));
}

#[tokio::test]
async fn oracle_task_forwards_requests_and_drains_on_shutdown() {
    let fx = fixture(20, basic_config());
    let (request_tx, mut request_rx) = mpsc::channel(16);
    let handle = FilterOracle::start(fx.sync, request_tx);

    let requests = handle.check_blocks().await.expect("check");
    assert_eq!(requests.len(), 1);
    assert_eq!(request_rx.recv().await, Some(requests[0]));

    let stop = fx.headers.best_block(20).expect("stop");
    let outcome = handle
        .add_headers(BASIC, stop, [0u8; 32], filter_hashes(0..=20))
        .await
        .expect("filter headers");
    assert_eq!(outcome.tip, Position::new(20, stop));

    handle.shutdown().await;
    assert_eq!(
        handle.add_filter(BASIC, stop, filter_bytes(20)).await,
        Err(FilterError::Stopped)
    );
}
