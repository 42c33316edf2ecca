//! Per-chain sync coordinator.
//!
//! The network task owns the header batch queue and the state machine tick.
//! Peers hand it header batches and height announcements through a
//! [`NetworkHandle`]; it applies batches one at a time, asks the filter
//! oracle what to download next and keeps the peer manager topped up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cfsync_chainstate::{
    AddHeadersOutcome, ChainEvent, ChainEvents, FilterConfig, FilterOracle, FilterOracleHandle,
    FilterRequest, FilterStore, FilterSync, HeaderOracle, HeaderStore, OracleConfig,
};
use cfsync_consensus::{hash256_to_hex, Chain, ChainParams, FilterType, Hash256};
use cfsync_log::{log_debug, log_error, log_info, log_warn};
use cfsync_pow::work_from_bytes;
use cfsync_primitives::{BlockHeader, Position};
use primitive_types::U256;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::peer::{PeerContext, PeerId, TcpSpawner};
use crate::peer_db::PeerDb;
use crate::peer_manager::{Job, JobQueues, PeerCounts, PeerManager, PeerManagerConfig, PeerManagerHandle};
use crate::Store;

pub const TICK_INTERVAL: Duration = Duration::from_secs(30);
pub const RESYNC_DELAY: Duration = Duration::from_millis(250);
/// A header batch still applying after this long no longer holds up the queue.
pub const HEADERS_APPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Minimum spacing between `getheaders` jobs while catching up.
const GETHEADERS_DISPATCH_INTERVAL: Duration = Duration::from_secs(2);
const MAILBOX_CAPACITY: usize = 1_024;
const FILTER_REQUEST_CAPACITY: usize = 256;
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Heights shared between the coordinator and its peers.
#[derive(Debug)]
pub struct SyncStatus {
    local: AtomicI32,
    remote: AtomicI32,
    processing_headers: AtomicBool,
}

impl SyncStatus {
    pub fn new(local: i32) -> Self {
        Self {
            local: AtomicI32::new(local),
            remote: AtomicI32::new(-1),
            processing_headers: AtomicBool::new(false),
        }
    }

    pub fn local_height(&self) -> i32 {
        self.local.load(Ordering::Acquire)
    }

    pub fn remote_height(&self) -> i32 {
        self.remote.load(Ordering::Acquire)
    }

    pub fn set_local(&self, height: i32) {
        self.local.store(height, Ordering::Release);
    }

    /// Raises the best height any peer has reported. Returns true if it grew.
    pub fn update_remote(&self, height: i32) -> bool {
        self.remote.fetch_max(height, Ordering::AcqRel) < height
    }

    pub fn is_synchronized(&self) -> bool {
        self.local_height() >= self.remote_height()
    }

    pub fn processing_headers(&self) -> bool {
        self.processing_headers.load(Ordering::Acquire)
    }

    pub fn try_begin_headers(&self) -> bool {
        self.processing_headers
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_headers(&self) {
        self.processing_headers.store(false, Ordering::Release);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterStatus {
    pub filter_type: FilterType,
    pub header_tip: Position,
    pub filter_tip: Position,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkStatus {
    pub chain: Chain,
    pub local_height: i32,
    pub remote_height: i32,
    pub synchronized: bool,
    pub best_hash: Hash256,
    pub chain_work: U256,
    pub filters: Vec<FilterStatus>,
    pub peers: PeerCounts,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} headers {} remote {} synced {} peers {}/{} best {} work {:#x}",
            self.chain,
            self.local_height,
            self.remote_height,
            self.synchronized,
            self.peers.ready,
            self.peers.connected,
            hash256_to_hex(&self.best_hash),
            self.chain_work
        )?;
        for filter in &self.filters {
            write!(
                f,
                " {} cfheaders {} cfilters {}",
                filter.filter_type, filter.header_tip.height, filter.filter_tip.height
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub oracle: OracleConfig,
    pub filters: FilterConfig,
    pub peers: PeerManagerConfig,
    pub tick_interval: Duration,
    pub resync_delay: Duration,
    pub apply_timeout: Duration,
}

impl NetworkConfig {
    pub fn new(params: &ChainParams) -> Self {
        Self {
            oracle: OracleConfig::default(),
            filters: FilterConfig::new(vec![params.default_filter_type]),
            peers: PeerManagerConfig::default(),
            tick_interval: TICK_INTERVAL,
            resync_delay: RESYNC_DELAY,
            apply_timeout: HEADERS_APPLY_TIMEOUT,
        }
    }
}

enum NetworkCommand {
    SubmitHeaders {
        peer: PeerId,
        headers: Vec<BlockHeader>,
        reply: oneshot::Sender<bool>,
    },
    UpdateHeight(i32),
    StateMachine,
    HeadersApplied {
        peer: PeerId,
        result: Result<AddHeadersOutcome, String>,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<NetworkStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap handle peers use to reach the coordinator.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::Sender<NetworkCommand>,
}

impl NetworkHandle {
    /// Queues a header batch and waits until it has been applied.
    /// `Ok(false)` means the batch failed to apply.
    pub async fn submit_headers(&self, peer: PeerId, headers: Vec<BlockHeader>) -> Result<bool, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NetworkCommand::SubmitHeaders {
                peer,
                headers,
                reply,
            })
            .await
            .map_err(|_| "network stopped".to_string())?;
        rx.await.map_err(|_| "network stopped".to_string())
    }

    pub fn update_height(&self, height: i32) {
        let _ = self.tx.try_send(NetworkCommand::UpdateHeight(height));
    }

    /// Schedules a state machine tick.
    pub fn poke(&self) {
        let _ = self.tx.try_send(NetworkCommand::StateMachine);
    }

    pub async fn status(&self) -> Option<NetworkStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(NetworkCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }
}

struct PendingBatch {
    peer: PeerId,
    headers: Vec<BlockHeader>,
    reply: oneshot::Sender<bool>,
}

struct Coordinator {
    params: ChainParams,
    config: NetworkConfig,
    tx: mpsc::Sender<NetworkCommand>,
    headers: Arc<HeaderOracle<Store>>,
    filter_store: FilterStore<Store>,
    filters: FilterOracleHandle,
    filter_requests: mpsc::Receiver<FilterRequest>,
    peers: PeerManagerHandle,
    status: Arc<SyncStatus>,
    pending: VecDeque<PendingBatch>,
    last_getheaders: Option<Instant>,
    resync_at: Option<tokio::time::Instant>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<NetworkCommand>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let resync_at = self.resync_at;
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.on_command(command).await {
                        break;
                    }
                }
                Some(request) = self.filter_requests.recv() => self.dispatch_filter_request(request),
                _ = ticker.tick() => self.process_state_machine().await,
                _ = sleep_until(resync_at), if resync_at.is_some() => {
                    self.resync_at = None;
                    self.process_state_machine().await;
                }
            }
        }
        log_debug!("{} network task stopped", self.params.chain);
    }

    /// Returns false once the task should stop.
    async fn on_command(&mut self, command: NetworkCommand) -> bool {
        match command {
            NetworkCommand::SubmitHeaders {
                peer,
                headers,
                reply,
            } => {
                self.pending.push_back(PendingBatch {
                    peer,
                    headers,
                    reply,
                });
                self.start_next_batch();
            }
            NetworkCommand::HeadersApplied {
                peer,
                result,
                reply,
            } => {
                self.status.end_headers();
                self.on_headers_applied(peer, result, reply);
                self.start_next_batch();
                self.process_state_machine().await;
            }
            NetworkCommand::UpdateHeight(height) => {
                if self.status.update_remote(height) {
                    log_debug!("{} remote height now {height}", self.params.chain);
                    self.process_state_machine().await;
                }
            }
            NetworkCommand::StateMachine => self.process_state_machine().await,
            NetworkCommand::Status { reply } => {
                let status = self.snapshot().await;
                let _ = reply.send(status);
            }
            NetworkCommand::Shutdown { reply } => {
                self.peers.shutdown().await;
                self.filters.shutdown().await;
                for batch in self.pending.drain(..) {
                    let _ = batch.reply.send(false);
                }
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Applies the next queued batch on the blocking pool unless one is
    /// already being applied.
    fn start_next_batch(&mut self) {
        if self.pending.is_empty() || !self.status.try_begin_headers() {
            return;
        }
        let Some(batch) = self.pending.pop_front() else {
            self.status.end_headers();
            return;
        };
        let oracle = Arc::clone(&self.headers);
        let tx = self.tx.clone();
        let apply_timeout = self.config.apply_timeout;
        tokio::spawn(async move {
            let PendingBatch {
                peer,
                headers,
                reply,
            } = batch;
            let task = tokio::task::spawn_blocking(move || oracle.add_headers(&headers));
            let result = match timeout(apply_timeout, task).await {
                Ok(Ok(Ok(outcome))) => Ok(outcome),
                Ok(Ok(Err(err))) => Err(err.to_string()),
                Ok(Err(err)) => Err(format!("header task failed: {err}")),
                Err(_) => Err("header batch still applying".to_string()),
            };
            let _ = tx
                .send(NetworkCommand::HeadersApplied {
                    peer,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn on_headers_applied(
        &mut self,
        peer: PeerId,
        result: Result<AddHeadersOutcome, String>,
        reply: oneshot::Sender<bool>,
    ) {
        let best = self.headers.best_tip();
        self.status.set_local(best.height);
        match result {
            Ok(outcome) => {
                if !outcome.rejected.is_empty() {
                    log_warn!(
                        "peer {peer} sent {} invalid header(s)",
                        outcome.rejected.len()
                    );
                }
                if outcome.best_changed() {
                    log_info!(
                        "block header chain updated to hash {} at height {}",
                        hash256_to_hex(&best.hash),
                        best.height
                    );
                }
                let _ = reply.send(true);
            }
            Err(err) => {
                log_warn!("header batch from peer {peer} not applied: {err}");
                let _ = reply.send(false);
            }
        }
    }

    fn dispatch_filter_request(&self, request: FilterRequest) {
        let job = match request {
            FilterRequest::Headers { .. } => Job::Getcfheaders(request),
            FilterRequest::Filters { .. } => Job::Getcfilters(request),
        };
        if !self.peers.dispatch(job) {
            log_debug!(
                "{} request from {} not queued",
                request.filter_type(),
                request.start_height()
            );
        }
    }

    /// Runs a filter check while draining the request channel, so the
    /// oracle never blocks on a full channel that only this task reads.
    async fn check_filters(&mut self) {
        let check = self.filters.check_blocks();
        tokio::pin!(check);
        let result = loop {
            tokio::select! {
                result = &mut check => break result,
                Some(request) = self.filter_requests.recv() => self.dispatch_filter_request(request),
            }
        };
        while let Ok(request) = self.filter_requests.try_recv() {
            self.dispatch_filter_request(request);
        }
        if let Err(err) = result {
            if err.is_protocol_violation() {
                log_warn!("filter check failed: {err}");
            } else {
                log_error!("filter check failed: {err}");
            }
        }
    }

    async fn process_state_machine(&mut self) {
        self.check_filters().await;
        if let Some(id) = self.peers.run().await {
            log_debug!("{} connecting peer {id}", self.params.chain);
        }
        self.status.set_local(self.headers.best_tip().height);
        if self.status.is_synchronized() {
            self.resync_at = None;
            return;
        }
        let due = self
            .last_getheaders
            .map_or(true, |sent| sent.elapsed() >= GETHEADERS_DISPATCH_INTERVAL);
        if due && !self.status.processing_headers() && self.peers.dispatch(Job::Getheaders) {
            self.last_getheaders = Some(Instant::now());
        }
        if self.resync_at.is_none() {
            self.resync_at = Some(tokio::time::Instant::now() + self.config.resync_delay);
        }
    }

    async fn snapshot(&self) -> NetworkStatus {
        let best = self.headers.current_best();
        let filters = self
            .config
            .filters
            .filter_types
            .iter()
            .map(|&filter_type| FilterStatus {
                filter_type,
                header_tip: self
                    .filter_store
                    .filter_header_tip(filter_type)
                    .unwrap_or_else(|_| Position::blank()),
                filter_tip: self
                    .filter_store
                    .filter_tip(filter_type)
                    .unwrap_or_else(|_| Position::blank()),
            })
            .collect();
        NetworkStatus {
            chain: self.params.chain,
            local_height: best.height,
            remote_height: self.status.remote_height(),
            synchronized: self.status.is_synchronized(),
            best_hash: best.hash,
            chain_work: work_from_bytes(&best.work),
            filters,
            peers: self.peers.status().await,
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A running sync client for one chain.
pub struct Network {
    chain: Chain,
    handle: NetworkHandle,
    status: Arc<SyncStatus>,
    events: ChainEvents,
    peers: PeerManagerHandle,
    task: JoinHandle<()>,
}

impl Network {
    /// Opens the chain's stores and spawns its tasks. Must run inside a
    /// tokio runtime.
    pub fn start(params: ChainParams, store: Store, config: NetworkConfig) -> Result<Self, String> {
        let header_store =
            HeaderStore::open(Arc::clone(&store), &params).map_err(|err| err.to_string())?;
        let events = ChainEvents::new();
        let headers = Arc::new(HeaderOracle::new(
            header_store,
            params.clone(),
            config.oracle,
            events.clone(),
        ));
        let sync = FilterSync::new(
            Arc::clone(&headers),
            FilterStore::new(Arc::clone(&store)),
            config.filters.clone(),
            events.clone(),
        );
        let (request_tx, filter_requests) = mpsc::channel(FILTER_REQUEST_CAPACITY);
        let filters = FilterOracle::start(sync, request_tx);

        let best = headers.best_tip();
        let status = Arc::new(SyncStatus::new(best.height));
        let peer_db = Arc::new(PeerDb::new(Arc::clone(&store), params.chain));
        let queues = Arc::new(JobQueues::default());
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = NetworkHandle { tx: tx.clone() };

        let ctx = PeerContext {
            params: params.clone(),
            headers: Arc::clone(&headers),
            filters: filters.clone(),
            network: handle.clone(),
            status: Arc::clone(&status),
            peer_db: Arc::clone(&peer_db),
            queues: Arc::clone(&queues),
        };
        let peers = PeerManager::start(
            params.clone(),
            config.peers.clone(),
            peer_db,
            queues,
            Arc::new(TcpSpawner::new(ctx)),
        );

        log_info!(
            "{} client starting at height {} ({})",
            params.chain,
            best.height,
            hash256_to_hex(&best.hash)
        );
        let coordinator = Coordinator {
            params: params.clone(),
            config,
            tx,
            headers,
            filter_store: FilterStore::new(store),
            filters,
            filter_requests,
            peers: peers.clone(),
            status: Arc::clone(&status),
            pending: VecDeque::new(),
            last_getheaders: None,
            resync_at: None,
        };
        let task = tokio::spawn(coordinator.run(rx));
        handle.poke();
        Ok(Self {
            chain: params.chain,
            handle,
            status,
            events,
            peers,
            task,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn handle(&self) -> NetworkHandle {
        self.handle.clone()
    }

    pub fn peers(&self) -> &PeerManagerHandle {
        &self.peers
    }

    pub fn is_synchronized(&self) -> bool {
        self.status.is_synchronized()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> Option<NetworkStatus> {
        self.handle.status().await
    }

    /// Stops peers, then the filter oracle, then the coordinator.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self
            .handle
            .tx
            .send(NetworkCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        if timeout(STOP_TIMEOUT, self.task).await.is_err() {
            log_warn!("{} network task did not stop in time", self.chain);
        }
        log_info!("{} client stopped", self.chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_consensus::chain_params;
    use cfsync_pow::{compact_to_target, hash_meets_target};
    use cfsync_storage::memory::MemoryStore;
    use cfsync_storage::{
        Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch,
    };
    use std::sync::atomic::AtomicBool;
    use std::sync::{Condvar, Mutex};

    const REGTEST_BITS: u32 = 0x207f_ffff;

    /// Memory store whose header index writes wait while the gate is held.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        held: Mutex<bool>,
        released: Condvar,
        waiting: AtomicBool,
    }

    impl GatedStore {
        fn hold(&self) {
            *self.held.lock().expect("gate") = true;
        }

        fn release(&self) {
            *self.held.lock().expect("gate") = false;
            self.released.notify_all();
        }
    }

    impl KeyValueStore for GatedStore {
        fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(column, key)
        }

        fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.inner.put(column, key, value)
        }

        fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
            self.inner.delete(column, key)
        }

        fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
            self.inner.scan_prefix(column, prefix)
        }

        fn for_each_prefix<'a>(
            &self,
            column: Column,
            prefix: &[u8],
            visitor: &mut PrefixVisitor<'a>,
        ) -> Result<(), StoreError> {
            self.inner.for_each_prefix(column, prefix, visitor)
        }

        fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
            if batch.touched() & Column::HeaderIndex.bit() != 0 {
                let mut held = self.held.lock().expect("gate");
                while *held {
                    self.waiting.store(true, Ordering::Release);
                    held = self.released.wait(held).expect("gate");
                }
            }
            self.inner.write_batch(batch)
        }
    }

    fn start_regtest(store: Store, apply_timeout: Duration) -> Network {
        let params = chain_params(Chain::Regtest);
        let mut config = NetworkConfig::new(&params);
        config.peers.min_peers = 0;
        config.apply_timeout = apply_timeout;
        Network::start(params, store, config).expect("start network")
    }

    fn mine_chain(parent: Hash256, len: usize) -> Vec<BlockHeader> {
        let target = compact_to_target(REGTEST_BITS).expect("target");
        let mut prev = parent;
        let mut headers = Vec::with_capacity(len);
        for index in 0..len {
            let mut header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [7u8; 32],
                time: 1_600_000_000 + index as u32 * 600,
                bits: REGTEST_BITS,
                nonce: 0,
            };
            while !hash_meets_target(&header.hash(), &target) {
                header.nonce += 1;
            }
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn remote_height_only_grows() {
        let status = SyncStatus::new(10);
        assert!(status.is_synchronized());
        assert!(status.update_remote(12));
        assert!(!status.update_remote(11));
        assert_eq!(status.remote_height(), 12);
        assert!(!status.is_synchronized());
        status.set_local(12);
        assert!(status.is_synchronized());
    }

    #[test]
    fn header_guard_is_single_flight() {
        let status = SyncStatus::new(0);
        assert!(status.try_begin_headers());
        assert!(!status.try_begin_headers());
        status.end_headers();
        assert!(status.try_begin_headers());
    }

    #[tokio::test]
    async fn submitted_headers_raise_local_height() {
        let params = chain_params(Chain::Regtest);
        let store: Store = Arc::new(MemoryStore::new());
        let mut config = NetworkConfig::new(&params);
        config.peers.min_peers = 0;
        let network = Network::start(params, store, config).expect("start network");
        let mut events = network.subscribe();

        let status = network.status().await.expect("status");
        assert_eq!(status.local_height, 0);
        let genesis = status.best_hash;

        let headers = mine_chain(genesis, 3);
        let tip = headers[2].hash();
        let applied = network
            .handle()
            .submit_headers(1, headers)
            .await
            .expect("submit");
        assert!(applied);

        let status = network.status().await.expect("status");
        assert_eq!(status.local_height, 3);
        assert_eq!(status.best_hash, tip);
        assert!(status.chain_work > U256::zero());

        let mut saw_tip = false;
        while let Ok(event) = events.try_recv() {
            if event == ChainEvent::BestTip(Position::new(3, tip)) {
                saw_tip = true;
            }
        }
        assert!(saw_tip);
        network.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_batches_apply_in_arrival_order() {
        let network = start_regtest(Arc::new(MemoryStore::new()), HEADERS_APPLY_TIMEOUT);
        let mut events = network.subscribe();
        let genesis = network.status().await.expect("status").best_hash;
        let headers = mine_chain(genesis, 6);
        let (first, second) = headers.split_at(3);

        let handle = network.handle();
        let (a, b) = tokio::join!(
            handle.submit_headers(1, first.to_vec()),
            handle.submit_headers(2, second.to_vec())
        );
        assert_eq!(a, Ok(true));
        assert_eq!(b, Ok(true));

        let mut tips = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChainEvent::BestTip(position) = event {
                tips.push(position.height);
            }
        }
        // The second batch would have arrived as orphans and produced a
        // single tip at 6 had it been applied first.
        assert_eq!(tips, vec![3, 6]);
        network.shutdown().await;
    }

    #[tokio::test]
    async fn stuck_batch_releases_the_queue_after_apply_timeout() {
        let store = Arc::new(GatedStore::default());
        let network = start_regtest(store.clone(), Duration::from_millis(200));
        let genesis = network.status().await.expect("status").best_hash;
        let headers = mine_chain(genesis, 6);
        let (first, second) = (headers[..3].to_vec(), headers[3..].to_vec());

        store.hold();
        let handle = network.handle();
        let stuck = tokio::spawn({
            let handle = handle.clone();
            async move { handle.submit_headers(1, first).await }
        });
        while !store.waiting.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = tokio::spawn({
            let handle = handle.clone();
            async move { handle.submit_headers(2, second).await }
        });

        assert_eq!(stuck.await.expect("stuck task"), Ok(false));
        store.release();
        assert_eq!(queued.await.expect("queued task"), Ok(true));

        let status = network.status().await.expect("status");
        assert_eq!(status.local_height, 6);
        assert_eq!(status.best_hash, headers[5].hash());
        network.shutdown().await;
    }
}
