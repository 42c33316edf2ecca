//! Keeps the client connected to enough peers and shares download work
//! between them.
//!
//! Candidates are tried one at a time, in tiers: the configured default
//! peer, stored addresses serving compact filters, a DNS seed, then any
//! stored address. Work is handed out through [`JobQueues`]; every ready
//! peer pulls the kinds of job its services allow.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cfsync_chainstate::FilterRequest;
use cfsync_consensus::{ChainParams, Hash256};
use cfsync_log::{log_debug, log_info, log_warn};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;

use crate::messages::services;
use crate::peer::{PeerCommand, PeerId, PeerNotice};
use crate::peer_db::{NetworkFamily, PeerAddress, PeerDb, Protocol};
use crate::Store;

pub const DEFAULT_MIN_PEERS: usize = 3;
/// A candidate that failed its handshake is skipped for this long.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DNS_RETRY: Duration = Duration::from_secs(10);
const JOB_QUEUE_CAPACITY: usize = 256;
const MAILBOX_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Job {
    Getheaders,
    Getcfheaders(FilterRequest),
    Getcfilters(FilterRequest),
    /// Sent straight to each peer's mailbox, never queued.
    Heartbeat,
}

impl Job {
    pub fn kind(&self) -> Option<JobKind> {
        match self {
            Job::Getheaders => Some(JobKind::Getheaders),
            Job::Getcfheaders(_) => Some(JobKind::Getcfheaders),
            Job::Getcfilters(_) => Some(JobKind::Getcfilters),
            Job::Heartbeat => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Getheaders,
    Getcfheaders,
    Getcfilters,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Getheaders, JobKind::Getcfheaders, JobKind::Getcfilters];

    fn index(self) -> usize {
        match self {
            JobKind::Getheaders => 0,
            JobKind::Getcfheaders => 1,
            JobKind::Getcfilters => 2,
        }
    }
}

struct JobQueue {
    tx: mpsc::Sender<Job>,
    rx: AsyncMutex<mpsc::Receiver<Job>>,
}

/// One bounded FIFO per job kind. Whichever subscribed peer asks first gets
/// the next job.
pub struct JobQueues {
    queues: [JobQueue; 3],
}

impl Default for JobQueues {
    fn default() -> Self {
        Self::new(JOB_QUEUE_CAPACITY)
    }
}

impl JobQueues {
    pub fn new(capacity: usize) -> Self {
        let queue = || {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            JobQueue {
                tx,
                rx: AsyncMutex::new(rx),
            }
        };
        Self {
            queues: [queue(), queue(), queue()],
        }
    }

    /// Queues `job`; a full queue drops it.
    pub fn push(&self, job: Job) -> bool {
        let Some(kind) = job.kind() else {
            return false;
        };
        match self.queues[kind.index()].tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log_debug!("{kind:?} queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn next(&self, kind: JobKind) -> Option<Job> {
        self.queues[kind.index()].rx.lock().await.recv().await
    }

    pub fn try_next(&self, kind: JobKind) -> Option<Job> {
        let mut rx = self.queues[kind.index()].rx.try_lock().ok()?;
        rx.try_recv().ok()
    }
}

#[derive(Clone, Debug)]
pub struct PeerManagerConfig {
    /// Connections the manager tries to keep open.
    pub min_peers: usize,
    pub default_peer: Option<SocketAddr>,
    pub failure_cooldown: Duration,
    pub heartbeat_interval: Duration,
    pub dns_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            min_peers: DEFAULT_MIN_PEERS,
            default_peer: None,
            failure_cooldown: FAILURE_COOLDOWN,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            dns_timeout: DNS_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

/// Starts a connection task for a chosen candidate. The task must finish
/// with a [`PeerNotice::Closed`] on `notices`.
pub trait PeerSpawner: Send + Sync + 'static {
    fn spawn(
        &self,
        id: PeerId,
        address: PeerAddress,
        mailbox: mpsc::Receiver<PeerCommand>,
        notices: mpsc::Sender<PeerNotice>,
    );
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerCounts {
    pub connected: usize,
    pub ready: usize,
}

enum ManagerCommand {
    AddPeer {
        address: PeerAddress,
        reply: oneshot::Sender<bool>,
    },
    Disconnect(PeerId),
    Run {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    Status {
        reply: oneshot::Sender<PeerCounts>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct PeerManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
    queues: Arc<JobQueues>,
}

impl PeerManagerHandle {
    /// Connects to `address` unless a connection to it is already open.
    pub async fn add_peer(&self, address: PeerAddress) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerCommand::AddPeer { address, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn disconnect(&self, id: PeerId) {
        let _ = self.tx.send(ManagerCommand::Disconnect(id)).await;
    }

    /// One maintenance pass: opens at most one connection if below target.
    pub async fn run(&self) -> Option<PeerId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ManagerCommand::Run { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    pub fn dispatch(&self, job: Job) -> bool {
        self.queues.push(job)
    }

    pub async fn status(&self) -> PeerCounts {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Status { reply }).await.is_err() {
            return PeerCounts::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Entry {
    address: PeerAddress,
    mailbox: mpsc::Sender<PeerCommand>,
    ready: bool,
}

pub struct PeerManager {
    params: ChainParams,
    config: PeerManagerConfig,
    peer_db: Arc<PeerDb<Store>>,
    spawner: Arc<dyn PeerSpawner>,
    peers: HashMap<PeerId, Entry>,
    /// Address ids with an open connection, and how many.
    active: HashMap<Hash256, usize>,
    failures: HashMap<Hash256, Instant>,
    next_id: PeerId,
    last_dns: Option<Instant>,
    notice_tx: mpsc::Sender<PeerNotice>,
}

impl PeerManager {
    pub fn start(
        params: ChainParams,
        config: PeerManagerConfig,
        peer_db: Arc<PeerDb<Store>>,
        queues: Arc<JobQueues>,
        spawner: Arc<dyn PeerSpawner>,
    ) -> PeerManagerHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (notice_tx, notices) = mpsc::channel(NOTICE_CAPACITY);
        let manager = PeerManager {
            params,
            config,
            peer_db,
            spawner,
            peers: HashMap::new(),
            active: HashMap::new(),
            failures: HashMap::new(),
            next_id: 1,
            last_dns: None,
            notice_tx,
        };
        tokio::spawn(manager.run(rx, notices));
        PeerManagerHandle { tx, queues }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ManagerCommand>, mut notices: mpsc::Receiver<PeerNotice>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                Some(notice) = notices.recv() => self.on_notice(notice),
                command = rx.recv() => {
                    let Some(command) = command else {
                        self.shutdown(&mut notices).await;
                        break;
                    };
                    match command {
                        ManagerCommand::AddPeer { address, reply } => {
                            let _ = reply.send(self.connect(address).is_some());
                        }
                        ManagerCommand::Disconnect(id) => self.disconnect(id),
                        ManagerCommand::Run { reply } => {
                            while let Ok(notice) = notices.try_recv() {
                                self.on_notice(notice);
                            }
                            let _ = reply.send(self.maintain().await);
                        }
                        ManagerCommand::Status { reply } => {
                            let _ = reply.send(self.counts());
                        }
                        ManagerCommand::Shutdown { reply } => {
                            self.shutdown(&mut notices).await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }
    }

    fn counts(&self) -> PeerCounts {
        PeerCounts {
            connected: self.peers.len(),
            ready: self.peers.values().filter(|entry| entry.ready).count(),
        }
    }

    fn on_notice(&mut self, notice: PeerNotice) {
        match notice {
            PeerNotice::Ready { id, services } => {
                if let Some(entry) = self.peers.get_mut(&id) {
                    entry.ready = true;
                    entry.address.set_services(services);
                    self.failures.remove(&entry.address.id());
                }
            }
            PeerNotice::Closed {
                id,
                handshake_complete,
            } => {
                let Some(entry) = self.peers.remove(&id) else {
                    return;
                };
                let key = entry.address.id();
                if let Some(count) = self.active.get_mut(&key) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.active.remove(&key);
                    }
                }
                if handshake_complete {
                    log_info!("peer {id} {} disconnected", entry.address);
                } else {
                    log_debug!("peer {id} {} failed before handshake", entry.address);
                    self.failures.insert(key, Instant::now());
                }
            }
        }
    }

    fn cooling_down(&self, id: &Hash256) -> bool {
        self.failures
            .get(id)
            .is_some_and(|failed| failed.elapsed() < self.config.failure_cooldown)
    }

    fn excluded(&self) -> HashSet<Hash256> {
        let mut exclude: HashSet<Hash256> = self.active.keys().copied().collect();
        exclude.extend(
            self.failures
                .iter()
                .filter(|(_, failed)| failed.elapsed() < self.config.failure_cooldown)
                .map(|(id, _)| *id),
        );
        exclude
    }

    fn connect(&mut self, address: PeerAddress) -> Option<PeerId> {
        if address.chain != self.params.chain {
            log_warn!(
                "refusing {} peer {address} on the {} client",
                address.chain,
                self.params.chain
            );
            return None;
        }
        let key = address.id();
        if self.active.contains_key(&key) {
            return None;
        }
        address.socket_addr()?;
        let id = self.next_id;
        self.next_id += 1;
        let (mailbox, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        log_debug!("connecting to peer {id} {address}");
        self.spawner
            .spawn(id, address.clone(), inbox, self.notice_tx.clone());
        *self.active.entry(key).or_insert(0) += 1;
        self.peers.insert(
            id,
            Entry {
                address,
                mailbox,
                ready: false,
            },
        );
        Some(id)
    }

    async fn maintain(&mut self) -> Option<PeerId> {
        if self.peers.len() >= self.config.min_peers {
            return None;
        }
        let candidate = self.next_candidate().await?;
        self.connect(candidate)
    }

    async fn next_candidate(&mut self) -> Option<PeerAddress> {
        let chain = self.params.chain;
        if let Some(default) = self.config.default_peer {
            let address = PeerAddress::new(chain, default, 0);
            let key = address.id();
            if !self.active.contains_key(&key) && !self.cooling_down(&key) {
                return Some(address);
            }
        }
        let exclude = self.excluded();
        if let Some(address) = self.from_db(services::COMPACT_FILTERS, &exclude) {
            return Some(address);
        }
        if let Some(address) = self.from_dns(&exclude).await {
            return Some(address);
        }
        self.from_db(0, &exclude)
    }

    fn from_db(&self, services: u64, exclude: &HashSet<Hash256>) -> Option<PeerAddress> {
        match self
            .peer_db
            .get(Protocol::Bitcoin, &NetworkFamily::ALL, services, exclude)
        {
            Ok(found) => found,
            Err(err) => {
                log_warn!("peer database lookup failed: {err}");
                None
            }
        }
    }

    async fn from_dns(&mut self, exclude: &HashSet<Hash256>) -> Option<PeerAddress> {
        let seed = *self.params.dns_seeds.choose(&mut rand::thread_rng())?;
        if self
            .last_dns
            .is_some_and(|last| last.elapsed() < DNS_RETRY)
        {
            return None;
        }
        self.last_dns = Some(Instant::now());
        let host = format!("{seed}:{}", self.params.default_port);
        let entries = match timeout(self.config.dns_timeout, tokio::net::lookup_host(host)).await {
            Ok(Ok(entries)) => entries.collect::<Vec<_>>(),
            Ok(Err(err)) => {
                log_debug!("failed to resolve {seed}: {err}");
                return None;
            }
            Err(_) => {
                log_debug!("timed out resolving {seed}");
                return None;
            }
        };
        let chain = self.params.chain;
        let addresses = entries
            .into_iter()
            .map(|addr| PeerAddress::new(chain, addr, services::NETWORK))
            .collect::<Vec<_>>();
        match self.peer_db.import(&addresses) {
            Ok(added) => log_debug!("dns seed {seed} gave {} address(es), {added} new", addresses.len()),
            Err(err) => log_warn!("failed to store seed addresses: {err}"),
        }
        addresses
            .into_iter()
            .filter(|address| !exclude.contains(&address.id()))
            .collect::<Vec<_>>()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    fn disconnect(&mut self, id: PeerId) {
        if let Some(entry) = self.peers.get(&id) {
            let _ = entry.mailbox.try_send(PeerCommand::Disconnect);
        }
    }

    fn heartbeat(&mut self) {
        for entry in self.peers.values() {
            if entry.ready {
                let _ = entry.mailbox.try_send(PeerCommand::Job(Job::Heartbeat));
            }
        }
    }

    async fn shutdown(&mut self, notices: &mut mpsc::Receiver<PeerNotice>) {
        if self.peers.is_empty() {
            return;
        }
        log_info!("disconnecting {} peer(s)", self.peers.len());
        for entry in self.peers.values() {
            let _ = entry.mailbox.try_send(PeerCommand::Disconnect);
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while !self.peers.is_empty() {
            match tokio::time::timeout_at(deadline, notices.recv()).await {
                Ok(Some(notice)) => self.on_notice(notice),
                Ok(None) | Err(_) => break,
            }
        }
        if !self.peers.is_empty() {
            log_warn!("{} peer(s) did not close in time", self.peers.len());
        }
        self.peers.clear();
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(start_height: i32) -> FilterRequest {
        FilterRequest::Filters {
            filter_type: cfsync_consensus::FilterType::Basic,
            start_height,
            stop_hash: [0u8; 32],
        }
    }

    #[tokio::test]
    async fn job_queues_are_fifo_per_kind_and_bounded() {
        let queues = JobQueues::new(2);
        assert!(queues.push(Job::Getcfilters(request(1))));
        assert!(queues.push(Job::Getcfilters(request(2))));
        assert!(!queues.push(Job::Getcfilters(request(3))));
        assert!(queues.push(Job::Getheaders));
        assert!(!queues.push(Job::Heartbeat));

        assert_eq!(queues.next(JobKind::Getcfilters).await, Some(Job::Getcfilters(request(1))));
        assert_eq!(queues.try_next(JobKind::Getcfilters), Some(Job::Getcfilters(request(2))));
        assert_eq!(queues.try_next(JobKind::Getcfilters), None);
        assert_eq!(queues.try_next(JobKind::Getheaders), Some(Job::Getheaders));
    }
}
