//! One outbound connection.
//!
//! [`PeerSession`] is the protocol state machine: it consumes decoded
//! messages and returns [`PeerAction`]s without touching the socket, so the
//! handshake, ping and single-flight rules can be exercised directly.
//! [`run_peer`] owns the socket and carries the actions out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cfsync_chainstate::{FilterOracleHandle, FilterRequest, HeaderOracle};
use cfsync_consensus::constants::{MIN_PEER_PROTO_VERSION, PROTOCOL_VERSION, SENDHEADERS_VERSION};
use cfsync_consensus::{hash256_to_hex, Chain, ChainParams, FilterType, Hash256};
use cfsync_log::{log_debug, log_info, log_trace, log_warn};
use cfsync_primitives::BlockHeader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::messages::{
    services, BlockLocator, FilterRange, Message, NetAddress, VersionMessage,
};
use crate::network::{NetworkHandle, SyncStatus};
use crate::peer_db::{unix_now, PeerAddress, PeerDb};
use crate::peer_manager::{Job, JobKind, JobQueues, PeerSpawner};
use crate::wire::{read_frame, write_frame, RawMessage, WireError};
use crate::Store;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// A `getheaders` without a reply for this long may be reissued.
pub const GETHEADERS_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a peer waits for its header batch to be applied.
pub const HEADERS_SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
/// An unanswered ping older than this closes the connection.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);
const INBOUND_QUEUE: usize = 64;
pub const USER_AGENT: &str = concat!("/cfsync:", env!("CARGO_PKG_VERSION"), "/");

pub type PeerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    HandshakeSent,
    Ready,
    Disconnecting,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerAction {
    Send(Message),
    SubmitHeaders(Vec<BlockHeader>),
    SubmitFilterHeaders {
        filter_type: FilterType,
        stop_hash: Hash256,
        previous_header: Hash256,
        hashes: Vec<Hash256>,
    },
    SubmitFilter {
        filter_type: FilterType,
        block: Hash256,
        filter: Vec<u8>,
    },
    ImportAddresses(Vec<PeerAddress>),
    UpdateHeight(i32),
    UpdateServices(u64),
    /// An announcement made more headers worth asking for.
    RequestHeaders,
    Ready(Vec<JobKind>),
    Disconnect(String),
}

pub struct PeerSession {
    id: PeerId,
    chain: Chain,
    remote: SocketAddr,
    state: PeerState,
    incoming_ack: bool,
    outgoing_ack: bool,
    got_version: bool,
    protocol_version: i32,
    remote_services: u64,
    remote_height: i32,
    user_agent: String,
    /// Carried in our `version`; seeing it come back means we dialed ourselves.
    session_nonce: u64,
    outstanding_ping: Option<(u64, Instant)>,
    getheaders_sent: Option<Instant>,
    subscriptions: Vec<JobKind>,
}

impl PeerSession {
    pub fn new(id: PeerId, chain: Chain, remote: SocketAddr, session_nonce: u64) -> Self {
        Self {
            id,
            chain,
            remote,
            state: PeerState::Connecting,
            incoming_ack: false,
            outgoing_ack: false,
            got_version: false,
            protocol_version: PROTOCOL_VERSION,
            remote_services: 0,
            remote_height: -1,
            user_agent: String::new(),
            session_nonce,
            outstanding_ping: None,
            getheaders_sent: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn connected(&self) -> bool {
        matches!(self.state, PeerState::HandshakeSent | PeerState::Ready)
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn remote_services(&self) -> u64 {
        self.remote_services
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn subscribed(&self, kind: JobKind) -> bool {
        self.is_ready() && self.subscriptions.contains(&kind)
    }

    pub fn getheaders_in_flight(&self, now: Instant) -> bool {
        self.getheaders_sent
            .is_some_and(|sent| now.duration_since(sent) < GETHEADERS_TIMEOUT)
    }

    /// Opens the handshake once the transport is up.
    pub fn start(&mut self, best_height: i32, timestamp: i64) -> Vec<PeerAction> {
        if self.state != PeerState::Connecting {
            return Vec::new();
        }
        self.state = PeerState::HandshakeSent;
        vec![PeerAction::Send(Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp,
            receiver: NetAddress::from_socket(self.remote, 0),
            sender: NetAddress::unroutable(),
            nonce: self.session_nonce,
            user_agent: USER_AGENT.to_string(),
            start_height: best_height,
            relay: false,
        }))]
    }

    pub fn disconnect(&mut self, reason: impl Into<String>) -> Vec<PeerAction> {
        if !self.connected() && self.state != PeerState::Connecting {
            return Vec::new();
        }
        self.state = PeerState::Disconnecting;
        vec![PeerAction::Disconnect(reason.into())]
    }

    pub fn closed(&mut self) {
        self.state = PeerState::Closed;
    }

    pub fn handle(&mut self, message: Message, now: Instant) -> Vec<PeerAction> {
        if !self.connected() {
            return Vec::new();
        }
        if !self.got_version && !matches!(message, Message::Version(_)) {
            return self.disconnect(format!("{} before version", message.name()));
        }
        match message {
            Message::Version(version) => self.on_version(version),
            Message::Verack => {
                self.incoming_ack = true;
                self.check_handshake()
            }
            Message::Ping(nonce) => {
                if nonce == self.session_nonce {
                    return self.disconnect("ping carries our own nonce (self-connection)");
                }
                if self
                    .outstanding_ping
                    .is_some_and(|(outstanding, _)| outstanding == nonce)
                {
                    return self.disconnect("ping echoes our outstanding ping (self-connection)");
                }
                vec![PeerAction::Send(Message::Pong(nonce))]
            }
            Message::Pong(nonce) => self.on_pong(nonce),
            Message::Headers(headers) => {
                self.getheaders_sent = None;
                if headers.is_empty() {
                    return Vec::new();
                }
                vec![PeerAction::SubmitHeaders(headers)]
            }
            Message::Inv(items) => {
                if items.iter().any(|item| item.is_block()) {
                    vec![PeerAction::RequestHeaders]
                } else {
                    Vec::new()
                }
            }
            Message::Addr(entries) => {
                let addresses = entries
                    .iter()
                    .map(|entry| entry.address)
                    .filter(|address| {
                        let addr = address.socket_addr();
                        addr.port() != 0 && !addr.ip().is_unspecified() && !addr.ip().is_loopback()
                    })
                    .map(|address| PeerAddress::new(self.chain, address.socket_addr(), address.services))
                    .collect::<Vec<_>>();
                if addresses.is_empty() {
                    return Vec::new();
                }
                vec![PeerAction::ImportAddresses(addresses)]
            }
            Message::Cfheaders(cfheaders) => {
                let Some(filter_type) = FilterType::from_wire_id(cfheaders.filter_type) else {
                    log_debug!("peer {} sent cfheaders of unknown type {}", self.id, cfheaders.filter_type);
                    return Vec::new();
                };
                vec![PeerAction::SubmitFilterHeaders {
                    filter_type,
                    stop_hash: cfheaders.stop_hash,
                    previous_header: cfheaders.previous_header,
                    hashes: cfheaders.filter_hashes,
                }]
            }
            Message::Cfilter(cfilter) => {
                let Some(filter_type) = FilterType::from_wire_id(cfilter.filter_type) else {
                    log_debug!("peer {} sent cfilter of unknown type {}", self.id, cfilter.filter_type);
                    return Vec::new();
                };
                vec![PeerAction::SubmitFilter {
                    filter_type,
                    block: cfilter.block_hash,
                    filter: cfilter.filter,
                }]
            }
            Message::Reject(reject) => {
                log_warn!(
                    "peer {} rejected {}: code {:#04x} {}",
                    self.id,
                    reject.message,
                    reject.code,
                    reject.reason
                );
                Vec::new()
            }
            Message::Feefilter(rate) => {
                log_trace!("peer {} fee filter {rate} sat/kB", self.id);
                Vec::new()
            }
            Message::Sendcmpct { announce, version } => {
                log_trace!("peer {} sendcmpct announce={announce} version={version}", self.id);
                Vec::new()
            }
            Message::Unsupported { command, payload } => {
                log_debug!(
                    "peer {} sent unsupported command {command} ({} bytes)",
                    self.id,
                    payload.len()
                );
                Vec::new()
            }
            other => {
                log_trace!("peer {} sent {}, ignored", self.id, other.name());
                Vec::new()
            }
        }
    }

    fn on_version(&mut self, version: VersionMessage) -> Vec<PeerAction> {
        if self.got_version {
            log_debug!("peer {} sent a second version", self.id);
            return Vec::new();
        }
        self.got_version = true;
        if version.nonce == self.session_nonce {
            return self.disconnect("version carries our own nonce (self-connection)");
        }
        if version.version < MIN_PEER_PROTO_VERSION {
            return self.disconnect(format!("obsolete protocol version {}", version.version));
        }
        self.protocol_version = version.version.min(PROTOCOL_VERSION);
        self.remote_services = version.services;
        self.remote_height = version.start_height;
        self.user_agent = version.user_agent;

        let mut actions = vec![
            PeerAction::UpdateHeight(version.start_height),
            PeerAction::UpdateServices(version.services),
        ];
        if version.services & (services::NETWORK | services::NETWORK_LIMITED) == 0 {
            actions.extend(self.disconnect("peer serves no block headers"));
            return actions;
        }
        actions.push(PeerAction::Send(Message::Verack));
        self.outgoing_ack = true;
        actions.extend(self.check_handshake());
        actions
    }

    fn on_pong(&mut self, nonce: u64) -> Vec<PeerAction> {
        if nonce == self.session_nonce {
            return self.disconnect("pong carries our own nonce (self-connection)");
        }
        match self.outstanding_ping {
            Some((expected, _)) if expected == nonce => {
                self.outstanding_ping = None;
                Vec::new()
            }
            _ => self.disconnect("pong does not match any ping we sent"),
        }
    }

    fn check_handshake(&mut self) -> Vec<PeerAction> {
        if self.state != PeerState::HandshakeSent || !(self.incoming_ack && self.outgoing_ack) {
            return Vec::new();
        }
        self.state = PeerState::Ready;
        self.subscriptions.clear();
        if self.remote_services & (services::NETWORK | services::NETWORK_LIMITED) != 0 {
            self.subscriptions.push(JobKind::Getheaders);
        }
        if self.remote_services & services::COMPACT_FILTERS != 0 {
            self.subscriptions.push(JobKind::Getcfheaders);
            self.subscriptions.push(JobKind::Getcfilters);
        }
        let mut actions = Vec::new();
        if self.protocol_version >= SENDHEADERS_VERSION {
            actions.push(PeerAction::Send(Message::Sendheaders));
        }
        actions.push(PeerAction::Send(Message::Getaddr));
        actions.push(PeerAction::Ready(self.subscriptions.clone()));
        actions
    }

    /// Liveness check. Sends a fresh nonce unless one is still unanswered;
    /// a ping left unanswered past [`PING_TIMEOUT`] closes the connection.
    pub fn ping(&mut self, now: Instant) -> Vec<PeerAction> {
        if !self.is_ready() {
            return Vec::new();
        }
        if let Some((_, sent)) = self.outstanding_ping {
            if now.duration_since(sent) >= PING_TIMEOUT {
                return self.disconnect("ping timed out");
            }
            return Vec::new();
        }
        let mut nonce = rand::random::<u64>();
        while nonce == self.session_nonce {
            nonce = rand::random();
        }
        self.outstanding_ping = Some((nonce, now));
        vec![PeerAction::Send(Message::Ping(nonce))]
    }

    /// Builds a `getheaders` unless one is already outstanding.
    pub fn request_headers(&mut self, locator: Vec<Hash256>, now: Instant) -> Option<Message> {
        if !self.is_ready() || self.getheaders_in_flight(now) || locator.is_empty() {
            return None;
        }
        self.getheaders_sent = Some(now);
        Some(Message::Getheaders(BlockLocator {
            version: self.protocol_version as u32,
            locator,
            stop: [0u8; 32],
        }))
    }

    pub fn filter_request(&self, request: FilterRequest) -> Option<Message> {
        if self.remote_services & services::COMPACT_FILTERS == 0 {
            return None;
        }
        let range = FilterRange {
            filter_type: request.filter_type().wire_id(),
            start_height: u32::try_from(request.start_height()).ok()?,
            stop_hash: match request {
                FilterRequest::Headers { stop_hash, .. } | FilterRequest::Filters { stop_hash, .. } => {
                    stop_hash
                }
            },
        };
        Some(match request {
            FilterRequest::Headers { .. } => Message::Getcfheaders(range),
            FilterRequest::Filters { .. } => Message::Getcfilters(range),
        })
    }
}

#[derive(Debug)]
pub enum PeerCommand {
    Job(Job),
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerNotice {
    Ready {
        id: PeerId,
        services: u64,
    },
    Closed {
        id: PeerId,
        /// False when the connection never completed its handshake.
        handshake_complete: bool,
    },
}

/// Everything a connection needs from the rest of the client.
#[derive(Clone)]
pub struct PeerContext {
    pub params: ChainParams,
    pub headers: Arc<HeaderOracle<Store>>,
    pub filters: FilterOracleHandle,
    pub network: NetworkHandle,
    pub status: Arc<SyncStatus>,
    pub peer_db: Arc<PeerDb<Store>>,
    pub queues: Arc<JobQueues>,
}

struct Connection {
    ctx: PeerContext,
    address: PeerAddress,
    session: PeerSession,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn send(&mut self, message: &Message) -> Result<(), String> {
        let frame = message
            .to_frame(&self.ctx.params)
            .map_err(|err| err.to_string())?;
        timeout(SEND_TIMEOUT, write_frame(&mut self.writer, &frame))
            .await
            .map_err(|_| "peer write timed out".to_string())?
            .map_err(|err| err.to_string())?;
        log_trace!("peer {} <- {}", self.session.id(), message.name());
        Ok(())
    }

    fn locator(&self) -> Vec<Hash256> {
        match self.ctx.headers.recent_hashes() {
            Ok(hashes) => hashes,
            Err(err) => {
                log_warn!("cannot build block locator: {err}");
                Vec::new()
            }
        }
    }

    async fn request_headers(&mut self) -> Result<(), String> {
        let locator = self.locator();
        if let Some(message) = self.session.request_headers(locator, Instant::now()) {
            self.send(&message).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, actions: Vec<PeerAction>) -> Result<(), String> {
        let mut pending = std::collections::VecDeque::from(actions);
        while let Some(action) = pending.pop_front() {
            match action {
                PeerAction::Send(message) => self.send(&message).await?,
                PeerAction::SubmitHeaders(headers) => self.submit_headers(headers).await?,
                PeerAction::SubmitFilterHeaders {
                    filter_type,
                    stop_hash,
                    previous_header,
                    hashes,
                } => {
                    let result = self
                        .ctx
                        .filters
                        .add_headers(filter_type, stop_hash, previous_header, hashes)
                        .await;
                    match result {
                        Ok(outcome) => {
                            log_debug!(
                                "peer {} cfheaders stored {} ({} tip {})",
                                self.session.id(),
                                outcome.stored,
                                filter_type,
                                outcome.tip.height
                            );
                            self.ctx.network.poke();
                        }
                        Err(err) if err.is_protocol_violation() => {
                            pending.extend(self.session.disconnect(err.to_string()));
                        }
                        Err(err) => log_debug!("peer {} cfheaders not stored: {err}", self.session.id()),
                    }
                }
                PeerAction::SubmitFilter {
                    filter_type,
                    block,
                    filter,
                } => match self.ctx.filters.add_filter(filter_type, block, filter).await {
                    Ok(_) => self.ctx.network.poke(),
                    Err(err) if err.is_protocol_violation() => {
                        pending.extend(self.session.disconnect(err.to_string()));
                    }
                    Err(err) => log_debug!("peer {} cfilter not stored: {err}", self.session.id()),
                },
                PeerAction::ImportAddresses(addresses) => match self.ctx.peer_db.import(&addresses) {
                    Ok(added) if added > 0 => {
                        log_debug!("peer {} taught us {added} new address(es)", self.session.id());
                    }
                    Ok(_) => {}
                    Err(err) => log_warn!("failed to import peer addresses: {err}"),
                },
                PeerAction::UpdateHeight(height) => self.ctx.network.update_height(height),
                PeerAction::UpdateServices(services) => {
                    self.address.set_services(services);
                    if let Err(err) = self.ctx.peer_db.add_or_update(&self.address) {
                        log_warn!("failed to record peer services: {err}");
                    }
                }
                PeerAction::RequestHeaders => self.request_headers().await?,
                PeerAction::Ready(subscriptions) => {
                    self.address.set_last_connected(unix_now());
                    if let Err(err) = self.ctx.peer_db.add_or_update(&self.address) {
                        log_warn!("failed to record peer connection: {err}");
                    }
                    log_info!(
                        "peer {} {} ready: version {} {} height {} services {:#x} jobs {:?}",
                        self.session.id(),
                        self.address,
                        self.session.protocol_version(),
                        self.session.user_agent(),
                        self.session.remote_height(),
                        self.session.remote_services(),
                        subscriptions
                    );
                }
                PeerAction::Disconnect(reason) => {
                    log_warn!("disconnecting peer {} {}: {reason}", self.session.id(), self.address);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn submit_headers(&mut self, headers: Vec<BlockHeader>) -> Result<(), String> {
        let count = headers.len();
        let last = headers.last().map(|header| header.hash());
        let reply = self.ctx.network.submit_headers(self.session.id(), headers);
        match timeout(HEADERS_SUBMIT_TIMEOUT, reply).await {
            Ok(Ok(true)) => {
                if let Some(last) = last {
                    log_trace!(
                        "peer {} delivered {count} header(s) ending {}",
                        self.session.id(),
                        hash256_to_hex(&last)
                    );
                }
            }
            Ok(Ok(false)) => log_debug!("peer {} header batch not applied", self.session.id()),
            Ok(Err(_)) => return Err("network stopped".to_string()),
            Err(_) => log_debug!("peer {} header batch still queued", self.session.id()),
        }
        if !self.ctx.status.is_synchronized() {
            self.request_headers().await?;
        }
        Ok(())
    }

    async fn run_job(&mut self, job: Job) -> Result<(), String> {
        match job {
            Job::Getheaders => self.request_headers().await,
            Job::Getcfheaders(request) | Job::Getcfilters(request) => {
                match self.session.filter_request(request) {
                    Some(message) => self.send(&message).await,
                    None => Ok(()),
                }
            }
            Job::Heartbeat => {
                let actions = self.session.ping(Instant::now());
                self.execute(actions).await
            }
        }
    }

    async fn on_frame(&mut self, frame: Result<RawMessage, WireError>) -> Result<(), String> {
        let message = frame.and_then(|raw| Message::decode(&self.ctx.params.wire, &raw));
        match message {
            Ok(message) => {
                log_trace!("peer {} -> {}", self.session.id(), message.name());
                let actions = self.session.handle(message, Instant::now());
                self.execute(actions).await
            }
            Err(err) if err.is_protocol_violation() => {
                let actions = self.session.disconnect(err.to_string());
                self.execute(actions).await
            }
            Err(err) => {
                log_debug!("peer {} connection lost: {err}", self.session.id());
                self.session.disconnect(err.to_string());
                Ok(())
            }
        }
    }
}

/// Connects to `address` and serves it until either side hangs up.
/// Always ends with a [`PeerNotice::Closed`].
pub async fn run_peer(
    ctx: PeerContext,
    id: PeerId,
    address: PeerAddress,
    mut mailbox: mpsc::Receiver<PeerCommand>,
    notices: mpsc::Sender<PeerNotice>,
) {
    let handshake_complete = serve_peer(ctx, id, address, &mut mailbox, &notices).await;
    let _ = notices
        .send(PeerNotice::Closed {
            id,
            handshake_complete,
        })
        .await;
}

async fn serve_peer(
    ctx: PeerContext,
    id: PeerId,
    address: PeerAddress,
    mailbox: &mut mpsc::Receiver<PeerCommand>,
    notices: &mpsc::Sender<PeerNotice>,
) -> bool {
    let Some(remote) = address.socket_addr() else {
        log_warn!("peer {id} has an unusable address");
        return false;
    };
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            log_warn!("failed to connect to {remote}: {err}");
            return false;
        }
        Err(_) => {
            log_warn!("timed out connecting to {remote}");
            return false;
        }
    };
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();

    // Frames are decoded off the select loop so a slow read never stalls
    // the mailbox; the channel keeps them in arrival order.
    let (frame_tx, mut frames) = mpsc::channel(INBOUND_QUEUE);
    let read_params = ctx.params.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader, &read_params).await;
            let failed = frame.is_err();
            if frame_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    let session = PeerSession::new(id, ctx.params.chain, remote, rand::random());
    let mut conn = Connection {
        ctx,
        address,
        session,
        writer,
    };
    let start = conn.session.start(
        conn.ctx.headers.best_tip().height,
        unix_now() as i64,
    );
    let mut result = conn.execute(start).await;
    let mut announced = false;
    let handshake_deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(handshake_deadline);
    let queues = conn.ctx.queues.clone();

    while result.is_ok() && conn.session.connected() {
        if conn.session.is_ready() && !announced {
            announced = true;
            let _ = notices
                .send(PeerNotice::Ready {
                    id,
                    services: conn.session.remote_services(),
                })
                .await;
        }
        result = tokio::select! {
            biased;
            command = mailbox.recv() => match command {
                Some(PeerCommand::Job(job)) => conn.run_job(job).await,
                Some(PeerCommand::Disconnect) | None => {
                    conn.session.disconnect("requested");
                    Ok(())
                }
            },
            frame = frames.recv() => match frame {
                Some(frame) => conn.on_frame(frame).await,
                None => Err("reader stopped".to_string()),
            },
            _ = &mut handshake_deadline, if !conn.session.is_ready() => {
                let actions = conn.session.disconnect("handshake timed out");
                conn.execute(actions).await
            },
            Some(job) = queues.next(JobKind::Getheaders), if conn.session.subscribed(JobKind::Getheaders) => {
                conn.run_job(job).await
            },
            Some(job) = queues.next(JobKind::Getcfheaders), if conn.session.subscribed(JobKind::Getcfheaders) => {
                conn.run_job(job).await
            },
            Some(job) = queues.next(JobKind::Getcfilters), if conn.session.subscribed(JobKind::Getcfilters) => {
                conn.run_job(job).await
            },
        };
    }
    if let Err(err) = result {
        log_debug!("peer {id} {remote} stopped: {err}");
    }
    reader_task.abort();
    let _ = timeout(SEND_TIMEOUT, tokio::io::AsyncWriteExt::shutdown(&mut conn.writer)).await;
    conn.session.closed();
    announced
}

/// Opens real TCP connections for the peer manager.
pub struct TcpSpawner {
    ctx: PeerContext,
}

impl TcpSpawner {
    pub fn new(ctx: PeerContext) -> Self {
        Self { ctx }
    }
}

impl PeerSpawner for TcpSpawner {
    fn spawn(
        &self,
        id: PeerId,
        address: PeerAddress,
        mailbox: mpsc::Receiver<PeerCommand>,
        notices: mpsc::Sender<PeerNotice>,
    ) {
        tokio::spawn(run_peer(self.ctx.clone(), id, address, mailbox, notices));
    }
}
