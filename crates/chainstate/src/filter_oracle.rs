//! Filter header and filter synchronization.
//!
//! [`FilterSync`] is the synchronous core: it validates `cfheaders` and
//! `cfilter` payloads against the header chain and decides which ranges to
//! download next. [`FilterOracle`] runs it as a task with its own mailbox and
//! forwards download requests to whoever owns the peers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cfsync_consensus::constants::{MAX_CFHEADERS_PER_MESSAGE, MAX_GETCFILTERS_SIZE};
use cfsync_consensus::{hash256_to_hex, FilterType, Hash256};
use cfsync_log::{log_debug, log_info, log_warn};
use cfsync_primitives::{filter_hash, FilterHeaderChain, Position};
use cfsync_storage::KeyValueStore;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::FilterError;
use crate::events::{ChainEvent, ChainEvents};
use crate::filter_store::{FilterHeaderRecord, FilterStore};
use crate::header_oracle::HeaderOracle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAILBOX_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct FilterConfig {
    pub filter_types: Vec<FilterType>,
    /// Blocks covered by one `getcfheaders`.
    pub cfheaders_window: i32,
    /// Blocks covered by one `getcfilters`.
    pub cfilters_window: i32,
    /// An unanswered request is reissued after this long.
    pub request_timeout: Duration,
}

impl FilterConfig {
    pub fn new(filter_types: Vec<FilterType>) -> Self {
        Self {
            filter_types,
            cfheaders_window: MAX_CFHEADERS_PER_MESSAGE as i32,
            cfilters_window: MAX_GETCFILTERS_SIZE as i32,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterRequest {
    Headers {
        filter_type: FilterType,
        start_height: i32,
        stop_hash: Hash256,
    },
    Filters {
        filter_type: FilterType,
        start_height: i32,
        stop_hash: Hash256,
    },
}

impl FilterRequest {
    pub fn filter_type(&self) -> FilterType {
        match self {
            FilterRequest::Headers { filter_type, .. }
            | FilterRequest::Filters { filter_type, .. } => *filter_type,
        }
    }

    pub fn start_height(&self) -> i32 {
        match self {
            FilterRequest::Headers { start_height, .. }
            | FilterRequest::Filters { start_height, .. } => *start_height,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterHeadersOutcome {
    /// Filter headers written by this call; zero when the range was already known.
    pub stored: usize,
    pub tip: Position,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RequestKind {
    Headers,
    Filters,
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    stop_height: i32,
    issued: Instant,
}

pub struct FilterSync<S> {
    headers: Arc<HeaderOracle<S>>,
    store: FilterStore<S>,
    config: FilterConfig,
    events: ChainEvents,
    in_flight: Mutex<HashMap<(FilterType, RequestKind), InFlight>>,
}

impl<S: KeyValueStore> FilterSync<S> {
    pub fn new(
        headers: Arc<HeaderOracle<S>>,
        store: FilterStore<S>,
        config: FilterConfig,
        events: ChainEvents,
    ) -> Self {
        Self {
            headers,
            store,
            config,
            events,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &FilterStore<S> {
        &self.store
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn filter_header_tip(&self, filter_type: FilterType) -> Result<Position, FilterError> {
        self.store.filter_header_tip(filter_type)
    }

    pub fn filter_tip(&self, filter_type: FilterType) -> Result<Position, FilterError> {
        self.store.filter_tip(filter_type)
    }

    fn best_chain_position(&self, block: &Hash256) -> Result<Position, FilterError> {
        let header = self
            .headers
            .store()
            .try_load_header(block)?
            .ok_or(FilterError::UnknownBlock(*block))?;
        let position = header.position();
        if !self.headers.store().is_on_best_chain(&position)? {
            return Err(FilterError::UnknownBlock(*block));
        }
        Ok(position)
    }

    /// Validates a `cfheaders` payload ending at `stop_hash` and stores the
    /// derived filter headers. Re-adding an already stored range is a no-op.
    pub fn add_headers(
        &self,
        filter_type: FilterType,
        stop_hash: &Hash256,
        previous_header: &Hash256,
        hashes: &[Hash256],
    ) -> Result<FilterHeadersOutcome, FilterError> {
        let stop = self.best_chain_position(stop_hash)?;
        let count = hashes.len() as i32;
        let start = stop.height - count + 1;
        if hashes.is_empty() || start < 0 {
            return Err(FilterError::InvalidChain {
                filter_type,
                height: stop.height,
                reason: "hash count does not fit the stop block",
            });
        }

        let expected_previous = if start == 0 {
            [0u8; 32]
        } else {
            let block = self.headers.best_block(start - 1)?;
            self.store
                .load_filter_header(filter_type, &block)?
                .ok_or(FilterError::MissingFilterHeader { filter_type, block })?
                .header
        };
        if *previous_header != expected_previous {
            log_warn!(
                "{filter_type} cfheaders from height {start} do not chain from our filter header"
            );
            return Err(FilterError::InvalidChain {
                filter_type,
                height: start,
                reason: "previous filter header mismatch",
            });
        }

        let mut records = Vec::with_capacity(hashes.len());
        for (offset, (hash, header)) in FilterHeaderChain::new(*previous_header, hashes).enumerate()
        {
            let height = start + offset as i32;
            let block = self.headers.best_block(height)?;
            let record = FilterHeaderRecord {
                header,
                filter_hash: hash,
            };
            match self.store.load_filter_header(filter_type, &block)? {
                Some(existing) if existing == record => {}
                Some(_) => {
                    log_warn!(
                        "{filter_type} filter header at height {height} conflicts with stored value"
                    );
                    return Err(FilterError::InvalidChain {
                        filter_type,
                        height,
                        reason: "conflicts with stored filter header",
                    });
                }
                None => records.push((block, record)),
            }
        }

        let current = self.store.filter_header_tip(filter_type)?;
        if records.is_empty() {
            return Ok(FilterHeadersOutcome {
                stored: 0,
                tip: current,
            });
        }
        let tip = if stop.height > current.height {
            stop
        } else {
            current
        };
        self.store.store_filter_headers(filter_type, &records, tip)?;
        self.settle(filter_type, RequestKind::Headers, tip.height);
        if tip != current {
            log_debug!("{filter_type} filter header tip now {tip}");
            self.events
                .publish(ChainEvent::FilterHeaderTip { filter_type, tip });
        }
        Ok(FilterHeadersOutcome {
            stored: records.len(),
            tip,
        })
    }

    /// Checks a `cfilter` payload against its filter header and stores it.
    /// Returns the filter tip afterwards.
    pub fn add_filter(
        &self,
        filter_type: FilterType,
        block: &Hash256,
        filter: &[u8],
    ) -> Result<Position, FilterError> {
        let record = self
            .store
            .load_filter_header(filter_type, block)?
            .ok_or(FilterError::MissingFilterHeader {
                filter_type,
                block: *block,
            })?;
        if filter_hash(filter) != record.filter_hash {
            log_warn!(
                "{filter_type} filter for {} does not match its filter header",
                hash256_to_hex(block)
            );
            return Err(FilterError::InvalidFilter {
                filter_type,
                block: *block,
            });
        }
        let current = self.store.filter_tip(filter_type)?;
        if self.store.have_filter(filter_type, block)? {
            return Ok(current);
        }

        let header = self
            .headers
            .store()
            .try_load_header(block)?
            .ok_or(FilterError::UnknownBlock(*block))?;
        let on_best = self.headers.store().is_on_best_chain(&header.position())?;
        let mut tip = None;
        if on_best && header.height == current.height + 1 {
            // Pull the tip over any filters that arrived out of order.
            let mut advanced = header.position();
            let limit = self.store.filter_header_tip(filter_type)?.height;
            while advanced.height < limit {
                let next = self.headers.best_block(advanced.height + 1)?;
                if !self.store.have_filter(filter_type, &next)? {
                    break;
                }
                advanced = Position::new(advanced.height + 1, next);
            }
            tip = Some(advanced);
        }
        self.store.store_filter(filter_type, block, filter, tip)?;
        match tip {
            Some(tip) => {
                self.settle(filter_type, RequestKind::Filters, tip.height);
                self.events.publish(ChainEvent::FilterTip { filter_type, tip });
                Ok(tip)
            }
            None => Ok(current),
        }
    }

    fn settle(&self, filter_type: FilterType, kind: RequestKind, tip_height: i32) {
        let Ok(mut in_flight) = self.in_flight.lock() else {
            return;
        };
        if let Some(request) = in_flight.get(&(filter_type, kind)) {
            if tip_height >= request.stop_height {
                in_flight.remove(&(filter_type, kind));
            }
        }
    }

    /// Walks a tip that left the best chain back to its fork point.
    fn reconcile(&self, tip: Position) -> Result<Position, FilterError> {
        let store = self.headers.store();
        if tip.is_blank() || store.is_on_best_chain(&tip)? {
            return Ok(tip);
        }
        let mut cursor = match store.try_load_header(&tip.hash)? {
            Some(header) => header,
            None => return Ok(Position::blank()),
        };
        while !store.is_on_best_chain(&cursor.position())? {
            cursor = match store.try_load_header(&cursor.header.prev_block)? {
                Some(parent) => parent,
                None => return Ok(Position::blank()),
            };
        }
        Ok(cursor.position())
    }

    /// Rewinds filter and filter header tips that are no longer on the best
    /// chain. Called on reorg and at the start of every check.
    pub fn rewind_stale_tips(&self) -> Result<(), FilterError> {
        for filter_type in self.config.filter_types.clone() {
            let header_tip = self.store.filter_header_tip(filter_type)?;
            let rewound = self.reconcile(header_tip)?;
            if rewound != header_tip {
                log_info!("{filter_type} filter header tip rewound from {header_tip} to {rewound}");
                self.store.set_filter_header_tip(filter_type, rewound)?;
                self.events.publish(ChainEvent::FilterHeaderTip {
                    filter_type,
                    tip: rewound,
                });
            }
            let filter_tip = self.store.filter_tip(filter_type)?;
            let rewound = self.reconcile(filter_tip)?;
            if rewound != filter_tip {
                log_info!("{filter_type} filter tip rewound from {filter_tip} to {rewound}");
                self.store.set_filter_tip(filter_type, rewound)?;
                self.events.publish(ChainEvent::FilterTip {
                    filter_type,
                    tip: rewound,
                });
            }
        }
        self.in_flight
            .lock()
            .map_err(|_| FilterError::Poisoned("filter request"))?
            .clear();
        Ok(())
    }

    pub fn check_blocks(&self) -> Result<Vec<FilterRequest>, FilterError> {
        self.check_blocks_at(Instant::now())
    }

    /// Compares every filter type's tips with the header tip and returns the
    /// next bounded download for each one that is behind and not already
    /// waiting on a live request.
    pub fn check_blocks_at(&self, now: Instant) -> Result<Vec<FilterRequest>, FilterError> {
        let best = self.headers.best_tip();
        let mut requests = Vec::new();
        for filter_type in self.config.filter_types.clone() {
            let mut header_tip = self.store.filter_header_tip(filter_type)?;
            let mut filter_tip = self.store.filter_tip(filter_type)?;
            if self.reconcile(header_tip)? != header_tip || self.reconcile(filter_tip)? != filter_tip
            {
                self.rewind_stale_tips()?;
                header_tip = self.store.filter_header_tip(filter_type)?;
                filter_tip = self.store.filter_tip(filter_type)?;
            }

            if header_tip.height < best.height {
                let start_height = header_tip.height + 1;
                let stop_height = best
                    .height
                    .min(header_tip.height + self.config.cfheaders_window);
                if self.claim(filter_type, RequestKind::Headers, start_height, stop_height, now)? {
                    requests.push(FilterRequest::Headers {
                        filter_type,
                        start_height,
                        stop_hash: self.headers.best_block(stop_height)?,
                    });
                }
            }
            if filter_tip.height < header_tip.height {
                let start_height = filter_tip.height + 1;
                let stop_height = header_tip
                    .height
                    .min(filter_tip.height + self.config.cfilters_window);
                if self.claim(filter_type, RequestKind::Filters, start_height, stop_height, now)? {
                    requests.push(FilterRequest::Filters {
                        filter_type,
                        start_height,
                        stop_hash: self.headers.best_block(stop_height)?,
                    });
                }
            }
        }
        Ok(requests)
    }

    /// Records a request unless a live one already covers `start_height`.
    fn claim(
        &self,
        filter_type: FilterType,
        kind: RequestKind,
        start_height: i32,
        stop_height: i32,
        now: Instant,
    ) -> Result<bool, FilterError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| FilterError::Poisoned("filter request"))?;
        if let Some(request) = in_flight.get(&(filter_type, kind)) {
            let live = now.saturating_duration_since(request.issued) < self.config.request_timeout;
            if live && request.stop_height >= start_height {
                return Ok(false);
            }
        }
        in_flight.insert(
            (filter_type, kind),
            InFlight {
                stop_height,
                issued: now,
            },
        );
        Ok(true)
    }
}

enum FilterCommand {
    AddHeaders {
        filter_type: FilterType,
        stop_hash: Hash256,
        previous_header: Hash256,
        hashes: Vec<Hash256>,
        reply: oneshot::Sender<Result<FilterHeadersOutcome, FilterError>>,
    },
    AddFilter {
        filter_type: FilterType,
        block: Hash256,
        filter: Vec<u8>,
        reply: oneshot::Sender<Result<Position, FilterError>>,
    },
    CheckBlocks {
        reply: oneshot::Sender<Result<Vec<FilterRequest>, FilterError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Mailbox handle to a running filter oracle task.
#[derive(Clone)]
pub struct FilterOracleHandle {
    tx: mpsc::Sender<FilterCommand>,
}

impl FilterOracleHandle {
    async fn call<T>(
        &self,
        command: FilterCommand,
        rx: oneshot::Receiver<Result<T, FilterError>>,
    ) -> Result<T, FilterError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| FilterError::Stopped)?;
        rx.await.map_err(|_| FilterError::Stopped)?
    }

    pub async fn add_headers(
        &self,
        filter_type: FilterType,
        stop_hash: Hash256,
        previous_header: Hash256,
        hashes: Vec<Hash256>,
    ) -> Result<FilterHeadersOutcome, FilterError> {
        let (reply, rx) = oneshot::channel();
        let command = FilterCommand::AddHeaders {
            filter_type,
            stop_hash,
            previous_header,
            hashes,
            reply,
        };
        self.call(command, rx).await
    }

    pub async fn add_filter(
        &self,
        filter_type: FilterType,
        block: Hash256,
        filter: Vec<u8>,
    ) -> Result<Position, FilterError> {
        let (reply, rx) = oneshot::channel();
        let command = FilterCommand::AddFilter {
            filter_type,
            block,
            filter,
            reply,
        };
        self.call(command, rx).await
    }

    /// Runs one check; the resulting requests are also forwarded to the
    /// oracle's request channel.
    pub async fn check_blocks(&self) -> Result<Vec<FilterRequest>, FilterError> {
        let (reply, rx) = oneshot::channel();
        self.call(FilterCommand::CheckBlocks { reply }, rx).await
    }

    /// Asks the task to stop and waits until it has drained its mailbox.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(FilterCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct FilterOracle;

impl FilterOracle {
    /// Spawns the oracle task. Download requests produced by `check_blocks`
    /// go to `requests`; a full channel makes the oracle wait.
    pub fn start<S>(
        sync: FilterSync<S>,
        requests: mpsc::Sender<FilterRequest>,
    ) -> FilterOracleHandle
    where
        S: KeyValueStore + 'static,
    {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let chain_events = sync.events.subscribe();
        tokio::spawn(run_filter_oracle(sync, rx, chain_events, requests));
        FilterOracleHandle { tx }
    }
}

async fn run_filter_oracle<S: KeyValueStore>(
    sync: FilterSync<S>,
    mut rx: mpsc::Receiver<FilterCommand>,
    mut chain_events: broadcast::Receiver<ChainEvent>,
    requests: mpsc::Sender<FilterRequest>,
) {
    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    FilterCommand::AddHeaders {
                        filter_type,
                        stop_hash,
                        previous_header,
                        hashes,
                        reply,
                    } => {
                        let result = sync.add_headers(filter_type, &stop_hash, &previous_header, &hashes);
                        let _ = reply.send(result);
                    }
                    FilterCommand::AddFilter {
                        filter_type,
                        block,
                        filter,
                        reply,
                    } => {
                        let _ = reply.send(sync.add_filter(filter_type, &block, &filter));
                    }
                    FilterCommand::CheckBlocks { reply } => {
                        let result = sync.check_blocks();
                        if let Ok(batch) = &result {
                            for request in batch {
                                if requests.send(*request).await.is_err() {
                                    log_debug!("filter request receiver closed");
                                    break;
                                }
                            }
                        }
                        let _ = reply.send(result);
                    }
                    FilterCommand::Shutdown { reply } => {
                        rx.close();
                        while let Ok(pending) = rx.try_recv() {
                            drop(pending);
                        }
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            event = chain_events.recv() => {
                match event {
                    Ok(ChainEvent::Reorg(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Err(err) = sync.rewind_stale_tips() {
                            log_warn!("filter tip rewind failed: {err}");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
        }
    }
    log_debug!("filter oracle stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_windows_follow_protocol_limits() {
        let config = FilterConfig::new(vec![FilterType::Basic]);
        assert_eq!(config.cfheaders_window, 2_000);
        assert_eq!(config.cfilters_window, 1_000);
        assert_eq!(config.request_timeout, REQUEST_TIMEOUT);
    }

    #[test]
    fn request_accessors() {
        let request = FilterRequest::Filters {
            filter_type: FilterType::Extended,
            start_height: 7,
            stop_hash: [0u8; 32],
        };
        assert_eq!(request.filter_type(), FilterType::Extended);
        assert_eq!(request.start_height(), 7);
    }
}
