//! Header batch application: orphan handling, best chain selection, reorgs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use cfsync_consensus::{hash256_to_hex, BestChainRule, ChainParams, Hash256};
use cfsync_log::{log_debug, log_info, log_warn};
use cfsync_pow::{add_work, check_header, work_from_bytes};
use cfsync_primitives::{BlockHeader, Position};
use cfsync_storage::KeyValueStore;
use primitive_types::U256;

use crate::error::HeaderError;
use crate::events::{ChainEvent, ChainEvents, Reorg};
use crate::header_store::{HeaderStore, StoredHeader};
use crate::update::{DisconnectedList, OrphanHeader, UpdateTransaction};

pub const DEFAULT_MAX_ORPHANS: usize = 4_096;
pub const DEFAULT_ORPHAN_RESOLVE_LIMIT: usize = 2_000;

/// How to rank two tips with the same cumulative metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TieBreak {
    /// Keep whichever tip was connected first.
    FirstSeen,
    /// Prefer the numerically lower block hash.
    LowestHash,
}

impl TieBreak {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "first-seen" => Some(Self::FirstSeen),
            "lowest-hash" => Some(Self::LowestHash),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OracleConfig {
    /// Disconnected headers kept before the oldest are dropped.
    pub max_orphans: usize,
    /// Orphans connected per `add_headers` call; the rest wait for the next call.
    pub orphan_resolve_limit: usize,
    pub tie_break: TieBreak,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            max_orphans: DEFAULT_MAX_ORPHANS,
            orphan_resolve_limit: DEFAULT_ORPHAN_RESOLVE_LIMIT,
            tie_break: TieBreak::FirstSeen,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddHeadersOutcome {
    /// Headers newly connected to the index (including resolved orphans).
    pub connected: usize,
    /// Headers already known (connected or waiting as orphans).
    pub duplicates: usize,
    /// Headers stored as orphans by this call.
    pub orphaned: usize,
    /// Orphans (stored earlier or earlier in this batch) connected once their parent arrived.
    pub resolved: usize,
    pub rejected: Vec<(Hash256, String)>,
    pub best: Option<Position>,
    pub reorg: Option<Reorg>,
}

impl AddHeadersOutcome {
    pub fn best_changed(&self) -> bool {
        self.best.is_some()
    }
}

/// Working state for one `add_headers` call.
struct Batch<'a, S> {
    store: &'a HeaderStore<S>,
    params: &'a ChainParams,
    checkpoint: Option<Position>,
    pending: HashMap<Hash256, StoredHeader>,
    /// Orphans from this call, by parent.
    orphans: BTreeMap<Hash256, Vec<OrphanHeader>>,
    rejected: HashSet<Hash256>,
    update: UpdateTransaction,
    outcome: AddHeadersOutcome,
    resolve_budget: usize,
}

impl<'a, S: KeyValueStore> Batch<'a, S> {
    fn lookup(&self, hash: &Hash256) -> Result<Option<StoredHeader>, HeaderError> {
        if let Some(header) = self.pending.get(hash) {
            return Ok(Some(*header));
        }
        self.store.try_load_header(hash)
    }

    fn known(&self, hash: &Hash256) -> Result<bool, HeaderError> {
        Ok(self.pending.contains_key(hash) || self.store.header_exists(hash)?)
    }

    fn reject(&mut self, hash: Hash256, reason: String) {
        log_warn!("rejected header {}: {reason}", hash256_to_hex(&hash));
        self.rejected.insert(hash);
        self.outcome.rejected.push((hash, reason));
    }

    /// Headers at or below the checkpoint height must lie on the checkpointed chain.
    fn violates_checkpoint(&self, height: i32, hash: &Hash256) -> Result<bool, HeaderError> {
        let Some(checkpoint) = self.checkpoint else {
            return Ok(false);
        };
        if height > checkpoint.height {
            return Ok(false);
        }
        if height == checkpoint.height {
            return Ok(*hash != checkpoint.hash);
        }
        if self.store.best_height() < checkpoint.height {
            return Ok(false);
        }
        Ok(self.store.best_block(height)? != *hash)
    }

    fn connect(
        &mut self,
        hash: Hash256,
        header: BlockHeader,
        parent: StoredHeader,
    ) -> Result<bool, HeaderError> {
        let height = parent.height + 1;
        if self.violates_checkpoint(height, &hash)? {
            self.reject(hash, format!("conflicts with checkpoint at height {height}"));
            return Ok(false);
        }
        let work = match add_work(&parent.work, header.bits) {
            Ok(work) => work,
            Err(err) => {
                self.reject(hash, err.to_string());
                return Ok(false);
            }
        };
        let stored = StoredHeader {
            hash,
            header,
            height,
            work,
        };
        if self.store.is_sibling(&parent.hash)? {
            self.update.remove_sibling(parent.hash);
        }
        self.pending.insert(hash, stored);
        self.update.connect(stored);
        self.outcome.connected += 1;
        Ok(true)
    }

    /// Connects `hash` and then every orphan that was waiting on it, depth
    /// first, until the resolve budget runs out.
    fn connect_with_descendants(
        &mut self,
        hash: Hash256,
        header: BlockHeader,
        parent: StoredHeader,
    ) -> Result<(), HeaderError> {
        if !self.connect(hash, header, parent)? {
            return Ok(());
        }
        let mut stack = vec![hash];
        while let Some(parent_hash) = stack.pop() {
            if self.resolve_budget == 0 {
                break;
            }
            let mut waiting = self.orphans.remove(&parent_hash).unwrap_or_default();
            for stored in self.store.disconnected_children(&parent_hash)? {
                if !waiting.iter().any(|orphan| orphan.hash == stored.hash) {
                    waiting.push(stored);
                }
            }
            for orphan in waiting {
                let Some(parent) = self.lookup(&parent_hash)? else {
                    break;
                };
                if self.resolve_budget == 0 {
                    // Out of budget: keep it disconnected for the next call.
                    self.orphans.entry(parent_hash).or_default().push(orphan);
                    continue;
                }
                self.update.remove_disconnected(orphan.segment());
                if self.known(&orphan.hash)? {
                    continue;
                }
                self.resolve_budget -= 1;
                self.outcome.resolved += 1;
                if self.connect(orphan.hash, orphan.header, parent)? {
                    stack.push(orphan.hash);
                }
            }
        }
        Ok(())
    }
}

pub struct HeaderOracle<S> {
    store: HeaderStore<S>,
    params: ChainParams,
    config: OracleConfig,
    events: ChainEvents,
    apply: Mutex<()>,
}

impl<S: KeyValueStore> HeaderOracle<S> {
    pub fn new(
        store: HeaderStore<S>,
        params: ChainParams,
        config: OracleConfig,
        events: ChainEvents,
    ) -> Self {
        Self {
            store,
            params,
            config,
            events,
            apply: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &HeaderStore<S> {
        &self.store
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn events(&self) -> &ChainEvents {
        &self.events
    }

    pub fn best_block(&self, height: i32) -> Result<Hash256, HeaderError> {
        self.store.best_block(height)
    }

    pub fn best_tip(&self) -> Position {
        self.store.current_best().position()
    }

    pub fn current_best(&self) -> StoredHeader {
        self.store.current_best()
    }

    pub fn recent_hashes(&self) -> Result<Vec<Hash256>, HeaderError> {
        self.store.recent_hashes()
    }

    pub fn is_sibling(&self, hash: &Hash256) -> Result<bool, HeaderError> {
        self.store.is_sibling(hash)
    }

    pub fn sibling_hashes(&self) -> Result<HashSet<Hash256>, HeaderError> {
        self.store.sibling_hashes()
    }

    pub fn disconnected_hashes(&self) -> Result<DisconnectedList, HeaderError> {
        self.store.disconnected_hashes()
    }

    pub fn has_disconnected_children(&self, hash: &Hash256) -> Result<bool, HeaderError> {
        self.store.has_disconnected_children(hash)
    }

    pub fn add_headers(&self, headers: &[BlockHeader]) -> Result<AddHeadersOutcome, HeaderError> {
        self.add_headers_at(headers, crate::unix_now())
    }

    /// Applies a batch of headers as of unix time `now`.
    ///
    /// Malformed headers are rejected one by one; the rest of the batch still
    /// applies. Nothing is written unless the whole update commits.
    pub fn add_headers_at(
        &self,
        headers: &[BlockHeader],
        now: i64,
    ) -> Result<AddHeadersOutcome, HeaderError> {
        let _guard = self
            .apply
            .lock()
            .map_err(|_| HeaderError::Poisoned("header apply"))?;
        let old_best = self.store.current_best();
        let checkpoint = self
            .store
            .have_checkpoint()
            .then(|| self.store.current_checkpoint());
        let mut batch = Batch {
            store: &self.store,
            params: &self.params,
            checkpoint,
            pending: HashMap::new(),
            orphans: BTreeMap::new(),
            rejected: HashSet::new(),
            update: UpdateTransaction::new(),
            outcome: AddHeadersOutcome::default(),
            resolve_budget: self.config.orphan_resolve_limit,
        };

        // Orphans left over from a previous call whose parent is now known.
        for orphan in self.store.disconnected_headers()? {
            if batch.resolve_budget == 0 {
                break;
            }
            if batch.known(&orphan.hash)? {
                batch.update.remove_disconnected(orphan.segment());
                continue;
            }
            let Some(parent) = batch.lookup(&orphan.header.prev_block)? else {
                continue;
            };
            batch.update.remove_disconnected(orphan.segment());
            batch.resolve_budget -= 1;
            batch.outcome.resolved += 1;
            batch.connect_with_descendants(orphan.hash, orphan.header, parent)?;
        }

        let stored_orphans: HashSet<Hash256> = self
            .store
            .disconnected_headers()?
            .into_iter()
            .map(|orphan| orphan.hash)
            .collect();

        for header in headers {
            let hash = match check_header(header, batch.params, now) {
                Ok(hash) => hash,
                Err(err) => {
                    let hash = header.hash_with(self.params.wire.block_hash);
                    batch.reject(hash, err.to_string());
                    continue;
                }
            };
            if batch.known(&hash)?
                || stored_orphans.contains(&hash)
                || batch
                    .orphans
                    .get(&header.prev_block)
                    .is_some_and(|list| list.iter().any(|orphan| orphan.hash == hash))
            {
                batch.outcome.duplicates += 1;
                continue;
            }
            if batch.rejected.contains(&header.prev_block) {
                batch.reject(hash, "parent was rejected".to_string());
                continue;
            }
            match batch.lookup(&header.prev_block)? {
                Some(parent) => batch.connect_with_descendants(hash, *header, parent)?,
                None => {
                    log_debug!(
                        "header {} waits for parent {}",
                        hash256_to_hex(&hash),
                        hash256_to_hex(&header.prev_block)
                    );
                    batch.outcome.orphaned += 1;
                    batch
                        .orphans
                        .entry(header.prev_block)
                        .or_default()
                        .push(OrphanHeader {
                            hash,
                            header: *header,
                            received: now,
                        });
                }
            }
        }

        let Batch {
            pending,
            orphans,
            mut update,
            mut outcome,
            ..
        } = batch;

        for orphan in orphans.into_values().flatten() {
            if !stored_orphans.contains(&orphan.hash) {
                update.add_disconnected(orphan);
            }
        }
        self.prune_orphans(&mut update)?;

        let new_best = self.select_best(&old_best, update.connected());
        self.classify(&old_best, &new_best, &pending, &mut update)?;

        if update.is_empty() {
            return Ok(outcome);
        }
        // Storage failure drops the whole update; the batch will be retried.
        self.store.apply_update(&update)?;

        if new_best.hash != old_best.hash {
            outcome.best = Some(new_best.position());
            outcome.reorg = update.reorg().cloned();
            if let Some(reorg) = &outcome.reorg {
                log_info!(
                    "reorg from {} to {} (fork point {})",
                    reorg.old_tip,
                    reorg.new_tip,
                    reorg.fork_point
                );
                self.events.publish(ChainEvent::Reorg(reorg.clone()));
            }
            self.events.publish(ChainEvent::BestTip(new_best.position()));
        }
        Ok(outcome)
    }

    fn better(&self, candidate: &StoredHeader, current: &StoredHeader) -> bool {
        let ordering = match self.params.best_chain_rule {
            BestChainRule::CumulativeWork => {
                work_from_bytes(&candidate.work).cmp(&work_from_bytes(&current.work))
            }
            BestChainRule::Height => candidate.height.cmp(&current.height),
        };
        match ordering {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match self.config.tie_break {
                TieBreak::FirstSeen => false,
                TieBreak::LowestHash => {
                    U256::from_little_endian(&candidate.hash)
                        < U256::from_little_endian(&current.hash)
                }
            },
        }
    }

    /// Newly connected headers are compared in connection order against the
    /// current tip, so on a tie the earlier one stays.
    fn select_best(&self, old_best: &StoredHeader, connected: &[StoredHeader]) -> StoredHeader {
        connected.iter().fold(*old_best, |best, candidate| {
            if self.better(candidate, &best) {
                *candidate
            } else {
                best
            }
        })
    }

    /// Fills in the best chain, reorg and sibling changes for a new tip.
    fn classify(
        &self,
        old_best: &StoredHeader,
        new_best: &StoredHeader,
        pending: &HashMap<Hash256, StoredHeader>,
        update: &mut UpdateTransaction,
    ) -> Result<(), HeaderError> {
        let parents_with_new_children: HashSet<Hash256> = update
            .connected()
            .iter()
            .map(|header| header.header.prev_block)
            .collect();
        let mut new_branch = HashSet::new();

        if new_best.hash != old_best.hash {
            let lookup = |hash: &Hash256| -> Result<StoredHeader, HeaderError> {
                match pending.get(hash) {
                    Some(header) => Ok(*header),
                    None => self.store.load_header(hash),
                }
            };
            let mut cursor = *new_best;
            while !self.store.is_on_best_chain(&cursor.position())? {
                new_branch.insert(cursor.hash);
                update.set_best(cursor.height, cursor.hash);
                cursor = lookup(&cursor.header.prev_block)?;
            }
            let fork_point = cursor.position();
            for height in (new_best.height + 1)..=old_best.height {
                update.remove_best(height);
            }
            update.set_best_tip(new_best.position());
            update.remove_sibling(new_best.hash);

            if fork_point.hash != old_best.hash {
                update.reorg = Some(Reorg {
                    old_tip: old_best.position(),
                    new_tip: new_best.position(),
                    fork_point,
                });
                if !parents_with_new_children.contains(&old_best.hash) {
                    update.add_sibling(old_best.hash);
                }
            }
        }

        let tips: Vec<Hash256> = update
            .connected()
            .iter()
            .filter(|header| !parents_with_new_children.contains(&header.hash))
            .filter(|header| header.hash != new_best.hash && !new_branch.contains(&header.hash))
            .map(|header| header.hash)
            .collect();
        for hash in tips {
            update.add_sibling(hash);
        }
        Ok(())
    }

    /// Drops the oldest orphans once the disconnected list is over its bound.
    fn prune_orphans(&self, update: &mut UpdateTransaction) -> Result<(), HeaderError> {
        let removed = &update.disconnected_removed;
        let mut all: Vec<OrphanHeader> = self
            .store
            .disconnected_headers()?
            .into_iter()
            .filter(|orphan| !removed.contains(&orphan.segment()))
            .collect();
        all.extend(update.disconnected().iter().copied());
        if all.len() <= self.config.max_orphans {
            return Ok(());
        }
        all.sort_by_key(|orphan| orphan.received);
        let excess = all.len() - self.config.max_orphans;
        log_debug!("pruning {excess} stale orphan header(s)");
        for orphan in all.into_iter().take(excess) {
            update.remove_disconnected(orphan.segment());
        }
        Ok(())
    }

    /// Pins the chain to `checkpoint`. Fails if the best chain already has a
    /// different block at that height.
    pub fn add_checkpoint(&self, checkpoint: Position) -> Result<(), HeaderError> {
        let _guard = self
            .apply
            .lock()
            .map_err(|_| HeaderError::Poisoned("header apply"))?;
        if checkpoint.height <= self.store.best_height()
            && self.store.best_block(checkpoint.height)? != checkpoint.hash
        {
            return Err(HeaderError::CheckpointConflict {
                height: checkpoint.height,
            });
        }
        let mut update = UpdateTransaction::new();
        update.set_checkpoint(checkpoint);
        self.store.apply_update(&update)
    }

    pub fn delete_checkpoint(&self) -> Result<(), HeaderError> {
        let _guard = self
            .apply
            .lock()
            .map_err(|_| HeaderError::Poisoned("header apply"))?;
        let mut update = UpdateTransaction::new();
        update.clear_checkpoint();
        self.store.apply_update(&update)
    }
}
