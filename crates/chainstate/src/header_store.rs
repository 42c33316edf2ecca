//! Persistent header index.
//!
//! Tables:
//! - `HeaderIndex`: hash -> header, height and cumulative work of every
//!   connected header (best chain or not).
//! - `BestChain`: height -> hash for the current best chain.
//! - `Siblings`: tips of known branches that are not best.
//! - `Disconnected`: headers waiting for their parent.
//! - `Meta`: best tip and checkpoint positions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};

use cfsync_consensus::{ChainParams, Hash256};
use cfsync_log::log_info;
use cfsync_pow::{block_proof, work_to_bytes, Work};
use cfsync_primitives::{BlockHeader, Decoder, Encoder, Position, HEADER_SIZE};
use cfsync_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::HeaderError;
use crate::update::{ChainSegment, CheckpointChange, DisconnectedList, OrphanHeader, UpdateTransaction};

const META_BEST_TIP: &[u8] = b"best_tip";
const META_CHECKPOINT: &[u8] = b"checkpoint";
const HEADER_CACHE_CAPACITY: usize = 16_384;
/// Consecutive best-chain hashes at the head of a locator before spacing doubles.
const LOCATOR_DENSE_HASHES: i32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredHeader {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: i32,
    pub work: Work,
}

impl StoredHeader {
    pub fn position(&self) -> Position {
        Position::new(self.height, self.hash)
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE + 36);
        encoder.write_bytes(&self.header.to_bytes());
        encoder.write_i32_le(self.height);
        encoder.write_bytes(&self.work);
        encoder.into_inner()
    }

    fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, HeaderError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::from_bytes(decoder.take(HEADER_SIZE)?)?;
        let height = decoder.read_i32_le()?;
        let work = decoder.read_array::<32>()?;
        decoder.finish()?;
        Ok(Self {
            hash,
            header,
            height,
            work,
        })
    }
}

fn height_key(height: i32) -> [u8; 4] {
    // Big-endian so prefix scans walk the chain in height order.
    (height as u32).to_be_bytes()
}

struct HeaderCache {
    entries: HashMap<Hash256, StoredHeader>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl HeaderCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<StoredHeader> {
        self.entries.get(hash).copied()
    }

    fn insert(&mut self, header: StoredHeader) {
        if self.entries.insert(header.hash, header).is_some() {
            return;
        }
        self.order.push_back(header.hash);
        while self.entries.len() > self.capacity {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&evicted);
        }
    }
}

pub struct HeaderStore<S> {
    store: S,
    best: RwLock<StoredHeader>,
    checkpoint: RwLock<Option<Position>>,
    cache: Mutex<HeaderCache>,
}

impl<S: KeyValueStore> HeaderStore<S> {
    /// Opens the index, writing the genesis header (and the chain's
    /// checkpoint, if it has one) the first time.
    pub fn open(store: S, params: &ChainParams) -> Result<Self, HeaderError> {
        let best = match store.get(Column::Meta, META_BEST_TIP)? {
            Some(bytes) => {
                let tip = Position::from_bytes(&bytes)?;
                let record = store.get(Column::HeaderIndex, &tip.hash)?.ok_or_else(|| {
                    HeaderError::Corrupt("best tip header missing from index".to_string())
                })?;
                StoredHeader::decode(tip.hash, &record)?
            }
            None => Self::write_genesis(&store, params)?,
        };
        let checkpoint = match store.get(Column::Meta, META_CHECKPOINT)? {
            Some(bytes) => Some(Position::from_bytes(&bytes)?),
            None => None,
        };
        let mut cache = HeaderCache::new(HEADER_CACHE_CAPACITY);
        cache.insert(best);
        Ok(Self {
            store,
            best: RwLock::new(best),
            checkpoint: RwLock::new(checkpoint),
            cache: Mutex::new(cache),
        })
    }

    fn write_genesis(store: &S, params: &ChainParams) -> Result<StoredHeader, HeaderError> {
        let header = BlockHeader::genesis(&params.genesis);
        let proof = block_proof(header.bits)
            .map_err(|err| HeaderError::Corrupt(format!("genesis bits: {err}")))?;
        let genesis = StoredHeader {
            hash: header.hash_with(params.wire.block_hash),
            header,
            height: 0,
            work: work_to_bytes(proof),
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::HeaderIndex, genesis.hash, genesis.encode());
        batch.put(Column::BestChain, height_key(0), genesis.hash);
        batch.put(Column::Meta, META_BEST_TIP, genesis.position().to_bytes());
        if let Some(checkpoint) = params.checkpoint {
            let position = Position::new(checkpoint.height, checkpoint.hash);
            batch.put(Column::Meta, META_CHECKPOINT, position.to_bytes());
        }
        store.write_batch(&batch)?;
        log_info!(
            "initialized {} header index at genesis {}",
            params.chain,
            genesis.position()
        );
        Ok(genesis)
    }

    /// Commits `update` atomically. On error nothing is written and the
    /// in-memory tip is unchanged. Readers of the best chain wait until both
    /// the store and the in-memory tip reflect the update.
    pub fn apply_update(&self, update: &UpdateTransaction) -> Result<(), HeaderError> {
        let mut batch = WriteBatch::new();
        for header in &update.connected {
            batch.put(Column::HeaderIndex, header.hash, header.encode());
        }
        for height in &update.best_chain_removed {
            batch.delete(Column::BestChain, height_key(*height));
        }
        for (height, hash) in &update.best_chain {
            batch.put(Column::BestChain, height_key(*height), *hash);
        }
        for hash in &update.siblings_removed {
            batch.delete(Column::Siblings, *hash);
        }
        for hash in &update.siblings_added {
            batch.put(Column::Siblings, *hash, [0u8; 0]);
        }
        for segment in &update.disconnected_removed {
            batch.delete(Column::Disconnected, segment.key());
        }
        for orphan in &update.disconnected_added {
            batch.put(
                Column::Disconnected,
                orphan.segment().key(),
                orphan.encode_value(),
            );
        }
        match update.checkpoint {
            Some(CheckpointChange::Set(position)) => {
                batch.put(Column::Meta, META_CHECKPOINT, position.to_bytes());
            }
            Some(CheckpointChange::Clear) => batch.delete(Column::Meta, META_CHECKPOINT),
            None => {}
        }

        let new_best = match update.best_tip {
            Some(tip) => {
                batch.put(Column::Meta, META_BEST_TIP, tip.to_bytes());
                let header = update
                    .connected
                    .iter()
                    .find(|header| header.hash == tip.hash)
                    .copied();
                Some(match header {
                    Some(header) => header,
                    None => self.load_header(&tip.hash)?,
                })
            }
            None => None,
        };

        let mut best = self
            .best
            .write()
            .map_err(|_| HeaderError::Poisoned("best tip"))?;
        let mut checkpoint = self
            .checkpoint
            .write()
            .map_err(|_| HeaderError::Poisoned("checkpoint"))?;
        self.store.write_batch(&batch)?;

        if let Ok(mut cache) = self.cache.lock() {
            for header in &update.connected {
                cache.insert(*header);
            }
        }
        if let Some(new_best) = new_best {
            *best = new_best;
        }
        match update.checkpoint {
            Some(CheckpointChange::Set(position)) => *checkpoint = Some(position),
            Some(CheckpointChange::Clear) => *checkpoint = None,
            None => {}
        }
        Ok(())
    }

    // The tip is a plain value replaced in one assignment, so a poisoned
    // guard still holds a consistent header.
    fn best_guard(&self) -> RwLockReadGuard<'_, StoredHeader> {
        self.best.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn best_block(&self, height: i32) -> Result<Hash256, HeaderError> {
        let best = self.best_guard();
        self.best_block_below(height, best.height)
    }

    fn best_block_below(&self, height: i32, tip_height: i32) -> Result<Hash256, HeaderError> {
        if height < 0 || height > tip_height {
            return Err(HeaderError::HeightNotFound(height));
        }
        let value = self
            .store
            .get(Column::BestChain, &height_key(height))?
            .ok_or(HeaderError::HeightNotFound(height))?;
        let hash: Hash256 = value
            .as_slice()
            .try_into()
            .map_err(|_| HeaderError::Corrupt(format!("best chain entry at {height}")))?;
        Ok(hash)
    }

    pub fn is_on_best_chain(&self, position: &Position) -> Result<bool, HeaderError> {
        match self.best_block(position.height) {
            Ok(hash) => Ok(hash == position.hash),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn current_best(&self) -> StoredHeader {
        *self.best_guard()
    }

    pub fn best_height(&self) -> i32 {
        self.best_guard().height
    }

    /// The checkpoint, or a blank position when none is set.
    pub fn current_checkpoint(&self) -> Position {
        self.checkpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(Position::blank)
    }

    pub fn have_checkpoint(&self) -> bool {
        self.checkpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn header_exists(&self, hash: &Hash256) -> Result<bool, HeaderError> {
        if self.cache.lock().is_ok_and(|cache| cache.get(hash).is_some()) {
            return Ok(true);
        }
        Ok(self.store.contains(Column::HeaderIndex, hash)?)
    }

    pub fn is_sibling(&self, hash: &Hash256) -> Result<bool, HeaderError> {
        Ok(self.store.contains(Column::Siblings, hash)?)
    }

    pub fn load_header(&self, hash: &Hash256) -> Result<StoredHeader, HeaderError> {
        self.try_load_header(hash)?
            .ok_or(HeaderError::NotFound(*hash))
    }

    pub fn try_load_header(&self, hash: &Hash256) -> Result<Option<StoredHeader>, HeaderError> {
        if let Some(header) = self.cache.lock().ok().and_then(|cache| cache.get(hash)) {
            return Ok(Some(header));
        }
        let Some(bytes) = self.store.get(Column::HeaderIndex, hash)? else {
            return Ok(None);
        };
        let header = StoredHeader::decode(*hash, &bytes)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(header);
        }
        Ok(Some(header))
    }

    /// Best-chain hashes for a `getheaders` locator: the newest ten, then
    /// exponentially further apart, always ending at genesis.
    pub fn recent_hashes(&self) -> Result<Vec<Hash256>, HeaderError> {
        let best = self.best_guard();
        let tip = best.height;
        let mut hashes = Vec::new();
        let mut height = tip;
        let mut step = 1;
        while height > 0 {
            hashes.push(self.best_block_below(height, tip)?);
            if hashes.len() as i32 >= LOCATOR_DENSE_HASHES {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(self.best_block_below(0, tip)?);
        Ok(hashes)
    }

    pub fn sibling_hashes(&self) -> Result<HashSet<Hash256>, HeaderError> {
        let mut hashes = HashSet::new();
        self.store
            .for_each_prefix(Column::Siblings, &[], &mut |key, _| {
                if let Ok(hash) = Hash256::try_from(key) {
                    hashes.insert(hash);
                }
                Ok(())
            })?;
        Ok(hashes)
    }

    pub fn disconnected_hashes(&self) -> Result<DisconnectedList, HeaderError> {
        let mut list = DisconnectedList::new();
        for (key, _) in self.store.scan_prefix(Column::Disconnected, &[])? {
            let segment = ChainSegment::from_key(&key)?;
            list.entry(segment.parent).or_default().insert(segment.child);
        }
        Ok(list)
    }

    pub fn has_disconnected_children(&self, parent: &Hash256) -> Result<bool, HeaderError> {
        Ok(!self
            .store
            .scan_prefix(Column::Disconnected, parent)?
            .is_empty())
    }

    /// Orphans waiting for `parent`.
    pub fn disconnected_children(&self, parent: &Hash256) -> Result<Vec<OrphanHeader>, HeaderError> {
        self.scan_disconnected(parent)
    }

    /// Every stored orphan.
    pub fn disconnected_headers(&self) -> Result<Vec<OrphanHeader>, HeaderError> {
        self.scan_disconnected(&[])
    }

    fn scan_disconnected(&self, prefix: &[u8]) -> Result<Vec<OrphanHeader>, HeaderError> {
        self.store
            .scan_prefix(Column::Disconnected, prefix)?
            .into_iter()
            .map(|(key, value)| {
                let segment = ChainSegment::from_key(&key)?;
                Ok(OrphanHeader::decode_value(segment.child, &value)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_consensus::{chain_params, Chain};
    use cfsync_storage::memory::MemoryStore;
    use cfsync_storage::{PrefixVisitor, ScanResult, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Condvar};
    use std::thread;
    use std::time::Duration;

    /// Memory store that parks best-chain writes after committing them,
    /// while the gate is held.
    #[derive(Default)]
    struct CommitGate {
        inner: MemoryStore,
        held: Mutex<bool>,
        released: Condvar,
        waiting: AtomicBool,
    }

    impl CommitGate {
        fn hold(&self) {
            *self.held.lock().expect("gate") = true;
        }

        fn release(&self) {
            *self.held.lock().expect("gate") = false;
            self.released.notify_all();
        }
    }

    impl KeyValueStore for CommitGate {
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
            self.inner.write_batch(batch)?;
            if batch.touched() & Column::BestChain.bit() != 0 {
                let mut held = self.held.lock().expect("gate");
                while *held {
                    self.waiting.store(true, Ordering::Release);
                    held = self.released.wait(held).expect("gate");
                }
            }
            Ok(())
        }
    }

    fn extend(parent: &StoredHeader) -> (StoredHeader, UpdateTransaction) {
        let header = BlockHeader {
            version: 4,
            prev_block: parent.hash,
            merkle_root: [7u8; 32],
            time: parent.header.time + 600,
            bits: parent.header.bits,
            nonce: 0,
        };
        let child = StoredHeader {
            hash: header.hash(),
            header,
            height: parent.height + 1,
            work: parent.work,
        };
        let mut update = UpdateTransaction::new();
        update.connect(child);
        update.set_best(child.height, child.hash);
        update.set_best_tip(child.position());
        (child, update)
    }

    #[test]
    fn open_writes_genesis_once() {
        let params = chain_params(Chain::Regtest);
        let backing = Arc::new(MemoryStore::new());
        let store = HeaderStore::open(Arc::clone(&backing), &params).expect("open");
        let genesis = store.current_best();
        assert_eq!(genesis.height, 0);
        assert_eq!(store.best_block(0), Ok(genesis.hash));
        assert_eq!(store.best_block(1), Err(HeaderError::HeightNotFound(1)));
        assert!(!store.have_checkpoint());
        assert!(store.current_checkpoint().is_blank());

        let reopened = HeaderStore::open(backing, &params).expect("reopen");
        assert_eq!(reopened.current_best(), genesis);
    }

    #[test]
    fn missing_header_is_not_found_not_failure() {
        let params = chain_params(Chain::Regtest);
        let store = HeaderStore::open(MemoryStore::new(), &params).expect("open");
        assert_eq!(store.try_load_header(&[9u8; 32]), Ok(None));
        assert_eq!(
            store.load_header(&[9u8; 32]),
            Err(HeaderError::NotFound([9u8; 32]))
        );
        assert_eq!(store.recent_hashes().expect("locator").len(), 1);
    }

    #[test]
    fn mainnet_checkpoint_recorded_at_init() {
        let params = chain_params(Chain::Bitcoin);
        let store = HeaderStore::open(MemoryStore::new(), &params).expect("open");
        assert!(store.have_checkpoint());
        assert_eq!(store.current_checkpoint().height, 11_111);
    }

    #[test]
    fn locator_waits_for_an_in_progress_tip_update() {
        let params = chain_params(Chain::Regtest);
        let backing = Arc::new(CommitGate::default());
        let store = HeaderStore::open(Arc::clone(&backing), &params).expect("open");
        let genesis = store.current_best();
        let (child, update) = extend(&genesis);

        backing.hold();
        thread::scope(|scope| {
            let writer = scope.spawn(|| store.apply_update(&update));
            while !backing.waiting.load(Ordering::Acquire) {
                thread::yield_now();
            }
            // The best chain row is committed but the tip has not moved yet.
            let reader = scope.spawn(|| store.recent_hashes());
            thread::sleep(Duration::from_millis(50));
            let blocked = !reader.is_finished();
            backing.release();

            assert!(blocked);
            assert_eq!(writer.join().expect("writer"), Ok(()));
            assert_eq!(
                reader.join().expect("reader"),
                Ok(vec![child.hash, genesis.hash])
            );
        });
        assert_eq!(store.best_block(1), Ok(child.hash));
        assert_eq!(store.current_best(), child);
    }

    #[test]
    fn poisoned_tip_lock_keeps_reads_and_refuses_updates() {
        let params = chain_params(Chain::Regtest);
        let store = HeaderStore::open(MemoryStore::new(), &params).expect("open");
        let genesis = store.current_best();

        let crashed = thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _tip = store.best.write();
                    panic!("writer crashed");
                })
                .join()
        });
        assert!(crashed.is_err());
        assert!(store.best.is_poisoned());

        assert_eq!(store.current_best(), genesis);
        assert_eq!(store.recent_hashes(), Ok(vec![genesis.hash]));
        let (_, update) = extend(&genesis);
        assert_eq!(
            store.apply_update(&update),
            Err(HeaderError::Poisoned("best tip"))
        );
        assert_eq!(store.best_block(1), Err(HeaderError::HeightNotFound(1)));
        assert!(!store.header_exists(&update.connected[0].hash).expect("exists"));
    }
}
