//! Pending header index changes, committed in one batch by
//! [`HeaderStore::apply_update`](crate::HeaderStore::apply_update).

use std::collections::{BTreeMap, BTreeSet};

use cfsync_consensus::Hash256;
use cfsync_primitives::{BlockHeader, DecodeError, Decoder, Encoder, Position, HEADER_SIZE};

use crate::events::Reorg;
use crate::header_store::StoredHeader;

/// A parent/child link: where a header attaches (or would attach) to the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainSegment {
    pub parent: Hash256,
    pub child: Hash256,
}

impl ChainSegment {
    pub fn key(&self) -> [u8; 64] {
        let mut key = [0u8; 64];
        key[..32].copy_from_slice(&self.parent);
        key[32..].copy_from_slice(&self.child);
        key
    }

    pub fn from_key(key: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(key);
        let parent = decoder.read_hash()?;
        let child = decoder.read_hash()?;
        decoder.finish()?;
        Ok(Self { parent, child })
    }
}

/// Parent hash -> hashes of headers waiting for that parent.
pub type DisconnectedList = BTreeMap<Hash256, BTreeSet<Hash256>>;

/// A header whose parent is not known yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrphanHeader {
    pub hash: Hash256,
    pub header: BlockHeader,
    /// Unix seconds when first received; oldest orphans are pruned first.
    pub received: i64,
}

impl OrphanHeader {
    pub fn segment(&self) -> ChainSegment {
        ChainSegment {
            parent: self.header.prev_block,
            child: self.hash,
        }
    }

    pub fn encode_value(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(8 + HEADER_SIZE);
        encoder.write_i64_le(self.received);
        encoder.write_bytes(&self.header.to_bytes());
        encoder.into_inner()
    }

    pub fn decode_value(hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let received = decoder.read_i64_le()?;
        let header = BlockHeader::from_bytes(decoder.take_rest())?;
        Ok(Self {
            hash,
            header,
            received,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointChange {
    Set(Position),
    Clear,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateTransaction {
    pub(crate) connected: Vec<StoredHeader>,
    pub(crate) best_chain: BTreeMap<i32, Hash256>,
    /// Heights above the new tip that leave the best chain (shorter but heavier fork).
    pub(crate) best_chain_removed: BTreeSet<i32>,
    pub(crate) best_tip: Option<Position>,
    pub(crate) checkpoint: Option<CheckpointChange>,
    pub(crate) reorg: Option<Reorg>,
    pub(crate) siblings_added: BTreeSet<Hash256>,
    pub(crate) siblings_removed: BTreeSet<Hash256>,
    pub(crate) disconnected_added: Vec<OrphanHeader>,
    pub(crate) disconnected_removed: BTreeSet<ChainSegment>,
}

impl UpdateTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
            && self.best_chain.is_empty()
            && self.best_chain_removed.is_empty()
            && self.best_tip.is_none()
            && self.checkpoint.is_none()
            && self.siblings_added.is_empty()
            && self.siblings_removed.is_empty()
            && self.disconnected_added.is_empty()
            && self.disconnected_removed.is_empty()
    }

    pub fn connect(&mut self, header: StoredHeader) {
        self.connected.push(header);
    }

    pub fn set_best(&mut self, height: i32, hash: Hash256) {
        self.best_chain_removed.remove(&height);
        self.best_chain.insert(height, hash);
    }

    pub fn remove_best(&mut self, height: i32) {
        self.best_chain.remove(&height);
        self.best_chain_removed.insert(height);
    }

    pub fn set_best_tip(&mut self, tip: Position) {
        self.best_tip = Some(tip);
    }

    pub fn set_checkpoint(&mut self, checkpoint: Position) {
        self.checkpoint = Some(CheckpointChange::Set(checkpoint));
    }

    pub fn clear_checkpoint(&mut self) {
        self.checkpoint = Some(CheckpointChange::Clear);
    }

    pub fn add_sibling(&mut self, hash: Hash256) {
        self.siblings_removed.remove(&hash);
        self.siblings_added.insert(hash);
    }

    pub fn remove_sibling(&mut self, hash: Hash256) {
        self.siblings_added.remove(&hash);
        self.siblings_removed.insert(hash);
    }

    pub fn add_disconnected(&mut self, orphan: OrphanHeader) {
        self.disconnected_removed.remove(&orphan.segment());
        self.disconnected_added.push(orphan);
    }

    pub fn remove_disconnected(&mut self, segment: ChainSegment) {
        let before = self.disconnected_added.len();
        self.disconnected_added
            .retain(|orphan| orphan.segment() != segment);
        if self.disconnected_added.len() == before {
            self.disconnected_removed.insert(segment);
        }
    }

    pub fn connected(&self) -> &[StoredHeader] {
        &self.connected
    }

    pub fn best_tip(&self) -> Option<Position> {
        self.best_tip
    }

    pub fn reorg(&self) -> Option<&Reorg> {
        self.reorg.as_ref()
    }

    pub fn siblings(&self) -> &BTreeSet<Hash256> {
        &self.siblings_added
    }

    pub fn disconnected(&self) -> &[OrphanHeader] {
        &self.disconnected_added
    }
}
