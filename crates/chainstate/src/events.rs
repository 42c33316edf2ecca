//! Notifications for consumers outside the sync loop (wallets, status views).

use cfsync_consensus::FilterType;
use cfsync_primitives::Position;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1_024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reorg {
    pub old_tip: Position,
    pub new_tip: Position,
    pub fork_point: Position,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    BestTip(Position),
    Reorg(Reorg),
    FilterHeaderTip {
        filter_type: FilterType,
        tip: Position,
    },
    FilterTip {
        filter_type: FilterType,
        tip: Position,
    },
}

/// Broadcast bus shared by the header and filter oracles. Slow subscribers
/// lose the oldest events (`RecvError::Lagged`) rather than stalling sync.
#[derive(Clone)]
pub struct ChainEvents {
    tx: broadcast::Sender<ChainEvent>,
}

impl Default for ChainEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChainEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
