//! Observable engine events
//!
//! Everything the engine decides or completes is mirrored onto a broadcast
//! bus. Events never affect control flow; a bus with no subscribers is a
//! no-op.

use crate::types::ShardId;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Engine event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A cross-shard transaction began
    TransactionStarted {
        /// Transaction id
        transaction_id: String,
        /// Normalized isolation level
        isolation: String,
        /// Deadline budget in milliseconds
        timeout_ms: u64,
    },

    /// Phase 1 finished with unanimous Prepared/ReadOnly votes
    TransactionPrepared {
        /// Transaction id
        transaction_id: String,
    },

    /// Phase 2 finished with every commit successful
    TransactionCommitted {
        /// Transaction id
        transaction_id: String,
        /// Number of enlisted shards
        shard_count: usize,
    },

    /// The transaction was rolled back
    TransactionRolledBack {
        /// Transaction id
        transaction_id: String,
    },

    /// The transaction deadline elapsed before an outcome
    TransactionTimedOut {
        /// Transaction id
        transaction_id: String,
        /// Configured budget in milliseconds
        timeout_ms: u64,
    },

    /// A shard joined a transaction
    ParticipantEnlisted {
        /// Transaction id
        transaction_id: String,
        /// Shard that joined
        shard_id: ShardId,
        /// Position in enlistment (and phase-2 commit) order
        enlistment_index: usize,
    },

    /// A participant returned its phase-1 vote
    ParticipantVoted {
        /// Transaction id
        transaction_id: String,
        /// Voting shard
        shard_id: ShardId,
        /// Vote name
        vote: String,
    },

    /// A participant's local transaction committed
    ParticipantCommitted {
        /// Transaction id
        transaction_id: String,
        /// Committed shard
        shard_id: ShardId,
    },

    /// A participant's local transaction rolled back
    ParticipantRolledBack {
        /// Transaction id
        transaction_id: String,
        /// Rolled-back shard
        shard_id: ShardId,
    },

    /// A logical query was resolved to its candidate shards
    QueryPlanned {
        /// Entity type queried
        entity_type: String,
        /// Candidate shards, in execution order
        shard_ids: Vec<ShardId>,
        /// Whether the merge step re-establishes an ordering
        ordered: bool,
    },

    /// A per-shard read finished
    ShardQueryCompleted {
        /// Shard that was read
        shard_id: ShardId,
        /// Rows returned (0 on failure)
        row_count: usize,
        /// Wall-clock duration in milliseconds
        duration_ms: u64,
        /// Whether the read succeeded
        success: bool,
    },

    /// A row-count-sharded entity filled its newest shard
    ShardNeeded {
        /// Entity type that ran out of capacity
        entity_type: String,
        /// The shard that reached capacity
        full_shard_id: ShardId,
    },

    /// A save boundary was transparently promoted to a 2PC transaction
    SaveAutoPromoted {
        /// Tracked entries in the save
        entry_count: usize,
        /// Distinct target shards
        shard_count: usize,
        /// Transaction that took over the save
        transaction_id: String,
    },

    /// A multi-shard save ran inside an application transaction with no
    /// coordinator attached; the engine did not intervene
    SaveWithoutCoordinator {
        /// Tracked entries in the save
        entry_count: usize,
        /// Distinct target shards
        shard_count: usize,
    },
}

/// Broadcast bus for engine events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; lagging or absent subscribers are ignored
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = ?event, "engine event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as an async stream
    pub fn stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drain everything currently buffered on a receiver (test helper)
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::TransactionStarted {
            transaction_id: "XS-test".to_string(),
            isolation: "read_committed".to_string(),
            timeout_ms: 60_000,
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EngineEvent::TransactionStarted { .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::TransactionRolledBack {
            transaction_id: "XS-test".to_string(),
        });
    }
}
