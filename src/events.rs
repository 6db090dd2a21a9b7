//! Memory lifecycle events.
//!
//! Stores and consolidation engines publish [`MemoryEvent`]s on an
//! [`EventBus`]. Subscribing is optional: with no receivers, events are
//! dropped and nothing else changes.

use crate::consolidation::{ConsolidationPhase, ConsolidationResult};
use crate::memory::{EntryId, MemoryLayer};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Outlived its TTL
    Expired,
    /// Pushed out by tier capacity
    Capacity,
    /// Removed by an explicit delete
    Deleted,
}

/// A notification about a change in a memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEvent {
    /// A new entry was created
    Stored { id: EntryId, layer: MemoryLayer },
    /// A store call matched an existing entry instead of creating one
    Deduplicated {
        id: EntryId,
        layer: MemoryLayer,
        access_count: u64,
    },
    /// An entry moved forward
    Promoted {
        id: EntryId,
        from: MemoryLayer,
        to: MemoryLayer,
    },
    /// An entry was removed
    Evicted {
        id: EntryId,
        layer: MemoryLayer,
        reason: EvictionReason,
    },
    /// Two durable entries were folded into one
    Merged {
        kept: EntryId,
        removed: EntryId,
        layer: MemoryLayer,
    },
    /// A consolidation cycle finished (possibly with failed phases)
    ConsolidationCompleted(ConsolidationResult),
    /// A consolidation phase raised an error
    ConsolidationFailed {
        phase: ConsolidationPhase,
        message: String,
    },
    /// A consolidation cycle was abandoned after exceeding its timeout
    ConsolidationTimedOut { timeout_ms: u64 },
}

/// Broadcast channel for [`MemoryEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MemoryEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Get number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: MemoryEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(MemoryEvent::Stored {
            id: EntryId::new(),
            layer: MemoryLayer::Working,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let id = EntryId::new();
        bus.emit(MemoryEvent::Evicted {
            id: id.clone(),
            layer: MemoryLayer::Episodic,
            reason: EvictionReason::Capacity,
        });

        match rx.recv().await.unwrap() {
            MemoryEvent::Evicted { id: got, reason, .. } => {
                assert_eq!(got, id);
                assert_eq!(reason, EvictionReason::Capacity);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = MemoryEvent::ConsolidationTimedOut { timeout_ms: 500 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "consolidation_timed_out");
        assert_eq!(json["timeout_ms"], 500);
    }
}
