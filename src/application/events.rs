//! Realtime event hub
//!
//! Fans progress and lifecycle events out to subscribers over a bounded
//! broadcast channel. Every event gets a monotonic per-task sequence
//! number; clients reconnect and replay from the sequence they last saw.
//! Slow consumers lag out and are disconnected by the channel rather than
//! buffered indefinitely.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

pub use crate::domain::events::{EventChannel, EventPayload, SyncEvent};

const DEFAULT_CAPACITY: usize = 1024;

/// Process-wide event hub
pub struct EventHub {
    sender: broadcast::Sender<SyncEvent>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event; the hub assigns the per-task sequence. Returns the
    /// assigned sequence number. Publishing never blocks; with no
    /// subscribers the event is dropped.
    pub fn publish(&self, channel: EventChannel, task_id: &str, payload: EventPayload) -> u64 {
        let sequence = {
            let mut sequences = self.sequences.lock().expect("sequence mutex");
            let slot = sequences.entry(task_id.to_string()).or_insert(0);
            *slot += 1;
            *slot
        };

        let event = SyncEvent {
            channel,
            task_id: task_id.to_string(),
            sequence,
            payload,
            timestamp: Utc::now(),
        };

        if self.sender.send(event).is_err() {
            debug!("Event on {} dropped: no subscribers", channel.as_str());
        }
        sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequences_are_monotonic_per_task() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        let payload = || EventPayload::Progress {
            percent: 10,
            message: "working".to_string(),
            counters: Default::default(),
        };
        assert_eq!(hub.publish(EventChannel::SyncProgress, "task-a", payload()), 1);
        assert_eq!(hub.publish(EventChannel::SyncProgress, "task-b", payload()), 1);
        assert_eq!(hub.publish(EventChannel::SyncProgress, "task-a", payload()), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!((first.task_id.as_str(), first.sequence), ("task-a", 1));
    }
}
