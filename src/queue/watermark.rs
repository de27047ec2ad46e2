//! Per-queue backpressure gate
//!
//! Producers pause enqueueing into a queue whose depth crossed the
//! high-water mark and resume once it drained to the low-water mark.
//! The gate carries hysteresis state so producers polling the depth see a
//! stable pause/resume signal rather than flapping around one threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// High/low watermark pair for one queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Watermarks {
    pub high: u64,
    pub low: u64,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self { high: 10_000, low: 5_000 }
    }
}

/// Hysteresis gate over the depth of a single queue
#[derive(Debug)]
pub struct WatermarkGate {
    queue: String,
    marks: Watermarks,
    paused: AtomicBool,
}

impl WatermarkGate {
    pub fn new(queue: impl Into<String>, marks: Watermarks) -> Self {
        Self {
            queue: queue.into(),
            marks,
            paused: AtomicBool::new(false),
        }
    }

    /// Feed the current depth; returns true while producers must pause
    pub fn observe(&self, depth: u64) -> bool {
        let was_paused = self.paused.load(Ordering::Acquire);
        if !was_paused && depth >= self.marks.high {
            warn!(
                "Queue '{}' reached high-water mark ({} >= {}), pausing producers",
                self.queue, depth, self.marks.high
            );
            self.paused.store(true, Ordering::Release);
            true
        } else if was_paused && depth <= self.marks.low {
            debug!(
                "Queue '{}' drained to low-water mark ({} <= {}), resuming producers",
                self.queue, depth, self.marks.low
            );
            self.paused.store(false, Ordering::Release);
            false
        } else {
            was_paused
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// Gate set covering every configured queue
#[derive(Debug, Clone, Default)]
pub struct BackpressureGates {
    gates: HashMap<String, Arc<WatermarkGate>>,
}

impl BackpressureGates {
    pub fn new(config: &HashMap<String, Watermarks>) -> Self {
        let gates = config
            .iter()
            .map(|(queue, marks)| (queue.clone(), Arc::new(WatermarkGate::new(queue.clone(), *marks))))
            .collect();
        Self { gates }
    }

    pub fn gate(&self, queue: &str) -> Option<Arc<WatermarkGate>> {
        self.gates.get(queue).cloned()
    }

    /// Feed a depth observation; queues without a configured gate never pause
    pub fn observe(&self, queue: &str, depth: u64) -> bool {
        self.gates.get(queue).map_or(false, |gate| gate.observe(depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_hysteresis() {
        let gate = WatermarkGate::new("image", Watermarks { high: 100, low: 40 });

        assert!(!gate.observe(99));
        assert!(gate.observe(100), "pause at high-water");
        assert!(gate.observe(60), "still paused between marks");
        assert!(!gate.observe(40), "resume at low-water");
        assert!(!gate.observe(99), "no pause until high again");
    }
}
