use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crossbus_core::{CrossBusError, ErrorCode, Envelope, PeerId, Result};
use tracing::warn;

/// Overflow handling once a per-destination queue is at its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
    Reject,
    Pause,
}

#[derive(Default)]
pub struct QueueStats {
    pub drops: u64,
    pub paused: bool,
}

struct PerDestination {
    queue: VecDeque<Envelope>,
    in_flight: bool,
}

/// Per-destination queue with four overflow policies and a monitor callback
/// for the 50%-full and pause thresholds.
pub struct Backpressure {
    max_size: usize,
    policy: OverflowPolicy,
    queues: Mutex<HashMap<PeerId, PerDestination>>,
    stats: Mutex<HashMap<PeerId, QueueStats>>,
    on_monitor: Option<Box<dyn Fn(&PeerId, usize, usize) + Send + Sync>>,
}

impl Backpressure {
    pub fn new(max_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            max_size,
            policy,
            queues: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            on_monitor: None,
        }
    }

    pub fn with_monitor(mut self, f: impl Fn(&PeerId, usize, usize) + Send + Sync + 'static) -> Self {
        self.on_monitor = Some(Box::new(f));
        self
    }

    fn notify(&self, destination: &PeerId, len: usize) {
        if let Some(monitor) = &self.on_monitor {
            if len * 2 >= self.max_size || len >= self.max_size {
                monitor(destination, len, self.max_size);
            }
        }
    }

    /// Immediate pass when nothing is currently in flight for `destination`;
    /// otherwise enqueues up to the cap and enforces `policy` when full.
    /// Returns `Ok(Some(envelope))` when the caller should send immediately
    /// (the caller must call [`Backpressure::complete`] once that send
    /// finishes, success or failure, to release the next queued envelope),
    /// `Ok(None)` when it was queued, and `Err` only under `Reject`.
    pub fn offer(&self, destination: PeerId, envelope: Envelope) -> Result<Option<Envelope>> {
        let mut queues = self.queues.lock().unwrap();
        let entry = queues.entry(destination.clone()).or_insert_with(|| PerDestination {
            queue: VecDeque::new(),
            in_flight: false,
        });

        if !entry.in_flight && entry.queue.is_empty() {
            entry.in_flight = true;
            self.notify(&destination, 0);
            return Ok(Some(envelope));
        }

        if entry.queue.len() >= self.max_size {
            let mut stats = self.stats.lock().unwrap();
            let stat = stats.entry(destination.clone()).or_default();
            match self.policy {
                OverflowPolicy::DropOldest => {
                    entry.queue.pop_front();
                    entry.queue.push_back(envelope);
                    stat.drops += 1;
                    warn!(peer = %destination, "backpressure queue full: dropped oldest");
                }
                OverflowPolicy::DropNewest => {
                    stat.drops += 1;
                    warn!(peer = %destination, "backpressure queue full: dropped newest");
                }
                OverflowPolicy::Reject => {
                    return Err(CrossBusError::from_code(ErrorCode::QueueFull, serde_json::json!({"peer": destination})));
                }
                OverflowPolicy::Pause => {
                    stat.paused = true;
                }
            }
            self.notify(&destination, entry.queue.len());
            return Ok(None);
        }

        entry.queue.push_back(envelope);
        self.notify(&destination, entry.queue.len());
        Ok(None)
    }

    /// Releases the in-flight slot for `destination` and hands back the next
    /// queued envelope, if any, which becomes the new in-flight send. Call
    /// this once the envelope `offer` handed back immediately has finished
    /// sending, whether it succeeded or failed.
    pub fn complete(&self, destination: &str) -> Option<Envelope> {
        let mut queues = self.queues.lock().unwrap();
        let entry = queues.get_mut(destination)?;
        let next = entry.queue.pop_front();
        entry.in_flight = next.is_some();
        self.notify(&destination.to_string(), entry.queue.len());
        next
    }

    /// Attempts to drain queued envelopes for `destination` on demand,
    /// without affecting the in-flight slot.
    pub fn flush(&self, destination: &str) -> Vec<Envelope> {
        let mut queues = self.queues.lock().unwrap();
        match queues.get_mut(destination) {
            Some(entry) => entry.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn queue_len(&self, destination: &str) -> usize {
        self.queues.lock().unwrap().get(destination).map(|e| e.queue.len()).unwrap_or(0)
    }

    pub fn drops(&self, destination: &str) -> u64 {
        self.stats.lock().unwrap().get(destination).map(|s| s.drops).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Envelope {
        Envelope::broadcast("a".to_string(), serde_json::json!({}))
    }

    #[test]
    fn invariant_7_queue_never_exceeds_max_size_and_drops_are_counted() {
        let bp = Backpressure::new(2, OverflowPolicy::DropOldest);
        assert!(bp.offer("b".to_string(), env()).unwrap().is_some()); // empty -> immediate
        bp.offer("b".to_string(), env()).unwrap(); // queued (1)
        bp.offer("b".to_string(), env()).unwrap(); // queued (2), at cap
        bp.offer("b".to_string(), env()).unwrap(); // overflow -> drop oldest
        assert!(bp.queue_len("b") <= 2);
        assert_eq!(bp.drops("b"), 1);
    }

    #[test]
    fn reject_policy_errors_once_full() {
        let bp = Backpressure::new(1, OverflowPolicy::Reject);
        bp.offer("b".to_string(), env()).unwrap();
        bp.offer("b".to_string(), env()).unwrap();
        let err = bp.offer("b".to_string(), env()).unwrap_err();
        assert_eq!(err.code, ErrorCode::QueueFull);
    }

    #[test]
    fn a_second_offer_queues_until_the_first_send_completes() {
        let bp = Backpressure::new(4, OverflowPolicy::Reject);
        let first = bp.offer("b".to_string(), env()).unwrap();
        assert!(first.is_some(), "nothing in flight yet, so the first offer dispatches immediately");

        let second = bp.offer("b".to_string(), env()).unwrap();
        assert!(second.is_none(), "a send is already in flight, so this one queues");
        assert_eq!(bp.queue_len("b"), 1);

        let released = bp.complete("b");
        assert!(released.is_some(), "completing the in-flight send releases the queued one");
        assert_eq!(bp.queue_len("b"), 0);
    }

    #[test]
    fn flush_drains_the_queue() {
        let bp = Backpressure::new(5, OverflowPolicy::Reject);
        bp.offer("b".to_string(), env()).unwrap();
        bp.offer("b".to_string(), env()).unwrap();
        bp.offer("b".to_string(), env()).unwrap();
        let drained = bp.flush("b");
        assert_eq!(drained.len(), 2);
        assert_eq!(bp.queue_len("b"), 0);
    }
}
