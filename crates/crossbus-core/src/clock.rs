use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::envelope::PeerId;

/// Mapping from peer id to logical counter (`spec.md` §3/§4.10).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: HashMap<PeerId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &str) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    pub fn set(&mut self, peer: impl Into<PeerId>, value: u64) {
        self.counters.insert(peer.into(), value);
    }

    /// Increments `own[self]` and returns the new clock.
    pub fn tick(&mut self, own_id: &str) -> u64 {
        let entry = self.counters.entry(own_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Componentwise max with `other`, merged into `self`.
    pub fn update(&mut self, other: &VectorClock) {
        for (peer, &count) in &other.counters {
            let entry = self.counters.entry(peer.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    fn compare(&self, other: &VectorClock) -> (bool, bool) {
        // Returns (self_le_other, strictly_less_somewhere).
        let mut le = true;
        let mut strict = false;
        let mut keys: std::collections::HashSet<&str> =
            self.counters.keys().map(String::as_str).collect();
        keys.extend(other.counters.keys().map(String::as_str));
        for key in keys {
            let a = self.get(key);
            let b = other.get(key);
            if a > b {
                le = false;
            }
            if a < b {
                strict = true;
            }
        }
        (le, strict)
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        let (le, strict) = self.compare(other);
        le && strict
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        !self.happened_before(other) && !other.happened_before(self) && self != other
    }

    pub fn equals(&self, other: &VectorClock) -> bool {
        self == other
    }
}

/// Delivery predicate from `spec.md` §4.10: for sender `s` with clock `m`
/// against local clock `l`, deliver iff `m[s] == l[s] + 1` and for every
/// other peer `k`, `m[k] <= l[k]`.
pub fn is_deliverable(sender: &str, message_clock: &VectorClock, local_clock: &VectorClock) -> bool {
    if message_clock.get(sender) != local_clock.get(sender) + 1 {
        return false;
    }
    let mut keys: std::collections::HashSet<&str> = message_clock
        .counters
        .keys()
        .map(String::as_str)
        .collect();
    keys.extend(local_clock.counters.keys().map(String::as_str));
    for key in keys {
        if key == sender {
            continue;
        }
        if message_clock.get(key) > local_clock.get(key) {
            return false;
        }
    }
    true
}

struct BufferedMessage<M> {
    sender: PeerId,
    clock: VectorClock,
    message: M,
}

/// Callback invoked when the buffer overflows and the oldest entry is dropped.
pub type OverflowCallback<M> = Box<dyn Fn(&PeerId, &M) + Send + Sync>;

/// Per-owner buffer of messages awaiting causal preconditions
/// (`spec.md` §3 "Ordering buffer", §4.10).
pub struct CausalOrderer<M> {
    local_clock: VectorClock,
    buffer: VecDeque<BufferedMessage<M>>,
    max_size: usize,
    on_overflow: Option<OverflowCallback<M>>,
}

impl<M> CausalOrderer<M> {
    pub fn new(max_size: usize) -> Self {
        Self {
            local_clock: VectorClock::new(),
            buffer: VecDeque::new(),
            max_size,
            on_overflow: None,
        }
    }

    pub fn set_overflow_callback(&mut self, cb: OverflowCallback<M>) {
        self.on_overflow = Some(cb);
    }

    pub fn local_clock(&self) -> &VectorClock {
        &self.local_clock
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Offers a message for causal delivery. Returns every message (including
    /// this one, if deliverable) that becomes deliverable as a result, in
    /// delivery order, after rescanning the buffer to a fixed point.
    pub fn offer(&mut self, sender: PeerId, clock: VectorClock, message: M) -> Vec<(PeerId, M)> {
        if is_deliverable(&sender, &clock, &self.local_clock) {
            self.local_clock.update(&clock);
            self.local_clock.set(sender.clone(), clock.get(&sender));
            let mut delivered = vec![(sender, message)];
            delivered.extend(self.rescan());
            delivered
        } else {
            self.push_buffered(sender, clock, message);
            Vec::new()
        }
    }

    fn push_buffered(&mut self, sender: PeerId, clock: VectorClock, message: M) {
        if self.max_size > 0 && self.buffer.len() >= self.max_size {
            if let Some(dropped) = self.buffer.pop_front() {
                if let Some(cb) = &self.on_overflow {
                    cb(&dropped.sender, &dropped.message);
                }
            }
        }
        self.buffer.push_back(BufferedMessage {
            sender,
            clock,
            message,
        });
    }

    /// Rescans the buffer repeatedly until a full pass delivers nothing new.
    fn rescan(&mut self) -> Vec<(PeerId, M)> {
        let mut delivered = Vec::new();
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < self.buffer.len() {
                let deliverable = is_deliverable(
                    &self.buffer[i].sender,
                    &self.buffer[i].clock,
                    &self.local_clock,
                );
                if deliverable {
                    let entry = self.buffer.remove(i).unwrap();
                    self.local_clock.update(&entry.clock);
                    self.local_clock
                        .set(entry.sender.clone(), entry.clock.get(&entry.sender));
                    delivered.push((entry.sender, entry.message));
                    progressed = true;
                } else {
                    i += 1;
                }
            }
            if !progressed {
                break;
            }
        }
        delivered
    }
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.happened_before(other) {
            Some(Ordering::Less)
        } else if other.happened_before(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_and_update_follow_textbook_vector_clock_rules() {
        let mut a = VectorClock::new();
        a.tick("a");
        a.tick("a");
        let mut b = VectorClock::new();
        b.tick("b");
        b.update(&a);
        assert_eq!(b.get("a"), 2);
        assert_eq!(b.get("b"), 1);
    }

    #[test]
    fn happened_before_requires_componentwise_le_and_one_strict() {
        let mut a = VectorClock::new();
        a.set("n1", 1);
        let mut b = VectorClock::new();
        b.set("n1", 2);
        assert!(a.happened_before(&b));
        assert!(!b.happened_before(&a));
        assert!(!a.happened_before(&a));
    }

    #[test]
    fn concurrent_clocks_are_neither_before_nor_after() {
        let mut a = VectorClock::new();
        a.set("n1", 1);
        let mut b = VectorClock::new();
        b.set("n2", 1);
        assert!(a.is_concurrent_with(&b));
    }

    #[test]
    fn scenario_s5_buffers_out_of_order_then_delivers_in_order() {
        let mut orderer: CausalOrderer<u32> = CausalOrderer::new(10);
        let mut clock2 = VectorClock::new();
        clock2.set("n2", 2);
        let delivered = orderer.offer("n2".to_string(), clock2, 2);
        assert!(delivered.is_empty());
        assert_eq!(orderer.len(), 1);

        let mut clock1 = VectorClock::new();
        clock1.set("n2", 1);
        let delivered = orderer.offer("n2".to_string(), clock1, 1);
        let messages: Vec<u32> = delivered.into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages, vec![1, 2]);
        assert!(orderer.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_and_invokes_callback() {
        use std::sync::{Arc, Mutex};
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let dropped2 = dropped.clone();
        let mut orderer: CausalOrderer<u32> = CausalOrderer::new(1);
        orderer.set_overflow_callback(Box::new(move |_peer, msg| {
            dropped2.lock().unwrap().push(*msg);
        }));
        let mut far = VectorClock::new();
        far.set("n2", 5);
        orderer.offer("n2".to_string(), far, 5);
        let mut far2 = VectorClock::new();
        far2.set("n2", 9);
        orderer.offer("n2".to_string(), far2, 9);
        assert_eq!(*dropped.lock().unwrap(), vec![5]);
        assert_eq!(orderer.len(), 1);
    }
}
