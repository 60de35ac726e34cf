use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// How many distinct inbound message ids we keep counters for.
const MAX_TRACKED: usize = 1000;

/// Per-inbound-message `msg_seq` allocator. The platform rejects a second
/// reply to the same `msg_id` unless its `msg_seq` is strictly greater than
/// the first, and the constraint survives process restarts — so sequences
/// start from a base derived from startup wallclock (mod 1e8) instead of 1.
pub struct MsgSeqCounter {
    inner: Mutex<SeqMap>,
    base: u64,
}

struct SeqMap {
    counters: HashMap<String, u64>,
    order: VecDeque<String>,
}

impl MsgSeqCounter {
    pub fn new() -> Self {
        Self::with_base((chrono::Utc::now().timestamp_millis() as u64) % 100_000_000)
    }

    pub fn with_base(base: u64) -> Self {
        Self {
            inner: Mutex::new(SeqMap {
                counters: HashMap::new(),
                order: VecDeque::new(),
            }),
            base,
        }
    }

    /// Next sequence for a reply to `message_id`. Strictly increasing per key.
    pub fn next(&self, message_id: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if !inner.counters.contains_key(message_id) {
            if inner.counters.len() >= MAX_TRACKED {
                // Evict the oldest key; a revived counter restarts from the
                // base, which is still monotonic within one process.
                if let Some(old) = inner.order.pop_front() {
                    inner.counters.remove(&old);
                }
            }
            inner.order.push_back(message_id.to_string());
        }
        let counter = inner.counters.entry(message_id.to_string()).or_insert(0);
        *counter += 1;
        self.base + *counter
    }
}

impl Default for MsgSeqCounter {
    fn default() -> Self {
        Self::new()
    }
}
