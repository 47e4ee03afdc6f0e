use std::time::{Duration, Instant};

const DEFAULT_MAX_ATTEMPTS: u8 = 10;
const DEFAULT_MIN_WAIT: Duration = Duration::from_millis(20);
const BACKOFF_CAP: Duration = Duration::from_secs(1);
const MAX_TRACKED: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct NackEntry {
    ext_seq: u64,
    first_seen: Instant,
    attempts: u8,
    next_retry: Instant,
}

/// NackQueue tracks sequence numbers missing from an inbound stream and
/// decides, per entry, when a retransmission request is due. Retries back
/// off exponentially and give up after a bounded number of attempts.
pub struct NackQueue {
    entries: Vec<NackEntry>,
    min_wait: Duration,
    max_attempts: u8,
}

impl Default for NackQueue {
    fn default() -> Self {
        NackQueue::new()
    }
}

impl NackQueue {
    pub fn new() -> Self {
        NackQueue {
            entries: Vec::with_capacity(50),
            min_wait: DEFAULT_MIN_WAIT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_min_wait(mut self, min_wait: Duration) -> Self {
        self.min_wait = min_wait;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u8) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers `ext_seq` as missing; the first request is held back by the
    /// minimum wait so short reorderings resolve without a NACK.
    pub fn push(&mut self, ext_seq: u64, now: Instant) {
        if self.entries.iter().any(|e| e.ext_seq == ext_seq) {
            return;
        }
        if self.entries.len() == MAX_TRACKED {
            self.entries.remove(0);
        }
        self.entries.push(NackEntry {
            ext_seq,
            first_seen: now,
            attempts: 0,
            next_retry: now + self.min_wait,
        });
    }

    /// Drops `ext_seq`, called when the missing packet arrived after all.
    pub fn remove(&mut self, ext_seq: u64) {
        self.entries.retain(|e| e.ext_seq != ext_seq);
    }

    /// Collects the sequence numbers whose retry timer elapsed, advancing
    /// attempts and backoff for each; entries past the attempt cap are
    /// evicted and returned separately.
    pub fn pending(&mut self, now: Instant) -> (Vec<u16>, Vec<u64>) {
        let mut due = Vec::new();
        let mut evicted = Vec::new();

        let max_attempts = self.max_attempts;
        let min_wait = self.min_wait;
        self.entries.retain_mut(|entry| {
            if entry.next_retry > now {
                return true;
            }
            if entry.attempts >= max_attempts {
                evicted.push(entry.ext_seq);
                return false;
            }
            entry.attempts += 1;
            let backoff = min_wait
                .saturating_mul(1 << (entry.attempts.min(6) as u32))
                .min(BACKOFF_CAP);
            entry.next_retry = now + backoff;
            due.push(entry.ext_seq as u16);
            true
        });

        (due, evicted)
    }
}
