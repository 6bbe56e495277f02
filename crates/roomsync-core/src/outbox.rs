//! Retry-with-backoff queue for sends that failed because nobody was
//! listening yet (`RoomSyncError::NoSubscribers`), e.g. a `YUpdate`
//! published to a gossip topic before the hub has subscribed.
//!
//! Backoff schedule: `250ms * 2^attempts`, capped at 8000ms, plus up to 100ms
//! of jitter. The attempt counter itself is capped at 8, but that only caps
//! the retry delay — it never causes an entry to be dropped. Queue depth is
//! unbounded; an item keeps retrying at the capped delay until delivered.

use std::time::{Duration, Instant};

use rand::Rng;

const BASE_DELAY_MS: u64 = 250;
const MAX_DELAY_MS: u64 = 8000;
const MAX_JITTER_MS: u64 = 100;
pub const MAX_ATTEMPTS: u32 = 8;

fn backoff_delay(attempts: u32) -> Duration {
    let exp = BASE_DELAY_MS.saturating_mul(1u64 << attempts.min(16));
    let capped = exp.min(MAX_DELAY_MS);
    let jitter = rand::rng().random_range(0..=MAX_JITTER_MS);
    Duration::from_millis(capped + jitter)
}

/// One queued send, retried until it succeeds or exhausts `MAX_ATTEMPTS`.
pub struct PendingSend<T> {
    pub topic: String,
    pub payload: T,
    attempts: u32,
    ready_at: Instant,
}

impl<T> PendingSend<T> {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Per-topic retry queue. Not tied to any particular transport; callers
/// drain `ready` items, attempt delivery, and report back via
/// `record_failure`/`remove`.
#[derive(Default)]
pub struct Outbox<T> {
    pending: Vec<PendingSend<T>>,
}

impl<T> Outbox<T> {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Enqueue a fresh send, due for its first attempt immediately.
    pub fn push(&mut self, topic: impl Into<String>, payload: T) {
        self.pending.push(PendingSend {
            topic: topic.into(),
            payload,
            attempts: 0,
            ready_at: Instant::now(),
        });
    }

    /// Indices of entries whose retry delay has elapsed, in queue order.
    pub fn ready_indices(&self, now: Instant) -> Vec<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ready_at <= now)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&PendingSend<T>> {
        self.pending.get(index)
    }

    /// Delivery succeeded; drop the entry.
    pub fn remove(&mut self, index: usize) -> Option<PendingSend<T>> {
        if index < self.pending.len() {
            Some(self.pending.remove(index))
        } else {
            None
        }
    }

    /// Delivery failed again: bump the attempt counter, clamped at
    /// `MAX_ATTEMPTS`, and reschedule at the resulting backoff delay. Never
    /// drops the entry — attempt count only caps how fast retries happen,
    /// not whether they continue.
    pub fn record_failure(&mut self, index: usize) {
        let Some(entry) = self.pending.get_mut(index) else {
            return;
        };
        entry.attempts = (entry.attempts + 1).min(MAX_ATTEMPTS);
        entry.ready_at = Instant::now() + backoff_delay(entry.attempts);
    }

    pub fn retain_topic(&mut self, topic: &str, keep: bool) {
        if !keep {
            self.pending.retain(|p| p.topic != topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_monotonic_and_capped() {
        let mut prev = Duration::ZERO;
        for attempt in 0..12 {
            let d = backoff_delay(attempt);
            assert!(d >= prev || attempt == 0, "attempt {attempt} regressed");
            assert!(d <= Duration::from_millis(MAX_DELAY_MS + MAX_JITTER_MS));
            prev = Duration::from_millis(
                (BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16))).min(MAX_DELAY_MS),
            );
        }
    }

    #[test]
    fn ready_indices_respects_schedule() {
        let mut outbox: Outbox<Vec<u8>> = Outbox::new();
        outbox.push("wc/room1", vec![1, 2, 3]);
        let now = Instant::now();
        assert_eq!(outbox.ready_indices(now).len(), 1);
    }

    #[test]
    fn record_failure_clamps_attempts_and_keeps_retrying() {
        let mut outbox: Outbox<Vec<u8>> = Outbox::new();
        outbox.push("wc/room1", vec![1]);
        for _ in 0..(MAX_ATTEMPTS * 3) {
            outbox.record_failure(0);
        }
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.get(0).unwrap().attempts(), MAX_ATTEMPTS);
    }

    #[test]
    fn remove_clears_entry_on_success() {
        let mut outbox: Outbox<Vec<u8>> = Outbox::new();
        outbox.push("wc/room1", vec![1]);
        assert_eq!(outbox.len(), 1);
        outbox.remove(0);
        assert!(outbox.is_empty());
    }

    #[test]
    fn retain_topic_drops_other_topics() {
        let mut outbox: Outbox<Vec<u8>> = Outbox::new();
        outbox.push("wc/room1", vec![1]);
        outbox.push("wc/room2", vec![2]);
        outbox.retain_topic("wc/room1", true);
        assert_eq!(outbox.len(), 2);
        outbox.retain_topic("wc/room2", false);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.get(0).unwrap().topic, "wc/room1");
    }
}
