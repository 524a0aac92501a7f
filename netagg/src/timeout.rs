//! Constant-time timeout bookkeeping for outstanding transmission slots.
//!
//! An age-ordered doubly-linked list threaded through an index array:
//! `push` always inserts at the head (entries arrive newest-first),
//! `remove` unlinks through the index, and `check` inspects only the
//! tail. All three are O(1).

use std::time::{Duration, Instant};

const NIL: usize = usize::MAX;

#[derive(Debug, Clone)]
struct Entry {
    valid: bool,
    next: usize,
    prev: usize,
    timestamp: Instant,
}

/// Timeout queue over a fixed set of slot indices.
#[derive(Debug)]
pub struct TimeoutQueue {
    entries: Vec<Entry>,
    head: usize,
    tail: usize,
    timeout: Duration,
    timeouts_counter: u64,
    timeouts_threshold: u64,
    threshold_increment: u64,
}

impl TimeoutQueue {
    /// `capacity` is the number of outstanding slots that may be tracked;
    /// `timeout` the initial expiry; the timeout doubles every time
    /// `threshold` expiries accumulate, and the threshold then grows by
    /// `threshold_increment`.
    pub fn new(
        capacity: usize,
        timeout: Duration,
        threshold: u64,
        threshold_increment: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            entries: vec![
                Entry {
                    valid: false,
                    next: NIL,
                    prev: NIL,
                    timestamp: now,
                };
                capacity
            ],
            head: NIL,
            tail: NIL,
            timeout,
            timeouts_counter: 0,
            timeouts_threshold: threshold,
            threshold_increment,
        }
    }

    /// (Re)arm the slot at `index`. An existing entry for the slot is
    /// replaced. Timestamps must be non-decreasing in push order.
    pub fn push(&mut self, index: usize, timestamp: Instant) {
        assert!(
            self.head == NIL || timestamp >= self.entries[self.head].timestamp,
            "out-of-order timestamp pushed for slot {index}"
        );

        self.remove(index);

        let entry = &mut self.entries[index];
        entry.valid = true;
        entry.prev = NIL;
        entry.next = self.head;
        entry.timestamp = timestamp;

        if self.head != NIL {
            self.entries[self.head].prev = index;
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
    }

    /// Disarm the slot at `index`. No-op if it is not armed.
    pub fn remove(&mut self, index: usize) {
        if !self.entries[index].valid {
            return;
        }
        let Entry { prev, next, .. } = self.entries[index];
        if prev != NIL {
            self.entries[prev].next = next;
        }
        if next != NIL {
            self.entries[next].prev = prev;
        }
        if self.head == index {
            self.head = next;
        }
        if self.tail == index {
            self.tail = prev;
        }
        let entry = &mut self.entries[index];
        entry.valid = false;
        entry.next = NIL;
        entry.prev = NIL;
    }

    /// If the oldest armed slot has been waiting longer than the current
    /// timeout, return its index. The entry stays armed; the caller
    /// re-pushes it when it retransmits.
    pub fn check(&mut self, now: Instant) -> Option<usize> {
        if self.tail == NIL {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.entries[self.tail].timestamp);
        if elapsed <= self.timeout {
            return None;
        }
        self.timeouts_counter += 1;
        if self.timeouts_counter > self.timeouts_threshold {
            // Backoff: keep doubling the timeout while expiries pile up,
            // and demand more of them before the next doubling.
            self.timeouts_counter = 0;
            self.timeout *= 2;
            self.timeouts_threshold += self.threshold_increment;
            tracing::debug!(
                timeout_ms = self.timeout.as_millis() as u64,
                threshold = self.timeouts_threshold,
                "timeout backoff engaged"
            );
        }
        Some(self.tail)
    }

    /// Reset the backoff state for a new job slice.
    pub fn reset_timeout(&mut self, timeout: Duration, threshold: u64) {
        self.timeout = timeout;
        self.timeouts_counter = 0;
        self.timeouts_threshold = threshold;
    }

    /// The current (possibly backed-off) timeout.
    pub fn current_timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(cap: usize, timeout_ms: u64) -> TimeoutQueue {
        TimeoutQueue::new(cap, Duration::from_millis(timeout_ms), 3, 2)
    }

    #[test]
    fn test_check_returns_oldest_after_timeout() {
        let mut q = queue(4, 10);
        let t0 = Instant::now();
        q.push(2, t0);
        q.push(0, t0 + Duration::from_millis(1));

        assert_eq!(q.check(t0 + Duration::from_millis(5)), None);
        assert_eq!(q.check(t0 + Duration::from_millis(11)), Some(2));
    }

    #[test]
    fn test_remove_unlinks_tail() {
        let mut q = queue(4, 10);
        let t0 = Instant::now();
        q.push(1, t0);
        q.push(3, t0);
        q.remove(1);
        // Slot 3 is now the oldest.
        assert_eq!(q.check(t0 + Duration::from_millis(20)), Some(3));
        q.remove(3);
        assert_eq!(q.check(t0 + Duration::from_millis(40)), None);
    }

    #[test]
    fn test_repush_moves_to_head() {
        let mut q = queue(2, 10);
        let t0 = Instant::now();
        q.push(0, t0);
        q.push(1, t0 + Duration::from_millis(1));
        // Rearming slot 0 makes slot 1 the oldest.
        q.push(0, t0 + Duration::from_millis(2));
        assert_eq!(q.check(t0 + Duration::from_millis(12)), Some(1));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut q = queue(2, 10);
        q.remove(0);
        let t0 = Instant::now();
        q.push(0, t0);
        q.remove(0);
        q.remove(0);
        assert_eq!(q.check(t0 + Duration::from_millis(100)), None);
    }

    #[test]
    #[should_panic(expected = "out-of-order timestamp")]
    fn test_out_of_order_push_panics() {
        let mut q = queue(2, 10);
        let t0 = Instant::now();
        q.push(0, t0 + Duration::from_millis(5));
        q.push(1, t0);
    }

    #[test]
    fn test_backoff_doubles_timeout_and_raises_threshold() {
        let mut q = queue(1, 10);
        let t0 = Instant::now();
        // Threshold is 3: the fourth expiry trips the backoff.
        let mut now = t0;
        for _ in 0..4 {
            q.push(0, now);
            now += Duration::from_millis(11);
            assert_eq!(q.check(now), Some(0));
        }
        assert_eq!(q.current_timeout(), Duration::from_millis(20));

        // The next doubling needs threshold + increment + 1 = 6 expiries,
        // each past the doubled timeout.
        for _ in 0..6 {
            q.push(0, now);
            now += Duration::from_millis(21);
            assert_eq!(q.check(now), Some(0));
        }
        assert_eq!(q.current_timeout(), Duration::from_millis(40));
    }

    #[test]
    fn test_reset_timeout() {
        let mut q = queue(1, 10);
        let t0 = Instant::now();
        for i in 0..4 {
            q.push(0, t0 + Duration::from_millis(i * 20));
            q.check(t0 + Duration::from_millis(i * 20 + 15));
        }
        assert!(q.current_timeout() > Duration::from_millis(10));
        q.reset_timeout(Duration::from_millis(10), 3);
        assert_eq!(q.current_timeout(), Duration::from_millis(10));
    }

    // Sanity check that a long mixed sequence stays cheap: every
    // operation touches a bounded number of links, so this completes
    // near-instantly even in debug builds.
    #[test]
    fn test_long_sequence_constant_time_ops() {
        let cap = 64;
        let mut q = queue(cap, 1000);
        let t0 = Instant::now();
        for i in 0..200_000u64 {
            let idx = (i % cap as u64) as usize;
            match i % 3 {
                0 | 1 => q.push(idx, t0 + Duration::from_nanos(i)),
                _ => q.remove(idx),
            }
            q.check(t0 + Duration::from_nanos(i));
        }
    }
}
