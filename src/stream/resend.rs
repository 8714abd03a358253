//! Bookkeeping for resend requests
//!
//! A hole in the jitter buffer is only requested once the stream has moved
//! `reorder_window` blocks past it, so plain reordering does not trigger
//! requests. At most `limit` holes are tracked at a time, each is requested
//! at most `limit` times, and requests for the same hole are spaced by at
//! least `interval` seconds.

#[derive(Debug, Clone)]
struct Pending {
    sequence: u32,
    attempts: u32,
    last_request: f64,
}

#[derive(Debug, Clone)]
pub struct ResendTracker {
    pending: Vec<Pending>,
    limit: u32,
    /// Seconds
    interval: f64,
    reorder_window: u32,
    requests_sent: u64,
}

impl ResendTracker {
    pub fn new(limit: u32, interval_ms: f64, reorder_window: u32) -> Self {
        Self {
            pending: Vec::with_capacity(limit as usize),
            limit,
            interval: interval_ms / 1000.0,
            reorder_window,
            requests_sent: 0,
        }
    }

    pub fn configure(&mut self, limit: u32, interval_ms: f64, reorder_window: u32) {
        self.limit = limit;
        self.interval = interval_ms / 1000.0;
        self.reorder_window = reorder_window;
        self.pending.truncate(limit as usize);
    }

    /// Holes currently tracked
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    /// Decide which of the `missing` sequences to request at time `now`.
    ///
    /// Holes that are no longer missing are forgotten.
    pub fn update(&mut self, missing: &[u32], newest: u32, now: f64) -> Vec<u32> {
        self.pending.retain(|p| missing.contains(&p.sequence));

        let mut requests = Vec::new();
        for &sequence in missing {
            let distance = newest.wrapping_sub(sequence) as i32;
            if distance < self.reorder_window as i32 {
                continue;
            }
            match self.pending.iter_mut().find(|p| p.sequence == sequence) {
                Some(p) => {
                    if p.attempts < self.limit && now - p.last_request >= self.interval {
                        p.attempts += 1;
                        p.last_request = now;
                        requests.push(sequence);
                    }
                }
                None => {
                    if self.pending.len() < self.limit as usize {
                        self.pending.push(Pending { sequence, attempts: 1, last_request: now });
                        requests.push(sequence);
                    }
                }
            }
        }
        self.requests_sent += requests.len() as u64;
        requests
    }

    /// A block arrived; returns true if it had been requested
    pub fn take(&mut self, sequence: u32) -> bool {
        match self.pending.iter().position(|p| p.sequence == sequence) {
            Some(index) => {
                self.pending.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waits_for_reorder_window() {
        let mut tracker = ResendTracker::new(16, 10.0, 2);
        // Block 5 missing, newest is 6: could still be reordering
        assert!(tracker.update(&[5], 6, 0.0).is_empty());
        assert_eq!(tracker.update(&[5], 7, 0.001), vec![5]);
    }

    #[test]
    fn test_interval_and_attempt_limit() {
        let mut tracker = ResendTracker::new(3, 10.0, 0);
        assert_eq!(tracker.update(&[1], 5, 0.000), vec![1]);
        assert!(tracker.update(&[1], 5, 0.005).is_empty());
        assert_eq!(tracker.update(&[1], 5, 0.010), vec![1]);
        assert_eq!(tracker.update(&[1], 5, 0.020), vec![1]);
        // Three attempts used up
        assert!(tracker.update(&[1], 5, 0.100).is_empty());
    }

    #[test]
    fn test_outstanding_limit() {
        let mut tracker = ResendTracker::new(2, 10.0, 0);
        let requested = tracker.update(&[1, 2, 3, 4], 10, 0.0);
        assert_eq!(requested, vec![1, 2]);
        assert_eq!(tracker.outstanding(), 2);

        // Block 1 arrives, making room for another hole
        assert!(tracker.take(1));
        assert!(!tracker.take(1));
        assert_eq!(tracker.update(&[2, 3, 4], 10, 0.001), vec![3]);
    }

    #[test]
    fn test_forgets_filled_holes() {
        let mut tracker = ResendTracker::new(4, 10.0, 0);
        tracker.update(&[1, 2], 5, 0.0);
        tracker.update(&[2], 5, 0.02);
        assert_eq!(tracker.outstanding(), 1);
    }
}
