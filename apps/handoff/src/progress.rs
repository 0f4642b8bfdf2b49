//! Completion percentage for one transfer attempt.
//!
//! The sender knows the chunk total and reports an exact floor percentage.
//! The receiver is never told the chunk count, so it reports a capped
//! estimate and only jumps to 100 when the `complete` frame arrives.

use tokio::sync::watch;

pub const RECEIVER_ESTIMATE_CAP: u8 = 95;
pub const RECEIVER_PERCENT_PER_CHUNK: usize = 5;

pub fn sender_percent(chunks_sent: usize, total_chunks: usize) -> u8 {
    if total_chunks == 0 {
        return 100;
    }
    let sent = chunks_sent.min(total_chunks);
    (sent * 100 / total_chunks) as u8
}

pub fn receiver_estimate(chunks_received: usize) -> u8 {
    chunks_received
        .saturating_mul(RECEIVER_PERCENT_PER_CHUNK)
        .min(RECEIVER_ESTIMATE_CAP as usize) as u8
}

/// Monotonic view over a percentage. Observers subscribe to the watch
/// channel; values never go backwards until `reset`.
#[derive(Debug)]
pub struct ProgressTracker {
    value: watch::Sender<u8>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (value, _) = watch::channel(0);
        Self { value }
    }

    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.value.subscribe()
    }

    pub fn current(&self) -> u8 {
        *self.value.borrow()
    }

    /// Returns the value now published, which is `percent` unless that would
    /// move backwards.
    pub fn advance(&self, percent: u8) -> u8 {
        let percent = percent.min(100);
        let mut published = percent;
        self.value.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                published = *current;
                false
            }
        });
        published
    }

    pub fn complete(&self) {
        self.advance(100);
    }

    pub fn reset(&self) {
        self.value.send_replace(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_percent_floors() {
        assert_eq!(sender_percent(1, 3), 33);
        assert_eq!(sender_percent(2, 3), 66);
        assert_eq!(sender_percent(3, 3), 100);
        assert_eq!(sender_percent(0, 0), 100);
    }

    #[test]
    fn receiver_estimate_caps_below_complete() {
        assert_eq!(receiver_estimate(1), 5);
        assert_eq!(receiver_estimate(19), 95);
        assert_eq!(receiver_estimate(10_000), 95);
    }

    #[test]
    fn tracker_is_monotonic_until_reset() {
        let tracker = ProgressTracker::new();
        let mut observed = tracker.subscribe();
        assert_eq!(tracker.advance(40), 40);
        assert_eq!(tracker.advance(10), 40);
        assert_eq!(tracker.current(), 40);
        assert!(observed.has_changed().unwrap());
        assert_eq!(*observed.borrow_and_update(), 40);

        tracker.complete();
        assert_eq!(tracker.current(), 100);
        assert_eq!(tracker.advance(255), 100);

        tracker.reset();
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn receiver_sequence_never_decreases_and_hits_100_only_on_complete() {
        let tracker = ProgressTracker::new();
        let mut last = 0;
        for received in 1..=40 {
            let value = tracker.advance(receiver_estimate(received));
            assert!(value >= last);
            assert!(value < 100);
            last = value;
        }
        tracker.complete();
        assert_eq!(tracker.current(), 100);
    }
}
