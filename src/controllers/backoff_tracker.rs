//! Per-key exponential backoff, capped at 60s, reset on success — the
//! retry policy controllers apply to their own work queue re-enqueues.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;

const INITIAL: Duration = Duration::from_millis(500);
const CAP: Duration = Duration::from_secs(60);

pub struct BackoffTracker<K> {
    attempts: Mutex<HashMap<K, u32>>,
}

impl<K> Default for BackoffTracker<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> BackoffTracker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delay to wait before the next attempt on `key` and bumps
    /// its attempt counter.
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(key.clone()).or_insert(0);
        let delay = INITIAL.saturating_mul(1 << (*count).min(10));
        *count += 1;
        delay.min(CAP)
    }

    pub fn reset(&self, key: &K) {
        self.attempts.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let tracker: BackoffTracker<String> = BackoffTracker::new();
        let key = "default/nginx".to_string();
        let d1 = tracker.next_delay(&key);
        let d2 = tracker.next_delay(&key);
        assert!(d2 > d1);
        for _ in 0..20 {
            tracker.next_delay(&key);
        }
        assert_eq!(tracker.next_delay(&key), CAP);
    }

    #[test]
    fn reset_restarts_from_initial() {
        let tracker: BackoffTracker<String> = BackoffTracker::new();
        let key = "default/nginx".to_string();
        tracker.next_delay(&key);
        tracker.next_delay(&key);
        tracker.reset(&key);
        assert_eq!(tracker.next_delay(&key), INITIAL);
    }
}
