use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCheck {
    pub count: usize,
    pub breached: bool,
}

/// Per-key sliding-window event counter.
///
/// Every `record_and_check` prunes, appends and counts under one lock, so the
/// count a caller sees is exact even with many threads hitting the same key.
/// An event is inside the window while its age is strictly less than `window`.
#[derive(Debug)]
pub struct SlidingWindowCounter {
    window: Duration,
    threshold: usize,
    max_keys: usize,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowCounter {
    pub fn new(window: Duration, threshold: usize, max_keys: usize) -> Self {
        Self {
            window,
            threshold,
            max_keys: max_keys.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn record_and_check(&self, key: &str, now: Instant) -> WindowCheck {
        let cutoff = now.checked_sub(self.window);

        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(key) && buckets.len() >= self.max_keys {
            make_room(&mut buckets, cutoff, self.max_keys);
        }

        let bucket = buckets.entry(key.to_string()).or_default();
        bucket.push_back(now);
        prune(bucket, cutoff);

        let count = bucket.len();
        WindowCheck {
            count,
            breached: count > self.threshold,
        }
    }

    /// Count without recording. Drops the key once its window is empty.
    #[cfg(test)]
    pub fn current_count(&self, key: &str, now: Instant) -> usize {
        let cutoff = now.checked_sub(self.window);
        let mut buckets = self.buckets.lock();
        let count = match buckets.get_mut(key) {
            Some(bucket) => {
                prune(bucket, cutoff);
                bucket.len()
            }
            None => return 0,
        };
        if count == 0 {
            buckets.remove(key);
        }
        count
    }

    /// Removes every key with no event left inside the window.
    pub fn sweep(&self, now: Instant) -> usize {
        let cutoff = now.checked_sub(self.window);
        let mut buckets = self.buckets.lock();
        sweep_idle(&mut buckets, cutoff)
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}

fn prune(bucket: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else {
        return;
    };
    while let Some(front) = bucket.front().copied() {
        if front <= cutoff {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

fn sweep_idle(buckets: &mut HashMap<String, VecDeque<Instant>>, cutoff: Option<Instant>) -> usize {
    let Some(cutoff) = cutoff else {
        return 0;
    };
    let before = buckets.len();
    buckets.retain(|_, bucket| bucket.back().is_some_and(|newest| *newest > cutoff));
    before - buckets.len()
}

fn make_room(
    buckets: &mut HashMap<String, VecDeque<Instant>>,
    cutoff: Option<Instant>,
    max_keys: usize,
) {
    let swept = sweep_idle(buckets, cutoff);
    if buckets.len() < max_keys {
        tracing::debug!(swept, "swept idle counter keys to make room");
        return;
    }

    let stalest = buckets
        .iter()
        .min_by_key(|(_, bucket)| bucket.back().copied())
        .map(|(key, _)| key.clone());
    if let Some(key) = stalest {
        tracing::warn!(
            max_keys,
            "counter key limit reached; evicting least recently active key"
        );
        buckets.remove(&key);
    }
}
