use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Flags an identical call (same identity, path and parameter fingerprint)
/// arriving again within `interval` of the previous one.
#[derive(Debug)]
pub struct DuplicateDetector {
    interval: Duration,
    idle: Duration,
    max_keys: usize,
    state: Mutex<SeenCalls>,
}

#[derive(Debug, Default)]
struct SeenCalls {
    last_seen: HashMap<String, Instant>,
    last_sweep: Option<Instant>,
}

impl SeenCalls {
    fn sweep(&mut self, now: Instant, idle: Duration) -> usize {
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) <= idle);
        self.last_sweep = Some(now);
        before - self.last_seen.len()
    }

    fn sweep_due(&self, now: Instant, idle: Duration) -> bool {
        match self.last_sweep {
            Some(last) => now.saturating_duration_since(last) > idle,
            None => true,
        }
    }
}

impl DuplicateDetector {
    pub fn new(interval: Duration, idle: Duration, max_keys: usize) -> Self {
        Self {
            interval,
            idle,
            max_keys: max_keys.max(1),
            state: Mutex::new(SeenCalls::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn check(&self, identity: &str, path: &str, fingerprint: &str, now: Instant) -> bool {
        let key = format!("{identity}\u{1f}{path}\u{1f}{fingerprint}");

        let mut state = self.state.lock();
        if state.sweep_due(now, self.idle) {
            state.sweep(now, self.idle);
        }

        if !state.last_seen.contains_key(&key) && state.last_seen.len() >= self.max_keys {
            state.sweep(now, self.idle);
            if state.last_seen.len() >= self.max_keys {
                let stalest = state
                    .last_seen
                    .iter()
                    .min_by_key(|(_, seen)| **seen)
                    .map(|(key, _)| key.clone());
                if let Some(stalest) = stalest {
                    tracing::warn!(
                        max_keys = self.max_keys,
                        "duplicate detector key limit reached; evicting stalest entry"
                    );
                    state.last_seen.remove(&stalest);
                }
            }
        }

        match state.last_seen.insert(key, now) {
            Some(previous) => now.saturating_duration_since(previous) < self.interval,
            None => false,
        }
    }

    pub fn sweep(&self, now: Instant) -> usize {
        self.state.lock().sweep(now, self.idle)
    }

    pub fn tracked_keys(&self) -> usize {
        self.state.lock().last_seen.len()
    }
}
