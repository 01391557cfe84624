use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::http::Method;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::{
    alerts::AlertDispatcher,
    auth::Identity,
    config::DetectionConfig,
    duplicate::DuplicateDetector,
    flags::{FlagKind, FlagStore, SecurityFlag},
    policy::{self, endpoint_policies},
    window::SlidingWindowCounter,
};

/// What the interceptor knows about one inbound call.
#[derive(Debug, Clone, Copy)]
pub struct InboundCall<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub identity: Option<&'a Identity>,
    pub fingerprint: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub kind: FlagKind,
    pub reason: String,
    pub details: Map<String, Value>,
}

impl Violation {
    fn new(kind: FlagKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            details: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Reject(Violation),
}

/// Abuse-detection core. Owns every counter map; one instance lives in the
/// application state for the lifetime of the process.
pub struct Sentinel {
    spam: SlidingWindowCounter,
    failed_actions: SlidingWindowCounter,
    // Index-aligned with `policy::endpoint_policies()`.
    endpoints: Vec<SlidingWindowCounter>,
    duplicates: DuplicateDetector,
    flags: FlagStore,
    alerts: Arc<AlertDispatcher>,
}

impl Sentinel {
    pub fn new(config: &DetectionConfig, flags: FlagStore, alerts: Arc<AlertDispatcher>) -> Self {
        let endpoints = endpoint_policies()
            .iter()
            .map(|policy| {
                SlidingWindowCounter::new(policy.window, policy.threshold, config.max_tracked_keys)
            })
            .collect();

        Self {
            spam: SlidingWindowCounter::new(
                config.spam_window,
                config.spam_threshold,
                config.max_tracked_keys,
            ),
            failed_actions: SlidingWindowCounter::new(
                config.failed_action_window,
                config.failed_action_threshold,
                config.max_tracked_keys,
            ),
            endpoints,
            duplicates: DuplicateDetector::new(
                config.duplicate_interval,
                config.duplicate_idle,
                config.max_tracked_keys,
            ),
            flags,
            alerts,
        }
    }

    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    pub fn alerts(&self) -> &Arc<AlertDispatcher> {
        &self.alerts
    }

    /// Runs the checks in order and stops at the first breach. A breach is
    /// flagged and alerted before the verdict is returned; neither waits on I/O.
    pub fn inspect(&self, call: &InboundCall<'_>, now: Instant) -> Verdict {
        if policy::is_bypassed(call.path) {
            return Verdict::Allow;
        }
        let Some(identity) = call.identity else {
            return Verdict::Allow;
        };

        match self.evaluate(identity, call, now) {
            Some(violation) => {
                self.raise(identity, &violation);
                Verdict::Reject(violation)
            }
            None => Verdict::Allow,
        }
    }

    fn evaluate(&self, identity: &Identity, call: &InboundCall<'_>, now: Instant) -> Option<Violation> {
        let spam = self.spam.record_and_check(&identity.user_id, now);
        if spam.breached {
            return Some(
                Violation::new(
                    FlagKind::RequestSpam,
                    format!(
                        "{} requests within {} ms",
                        spam.count,
                        self.spam.window().as_millis()
                    ),
                )
                .with("count", spam.count)
                .with("threshold", self.spam.threshold())
                .with("window_ms", duration_ms(self.spam.window()))
                .with("method", call.method.as_str())
                .with("path", call.path),
            );
        }

        if let Some(index) = policy::policy_index(call.path) {
            let policy = &endpoint_policies()[index];
            let key = format!("{}:{}", identity.user_id, policy.name);
            let check = self.endpoints[index].record_and_check(&key, now);
            if check.breached {
                return Some(
                    Violation::new(
                        policy.kind,
                        format!(
                            "{} calls to {} within {} s",
                            check.count,
                            policy.name,
                            policy.window.as_secs()
                        ),
                    )
                    .with("count", check.count)
                    .with("threshold", policy.threshold)
                    .with("window_ms", duration_ms(policy.window))
                    .with("policy", policy.name)
                    .with("method", call.method.as_str())
                    .with("path", call.path),
                );
            }
        }

        if let Some(fingerprint) = call.fingerprint {
            if policy::is_mutating(call.method)
                && self
                    .duplicates
                    .check(&identity.user_id, call.path, fingerprint, now)
            {
                let interval_ms = duration_ms(self.duplicates.interval());
                return Some(
                    Violation::new(
                        FlagKind::DuplicateRequest,
                        format!("identical request repeated within {interval_ms} ms"),
                    )
                    .with("interval_ms", interval_ms)
                    .with("fingerprint", fingerprint)
                    .with("method", call.method.as_str())
                    .with("path", call.path),
                );
            }
        }

        None
    }

    /// Feeds the failed-action window after the downstream handler refused a
    /// call. The response itself is never altered.
    pub fn observe_failed_action(
        &self,
        identity: &Identity,
        path: &str,
        status: u16,
        now: Instant,
    ) -> Option<Violation> {
        let check = self.failed_actions.record_and_check(&identity.user_id, now);
        if !check.breached {
            return None;
        }

        let violation = Violation::new(
            FlagKind::FailedActionSpam,
            format!(
                "{} failed actions within {} s",
                check.count,
                self.failed_actions.window().as_secs()
            ),
        )
        .with("count", check.count)
        .with("threshold", self.failed_actions.threshold())
        .with("window_ms", duration_ms(self.failed_actions.window()))
        .with("last_status", status)
        .with("path", path);

        self.raise(identity, &violation);
        Some(violation)
    }

    /// Records a violation spotted by game logic itself, such as an impossible
    /// stat value or a crafted payload.
    pub fn report(
        &self,
        identity: &Identity,
        kind: FlagKind,
        reason: impl Into<String>,
        details: Map<String, Value>,
    ) {
        let violation = Violation {
            kind,
            reason: reason.into(),
            details,
        };
        self.raise(identity, &violation);
    }

    fn raise(&self, identity: &Identity, violation: &Violation) {
        tracing::warn!(
            user_id = %identity.user_id,
            username = identity.username.as_deref().unwrap_or("-"),
            flag_type = %violation.kind,
            reason = %violation.reason,
            "abuse detected"
        );

        self.flags.record(
            SecurityFlag::new(
                identity.user_id.clone(),
                identity.username.clone(),
                violation.kind,
                violation.reason.clone(),
            )
            .with_details(violation.details.clone()),
        );

        let display = identity.username.as_deref().unwrap_or(&identity.user_id);
        self.alerts.enqueue(
            format!(
                "{} by {} ({}): {}",
                violation.kind, display, identity.user_id, violation.reason
            ),
            violation.kind.severity(),
        );
    }

    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = self.spam.sweep(now) + self.failed_actions.sweep(now);
        removed += self
            .endpoints
            .iter()
            .map(|counter| counter.sweep(now))
            .sum::<usize>();
        removed + self.duplicates.sweep(now)
    }

    pub fn tracked_keys(&self) -> usize {
        self.spam.tracked_keys()
            + self.failed_actions.tracked_keys()
            + self
                .endpoints
                .iter()
                .map(SlidingWindowCounter::tracked_keys)
                .sum::<usize>()
            + self.duplicates.tracked_keys()
    }

    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let sentinel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = sentinel.sweep(Instant::now());
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        tracked = sentinel.tracked_keys(),
                        "swept idle detection keys"
                    );
                }
            }
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
