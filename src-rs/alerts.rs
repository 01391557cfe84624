use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::notifier::ChatNotifier;

pub const FLUSH_BATCH_SIZE: usize = 10;
pub const PAYLOAD_CHAR_LIMIT: usize = 4000;
const MESSAGE_CHAR_LIMIT: usize = 350;
const MAX_PENDING_ALERTS: usize = 1000;
const PARSE_MODE: &str = "HTML";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Exploit,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Exploit => "exploit",
        }
    }

    /// Urgent alerts skip the periodic cycle.
    pub fn is_urgent(self) -> bool {
        matches!(self, Severity::Critical | Severity::Exploit)
    }

    fn badge(self) -> &'static str {
        match self {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Critical => "🚨",
            Severity::Exploit => "💀",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlertMessage {
    pub text: String,
    pub severity: Severity,
}

impl AlertMessage {
    fn render(&self) -> String {
        format!(
            "{} <b>{}</b> {}",
            self.severity.badge(),
            self.severity.as_str().to_uppercase(),
            escape_html(&self.text)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Idle,
    Logged { drained: usize },
    Delivered { drained: usize },
    Dropped { drained: usize },
}

/// Operator alert queue.
///
/// Producers call [`enqueue`](Self::enqueue) from the request path; delivery
/// happens on the worker spawned by [`spawn_worker`](Self::spawn_worker), either
/// on its periodic tick or right away when an urgent alert is queued. Delivery
/// is at-most-once: a batch that fails to send is logged and discarded.
pub struct AlertDispatcher {
    queue: Mutex<VecDeque<AlertMessage>>,
    notifier: Option<ChatNotifier>,
    wake: Notify,
}

impl AlertDispatcher {
    pub fn new(notifier: Option<ChatNotifier>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notifier,
            wake: Notify::new(),
        }
    }

    pub fn enqueue(&self, text: impl Into<String>, severity: Severity) {
        let mut text: String = text.into();
        if text.chars().count() > MESSAGE_CHAR_LIMIT {
            text = text.chars().take(MESSAGE_CHAR_LIMIT - 1).collect();
            text.push('…');
        }

        {
            let mut queue = self.queue.lock();
            if queue.len() >= MAX_PENDING_ALERTS {
                queue.pop_front();
                tracing::warn!(
                    limit = MAX_PENDING_ALERTS,
                    "alert queue full; dropped oldest alert"
                );
            }
            queue.push_back(AlertMessage { text, severity });
        }

        if severity.is_urgent() {
            self.wake.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn has_urgent(&self) -> bool {
        self.queue
            .lock()
            .iter()
            .any(|message| message.severity.is_urgent())
    }

    pub async fn flush(&self) -> FlushOutcome {
        let batch: Vec<AlertMessage> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(FLUSH_BATCH_SIZE);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return FlushOutcome::Idle;
        }

        let drained = batch.len();
        let payload = render_payload(&batch);

        let Some(notifier) = &self.notifier else {
            tracing::info!(alerts = drained, payload = %payload, "alert channel not configured");
            return FlushOutcome::Logged { drained };
        };

        match notifier.send(&payload, PARSE_MODE).await {
            Ok(()) => {
                tracing::debug!(alerts = drained, "alert batch delivered");
                FlushOutcome::Delivered { drained }
            }
            Err(error) => {
                tracing::error!(error = ?error, alerts = drained, "failed to deliver alert batch; discarding");
                FlushOutcome::Dropped { drained }
            }
        }
    }

    pub fn spawn_worker(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.flush().await;
                    }
                    _ = dispatcher.wake.notified() => {
                        while dispatcher.has_urgent() {
                            dispatcher.flush().await;
                        }
                    }
                }
            }
        })
    }
}

fn render_payload(batch: &[AlertMessage]) -> String {
    let payload = batch
        .iter()
        .map(AlertMessage::render)
        .collect::<Vec<_>>()
        .join("\n\n");
    truncate_payload(payload, PAYLOAD_CHAR_LIMIT)
}

/// Cuts at the last whole message that fits so no markup is left open.
fn truncate_payload(payload: String, limit: usize) -> String {
    let Some((cut, _)) = payload.char_indices().nth(limit) else {
        return payload;
    };
    let head = &payload[..cut];
    match head.rfind("\n\n") {
        Some(end) => head[..end].to_string(),
        None => head.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};

    use super::*;

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn flush_drains_at_most_one_batch_in_order() {
        let dispatcher = AlertDispatcher::new(None);
        for i in 0..15 {
            dispatcher.enqueue(format!("alert {i}"), Severity::Warning);
        }

        {
            let queue = dispatcher.queue.lock();
            let batch: Vec<_> = queue.iter().take(FLUSH_BATCH_SIZE).cloned().collect();
            let payload = render_payload(&batch);
            let first = payload.find("alert 0").unwrap();
            let ninth = payload.find("alert 9").unwrap();
            assert!(first < ninth);
            assert!(!payload.contains("alert 10"));
        }

        assert_eq!(dispatcher.flush().await, FlushOutcome::Logged { drained: 10 });
        assert_eq!(dispatcher.pending(), 5);
        assert_eq!(
            dispatcher.queue.lock().front().map(|m| m.text.clone()),
            Some("alert 10".to_string())
        );
        assert_eq!(dispatcher.flush().await, FlushOutcome::Logged { drained: 5 });
        assert_eq!(dispatcher.flush().await, FlushOutcome::Idle);
    }

    #[tokio::test]
    async fn urgent_alerts_flush_immediately_and_warnings_wait() {
        let dispatcher = Arc::new(AlertDispatcher::new(None));
        let worker = dispatcher.spawn_worker(Duration::from_secs(30));

        dispatcher.enqueue("spam from user-1", Severity::Warning);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.pending(), 1);

        dispatcher.enqueue("negative transfer amount", Severity::Exploit);
        assert!(wait_until(|| dispatcher.pending() == 0).await);

        worker.abort();
    }

    #[tokio::test]
    async fn critical_backlog_is_fully_drained() {
        let dispatcher = Arc::new(AlertDispatcher::new(None));
        let worker = dispatcher.spawn_worker(Duration::from_secs(30));

        for i in 0..25 {
            dispatcher.enqueue(format!("stat anomaly {i}"), Severity::Critical);
        }
        assert!(wait_until(|| dispatcher.pending() == 0).await);

        worker.abort();
    }

    #[tokio::test]
    async fn delivers_batch_to_chat_api() {
        let captured: Arc<Mutex<Vec<Value>>> = Arc::default();
        let app = Router::new()
            .route(
                "/bottest-token/sendMessage",
                post(
                    |State(captured): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                        captured.lock().push(body);
                        Json(json!({ "ok": true }))
                    },
                ),
            )
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let notifier =
            ChatNotifier::new(format!("http://{addr}/"), "test-token".into(), "-100".into()).unwrap();
        let dispatcher = AlertDispatcher::new(Some(notifier));
        dispatcher.enqueue("user <vito> & co", Severity::Warning);
        dispatcher.enqueue("second", Severity::Info);

        assert_eq!(dispatcher.flush().await, FlushOutcome::Delivered { drained: 2 });
        let body = captured.lock()[0].clone();
        assert_eq!(body["chat_id"], "-100");
        assert_eq!(body["parse_mode"], "HTML");
        let text = body["text"].as_str().unwrap();
        assert!(text.contains("user &lt;vito&gt; &amp; co"));
        assert!(text.find("WARNING").unwrap() < text.find("INFO").unwrap());
    }

    #[tokio::test]
    async fn failed_delivery_discards_the_batch() {
        let notifier =
            ChatNotifier::new("http://127.0.0.1:9".into(), "token".into(), "chat".into()).unwrap();
        let dispatcher = AlertDispatcher::new(Some(notifier));
        for i in 0..12 {
            dispatcher.enqueue(format!("alert {i}"), Severity::Warning);
        }

        assert_eq!(dispatcher.flush().await, FlushOutcome::Dropped { drained: 10 });
        assert_eq!(dispatcher.pending(), 2);
    }

    #[test]
    fn payload_is_capped_on_a_message_boundary() {
        let batch: Vec<AlertMessage> = (0..FLUSH_BATCH_SIZE)
            .map(|_| AlertMessage {
                text: "&".repeat(MESSAGE_CHAR_LIMIT),
                severity: Severity::Critical,
            })
            .collect();
        let payload = render_payload(&batch);

        assert!(payload.chars().count() <= PAYLOAD_CHAR_LIMIT);
        assert!(payload.ends_with("&amp;"));
        assert!(!payload.ends_with("\n\n"));
    }

    #[test]
    fn long_messages_are_shortened_on_enqueue() {
        let dispatcher = AlertDispatcher::new(None);
        dispatcher.enqueue("x".repeat(MESSAGE_CHAR_LIMIT * 2), Severity::Info);
        let queue = dispatcher.queue.lock();
        assert_eq!(queue[0].text.chars().count(), MESSAGE_CHAR_LIMIT);
        assert!(queue[0].text.ends_with('…'));
    }
}
