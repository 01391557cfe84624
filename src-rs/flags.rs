use std::{collections::VecDeque, fmt, sync::Arc};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{alerts::Severity, store::DocumentStore};

const FLAG_QUEUE_CAPACITY: usize = 4096;
const MEMORY_FLAG_LIMIT: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    RequestSpam,
    DuplicateRequest,
    FailedActionSpam,
    ExploitAttempt,
    ImpossibleStat,
    RapidTransfer,
}

impl FlagKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagKind::RequestSpam => "request_spam",
            FlagKind::DuplicateRequest => "duplicate_request",
            FlagKind::FailedActionSpam => "failed_action_spam",
            FlagKind::ExploitAttempt => "exploit_attempt",
            FlagKind::ImpossibleStat => "impossible_stat",
            FlagKind::RapidTransfer => "rapid_transfer",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            FlagKind::RequestSpam | FlagKind::DuplicateRequest | FlagKind::FailedActionSpam => {
                Severity::Warning
            }
            FlagKind::RapidTransfer | FlagKind::ImpossibleStat => Severity::Critical,
            FlagKind::ExploitAttempt => Severity::Exploit,
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of a suspected abuse event. `id` and `created_at` are filled
/// in by [`FlagStore::record`] when left unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityFlag {
    pub id: Option<Uuid>,
    pub user_id: String,
    pub username: Option<String>,
    pub flag_type: FlagKind,
    pub reason: String,
    pub details: Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub resolved: bool,
}

impl SecurityFlag {
    pub fn new(
        user_id: impl Into<String>,
        username: Option<String>,
        flag_type: FlagKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            user_id: user_id.into(),
            username,
            flag_type,
            reason: reason.into(),
            details: Map::new(),
            created_at: None,
            resolved: false,
        }
    }

    #[cfg(test)]
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details.extend(details);
        self
    }

    fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.id.get_or_insert_with(Uuid::new_v4);
        self.created_at.get_or_insert(now);
        self
    }
}

#[derive(Clone)]
enum FlagBackend {
    Store(DocumentStore),
    Memory(Arc<Mutex<VecDeque<SecurityFlag>>>),
}

impl FlagBackend {
    async fn persist(&self, flag: &SecurityFlag) -> anyhow::Result<()> {
        match self {
            FlagBackend::Store(store) => {
                let args = serde_json::to_value(flag).context("failed to encode security flag")?;
                store
                    .mutation("securityFlags:create", args)
                    .await
                    .context("failed to write security flag")?;
                Ok(())
            }
            FlagBackend::Memory(flags) => {
                let mut flags = flags.lock();
                if flags.len() >= MEMORY_FLAG_LIMIT {
                    flags.pop_front();
                }
                flags.push_back(flag.clone());
                Ok(())
            }
        }
    }
}

/// Write side of the flag audit trail.
///
/// `record` only enqueues; a worker task owns the backend and logs failed
/// writes. Nothing here can fail or slow down the request that raised the flag.
#[derive(Clone)]
pub struct FlagStore {
    tx: mpsc::Sender<SecurityFlag>,
    memory: Option<Arc<Mutex<VecDeque<SecurityFlag>>>>,
}

impl FlagStore {
    pub fn remote(store: DocumentStore) -> Self {
        Self::spawn(FlagBackend::Store(store), None)
    }

    /// Keeps flags in process memory. Used when no document store is configured.
    pub fn in_memory() -> Self {
        let flags = Arc::new(Mutex::new(VecDeque::new()));
        Self::spawn(FlagBackend::Memory(flags.clone()), Some(flags))
    }

    fn spawn(backend: FlagBackend, memory: Option<Arc<Mutex<VecDeque<SecurityFlag>>>>) -> Self {
        let (tx, rx) = mpsc::channel(FLAG_QUEUE_CAPACITY);
        tokio::spawn(run_flag_writer(backend, rx));
        Self { tx, memory }
    }

    pub fn record(&self, flag: SecurityFlag) {
        let flag = flag.stamped(Utc::now());
        match self.tx.try_send(flag) {
            Ok(()) => {}
            Err(TrySendError::Full(flag)) => {
                tracing::error!(
                    user_id = %flag.user_id,
                    flag_type = %flag.flag_type,
                    "flag queue full; dropping security flag"
                );
            }
            Err(TrySendError::Closed(flag)) => {
                tracing::error!(
                    user_id = %flag.user_id,
                    flag_type = %flag.flag_type,
                    "flag writer stopped; dropping security flag"
                );
            }
        }
    }

    /// Number of flags held in memory. Always 0 for the remote backend.
    pub fn recorded_count(&self) -> usize {
        self.memory.as_ref().map_or(0, |flags| flags.lock().len())
    }

    #[cfg(test)]
    pub fn recorded(&self) -> Vec<SecurityFlag> {
        self.memory
            .as_ref()
            .map(|flags| flags.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        FLAG_QUEUE_CAPACITY - self.tx.capacity()
    }
}

async fn run_flag_writer(backend: FlagBackend, mut rx: mpsc::Receiver<SecurityFlag>) {
    while let Some(flag) = rx.recv().await {
        match backend.persist(&flag).await {
            Ok(()) => {
                tracing::debug!(
                    flag_id = ?flag.id,
                    user_id = %flag.user_id,
                    flag_type = %flag.flag_type,
                    "security flag persisted"
                );
            }
            Err(error) => {
                tracing::error!(
                    error = ?error,
                    flag_id = ?flag.id,
                    user_id = %flag.user_id,
                    flag_type = %flag.flag_type,
                    "failed to persist security flag"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::json;

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

    #[test]
    fn severe_kinds_escalate() {
        assert_eq!(FlagKind::RequestSpam.severity(), Severity::Warning);
        assert_eq!(FlagKind::DuplicateRequest.severity(), Severity::Warning);
        assert_eq!(FlagKind::RapidTransfer.severity(), Severity::Critical);
        assert_eq!(FlagKind::ImpossibleStat.severity(), Severity::Critical);
        assert_eq!(FlagKind::ExploitAttempt.severity(), Severity::Exploit);
    }

    #[test]
    fn serialized_flag_matches_record_shape() {
        let flag = SecurityFlag::new("u1", Some("vito".into()), FlagKind::RequestSpam, "too fast")
            .with_detail("count", 11)
            .stamped(Utc::now());
        let value = serde_json::to_value(&flag).unwrap();
        let object = value.as_object().unwrap();

        for field in [
            "id", "user_id", "username", "flag_type", "reason", "details", "created_at", "resolved",
        ] {
            assert!(object.contains_key(field), "missing {field}");
        }
        assert_eq!(value["flag_type"], "request_spam");
        assert_eq!(value["details"]["count"], 11);
        assert_eq!(value["resolved"], false);
    }

    #[tokio::test]
    async fn record_assigns_id_and_timestamp_only_when_unset() {
        let store = FlagStore::in_memory();
        let preset = Uuid::new_v4();

        store.record(SecurityFlag::new("u1", None, FlagKind::DuplicateRequest, "replay"));
        let mut explicit = SecurityFlag::new("u2", None, FlagKind::ExploitAttempt, "negative bet");
        explicit.id = Some(preset);
        store.record(explicit);

        assert!(wait_until(|| store.recorded().len() == 2).await);
        let flags = store.recorded();
        assert!(flags[0].id.is_some());
        assert!(flags[0].created_at.is_some());
        assert_eq!(flags[1].id, Some(preset));
        assert!(flags.iter().all(|flag| !flag.resolved));
    }

    #[tokio::test]
    async fn remote_backend_posts_create_mutation() {
        let captured: Arc<Mutex<Vec<Value>>> = Arc::default();
        let app = Router::new()
            .route(
                "/api/mutation",
                post(
                    |State(captured): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                        captured.lock().push(body);
                        Json(json!({ "status": "success", "value": null }))
                    },
                ),
            )
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let store = FlagStore::remote(DocumentStore::new(format!("http://{addr}")).unwrap());
        store.record(
            SecurityFlag::new("u1", Some("vito".into()), FlagKind::RapidTransfer, "transfers")
                .with_detail("count", 6),
        );

        assert!(wait_until(|| !captured.lock().is_empty()).await);
        let body = captured.lock()[0].clone();
        assert_eq!(body["path"], "securityFlags:create");
        assert_eq!(body["args"][0]["flag_type"], "rapid_transfer");
        assert_eq!(body["args"][0]["details"]["count"], 6);
        assert!(store.recorded().is_empty());
    }

    #[tokio::test]
    async fn unreachable_store_is_absorbed() {
        let store = FlagStore::remote(DocumentStore::new("http://127.0.0.1:9".into()).unwrap());
        store.record(SecurityFlag::new("u1", None, FlagKind::RequestSpam, "spam"));
        store.record(SecurityFlag::new("u1", None, FlagKind::RequestSpam, "spam"));

        assert!(wait_until(|| store.pending() == 0).await);
    }
}
