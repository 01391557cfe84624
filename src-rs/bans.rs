use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::{
    serde_store::{de_opt_utc_timestamp, de_utc_timestamp},
    store::DocumentStore,
};

/// Administrative ban on a user id or an IP address. Issued and lifted by
/// operators; this service only reads them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ban {
    #[serde(alias = "_id")]
    pub id: String,
    pub target: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub banned_by: Option<String>,
    #[serde(deserialize_with = "de_utc_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "de_opt_utc_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Ban {
    /// Both `active` and `expires_at` are authoritative: an expired ban is not
    /// in force even if nobody has cleared `active` yet.
    pub fn is_in_force(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    fn outlasts(&self, other: &Ban) -> bool {
        match (self.expires_at, other.expires_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => mine > theirs,
        }
    }
}

#[derive(Debug, Default)]
struct BanSnapshot {
    users: HashMap<String, Ban>,
    ips: HashMap<String, Ban>,
}

/// In-memory copy of the active ban lists, refreshed from the store.
#[derive(Clone, Default)]
pub struct BanList {
    snapshot: Arc<RwLock<BanSnapshot>>,
}

impl BanList {
    pub fn replace(&self, user_bans: Vec<Ban>, ip_bans: Vec<Ban>) {
        let next = BanSnapshot {
            users: index_by_target(user_bans),
            ips: index_by_target(ip_bans),
        };
        *self.snapshot.write() = next;
    }

    pub fn user_ban(&self, user_id: &str, now: DateTime<Utc>) -> Option<Ban> {
        self.snapshot
            .read()
            .users
            .get(user_id)
            .filter(|ban| ban.is_in_force(now))
            .cloned()
    }

    pub fn ip_ban(&self, ip: &str, now: DateTime<Utc>) -> Option<Ban> {
        self.snapshot
            .read()
            .ips
            .get(ip)
            .filter(|ban| ban.is_in_force(now))
            .cloned()
    }

    pub fn count(&self) -> usize {
        let snapshot = self.snapshot.read();
        snapshot.users.len() + snapshot.ips.len()
    }

    pub async fn refresh(&self, store: &DocumentStore) -> anyhow::Result<usize> {
        let user_bans: Vec<Ban> = store
            .query("bans:listActive", json!({}))
            .await
            .context("failed to load user bans")?;
        let ip_bans: Vec<Ban> = store
            .query("ipBans:listActive", json!({}))
            .await
            .context("failed to load IP bans")?;

        self.replace(user_bans, ip_bans);
        Ok(self.count())
    }

    /// Periodic refresh. A failed refresh keeps the previous snapshot.
    pub fn spawn_refresh(&self, store: DocumentStore, period: Duration) -> JoinHandle<()> {
        let bans = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match bans.refresh(&store).await {
                    Ok(count) => tracing::debug!(bans = count, "ban list refreshed"),
                    Err(error) => {
                        tracing::warn!(error = ?error, "ban list refresh failed; keeping previous snapshot")
                    }
                }
            }
        })
    }
}

fn index_by_target(bans: Vec<Ban>) -> HashMap<String, Ban> {
    let mut indexed: HashMap<String, Ban> = HashMap::new();
    for ban in bans.into_iter().filter(|ban| ban.active) {
        let target = ban.target.trim().to_string();
        match indexed.get(&target) {
            Some(existing) if !ban.outlasts(existing) => {}
            _ => {
                indexed.insert(target, ban);
            }
        }
    }
    indexed
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;

    fn ban(target: &str, active: bool, expires_in: Option<i64>) -> Ban {
        let now = Utc::now();
        Ban {
            id: format!("ban-{target}"),
            target: target.to_string(),
            reason: Some("multi-accounting".into()),
            banned_by: Some("mod-1".into()),
            created_at: now,
            expires_at: expires_in.map(|secs| now + ChronoDuration::seconds(secs)),
            active,
        }
    }

    #[test]
    fn in_force_requires_active_and_unexpired() {
        let now = Utc::now();
        assert!(ban("u1", true, None).is_in_force(now));
        assert!(ban("u1", true, Some(3600)).is_in_force(now));
        assert!(!ban("u1", true, Some(-1)).is_in_force(now));
        assert!(!ban("u1", false, None).is_in_force(now));
    }

    #[test]
    fn lookups_apply_expiry_at_read_time() {
        let bans = BanList::default();
        bans.replace(
            vec![ban("u1", true, Some(60)), ban("u2", false, None)],
            vec![ban("203.0.113.9", true, None)],
        );

        let now = Utc::now();
        assert!(bans.user_ban("u1", now).is_some());
        assert!(bans.user_ban("u1", now + ChronoDuration::seconds(120)).is_none());
        assert!(bans.user_ban("u2", now).is_none());
        assert!(bans.ip_ban("203.0.113.9", now).is_some());
        assert!(bans.ip_ban("198.51.100.1", now).is_none());
    }

    #[test]
    fn longest_ban_wins_for_duplicate_targets() {
        let bans = BanList::default();
        bans.replace(
            vec![
                ban("u1", true, Some(60)),
                ban("u1", true, None),
                ban("u1", true, Some(600)),
            ],
            Vec::new(),
        );
        let found = bans.user_ban("u1", Utc::now()).unwrap();
        assert!(found.expires_at.is_none());
        assert_eq!(bans.count(), 1);
    }

    #[test]
    fn decodes_store_records() {
        let decoded: Vec<Ban> = serde_json::from_value(json!([
            {
                "_id": "k1",
                "target": "u1",
                "reason": "botting",
                "banned_by": "admin",
                "created_at": 1_700_000_000_000_i64,
                "expires_at": null,
                "active": true
            },
            {
                "id": "k2",
                "target": "10.0.0.1",
                "created_at": "2026-03-01T00:00:00Z",
                "expires_at": 1_900_000_000_000.0_f64,
                "active": true
            }
        ]))
        .unwrap();

        assert_eq!(decoded[0].id, "k1");
        assert!(decoded[0].expires_at.is_none());
        assert_eq!(decoded[1].banned_by, None);
        assert_eq!(decoded[1].expires_at.map(|t| t.timestamp()), Some(1_900_000_000));
    }
}
