//! Subscription registry: keeps one live GENA subscription per event source
//!
//! Entries are keyed by SID. The (location, service path, udn) triple is the
//! dedup key; a newer successful SUBSCRIBE for a triple replaces the older
//! entry. Nothing is ever unsubscribed; entries for devices that vanished are
//! pruned after discovery stops reporting them.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::topology::{EventSource, Topology};
use crate::upnp::gena::callback_url;
use crate::upnp::GenaClient;

/// Longest lease honoured. Larger negotiated values fall back to the request.
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub location: String,
    pub service: String,
    pub udn: String,
}

impl From<&EventSource> for SubscriptionKey {
    fn from(source: &EventSource) -> Self {
        Self {
            location: source.location.clone(),
            service: source.event_path.clone(),
            udn: source.udn.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub sid: String,
    pub udn: String,
    /// Event subscription path
    pub service: String,
    pub location: String,
    pub created: DateTime<Utc>,
    pub timeout_secs: u64,
    pub expires: DateTime<Utc>,
    /// Consecutive discovery passes without the device
    #[serde(skip)]
    missed_passes: u32,
}

impl Subscription {
    fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            location: self.location.clone(),
            service: self.service.clone(),
            udn: self.udn.clone(),
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// What `ensure_subscribed` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A live entry exists; nothing was sent
    Active,
    Subscribed { sid: String },
    /// Another caller is subscribing this key right now
    InFlight,
    /// Request failed; prior state untouched
    Failed,
}

pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Subscription>>,
    pending: Mutex<HashSet<SubscriptionKey>>,
    gena: GenaClient,
    requested_timeout_secs: u64,
    bus: SharedBus,
}

impl SubscriptionRegistry {
    pub fn new(gena: GenaClient, requested_timeout_secs: u64, bus: SharedBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            gena,
            requested_timeout_secs,
            bus,
        }
    }

    pub async fn ensure_subscribed(
        &self,
        callback_address: &str,
        source: &EventSource,
    ) -> EnsureOutcome {
        self.ensure_subscribed_at(callback_address, source, Utc::now())
            .await
    }

    /// `ensure_subscribed` against an explicit clock.
    pub async fn ensure_subscribed_at(
        &self,
        callback_address: &str,
        source: &EventSource,
        now: DateTime<Utc>,
    ) -> EnsureOutcome {
        let key = SubscriptionKey::from(source);

        if self.has_active(&key, now).await {
            return EnsureOutcome::Active;
        }
        if !self.pending.lock().await.insert(key.clone()) {
            debug!("Subscribe for {} {} already in flight", key.udn, key.service);
            return EnsureOutcome::InFlight;
        }

        let event_url = source.event_url();
        let callback = callback_url(callback_address, &source.udn);
        let result = self
            .gena
            .subscribe(&event_url, &callback, self.requested_timeout_secs)
            .await;

        let outcome = match result {
            Ok(response) => {
                let timeout_secs = response
                    .timeout_secs
                    .filter(|secs| *secs <= MAX_TIMEOUT_SECS)
                    .unwrap_or(self.requested_timeout_secs)
                    .min(MAX_TIMEOUT_SECS);
                info!(
                    "Subscribed to {} ({}) sid={} timeout={}s",
                    event_url, source.udn, response.sid, timeout_secs
                );
                self.record(&key, response.sid.clone(), timeout_secs, now)
                    .await;
                self.bus.publish(BusEvent::SubscriptionCreated {
                    sid: response.sid.clone(),
                    udn: source.udn.clone(),
                    service: source.event_path.clone(),
                    timeout_secs,
                });
                EnsureOutcome::Subscribed { sid: response.sid }
            }
            Err(e) => {
                warn!("SUBSCRIBE {} for {} failed: {}", event_url, source.udn, e);
                EnsureOutcome::Failed
            }
        };

        self.pending.lock().await.remove(&key);
        outcome
    }

    async fn has_active(&self, key: &SubscriptionKey, now: DateTime<Utc>) -> bool {
        self.entries
            .read()
            .await
            .values()
            .any(|s| s.is_active_at(now) && s.key() == *key)
    }

    async fn record(&self, key: &SubscriptionKey, sid: String, timeout_secs: u64, now: DateTime<Utc>) {
        let subscription = Subscription {
            sid: sid.clone(),
            udn: key.udn.clone(),
            service: key.service.clone(),
            location: key.location.clone(),
            created: now,
            timeout_secs,
            expires: now + Duration::seconds(timeout_secs.min(MAX_TIMEOUT_SECS) as i64),
            missed_passes: 0,
        };

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&sid) {
            if existing.key() != *key {
                warn!(
                    "Device reused sid {} for {} {}; replacing entry for {} {}",
                    sid, key.udn, key.service, existing.udn, existing.service
                );
            }
        }
        entries.retain(|existing_sid, existing| *existing_sid == sid || existing.key() != *key);
        entries.insert(sid, subscription);
    }

    /// Drops entries whose device has been missing for two discovery passes
    /// in a row. Returns how many were removed.
    pub async fn prune(&self, topology: &Topology) -> usize {
        let mut entries = self.entries.write().await;
        for subscription in entries.values_mut() {
            if topology.contains_device(&subscription.udn) {
                subscription.missed_passes = 0;
            } else {
                subscription.missed_passes += 1;
            }
        }
        let before = entries.len();
        entries.retain(|sid, s| {
            let keep = s.missed_passes < 2;
            if !keep {
                debug!("Pruning orphaned subscription {} for {}", sid, s.udn);
            }
            keep
        });
        before - entries.len()
    }

    /// All entries, sorted by udn then service.
    pub async fn list(&self) -> Vec<Subscription> {
        let mut list: Vec<Subscription> = self.entries.read().await.values().cloned().collect();
        list.sort_by(|a, b| (&a.udn, &a.service).cmp(&(&b.udn, &b.service)));
        list
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use crate::topology::model::fixtures;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(GenaClient::new(reqwest::Client::new()), 300, create_bus())
    }

    fn key(udn: &str, service: &str) -> SubscriptionKey {
        SubscriptionKey {
            location: "10.0.0.5:52000".to_string(),
            service: service.to_string(),
            udn: udn.to_string(),
        }
    }

    #[tokio::test]
    async fn test_newest_subscribe_replaces_entry_for_key() {
        let registry = registry();
        let now = Utc::now();
        registry.record(&key("uuid:zone-a", "/evt"), "sid-1".into(), 180, now).await;
        registry
            .record(&key("uuid:zone-a", "/evt"), "sid-2".into(), 180, now + Duration::seconds(181))
            .await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].sid, "sid-2");
    }

    #[tokio::test]
    async fn test_reused_sid_keeps_newest_key() {
        let registry = registry();
        let now = Utc::now();
        registry.record(&key("uuid:zone-a", "/evt"), "sid-1".into(), 180, now).await;
        registry.record(&key("uuid:zone-b", "/evt"), "sid-1".into(), 180, now).await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].udn, "uuid:zone-b");
    }

    #[tokio::test]
    async fn test_active_until_expiry() {
        let registry = registry();
        let now = Utc::now();
        let k = key("uuid:zone-a", "/evt");
        registry.record(&k, "sid-1".into(), 180, now).await;

        assert!(registry.has_active(&k, now + Duration::seconds(10)).await);
        assert!(!registry.has_active(&k, now + Duration::seconds(180)).await);
        assert!(!registry.has_active(&key("uuid:zone-a", "/other"), now).await);
    }

    #[tokio::test]
    async fn test_prune_on_second_absent_pass() {
        let registry = registry();
        let now = Utc::now();
        registry.record(&key("uuid:zone-a", "/evt"), "sid-a".into(), 300, now).await;
        registry.record(&key("uuid:gone", "/evt"), "sid-gone".into(), 300, now).await;
        let topology = fixtures::topology();

        assert_eq!(registry.prune(&topology).await, 0);
        assert_eq!(registry.count().await, 2);

        assert_eq!(registry.prune(&topology).await, 1);
        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].sid, "sid-a");
    }

    #[tokio::test]
    async fn test_prune_resets_when_device_returns() {
        let registry = registry();
        let now = Utc::now();
        registry.record(&key("uuid:zone-a", "/evt"), "sid-a".into(), 300, now).await;

        assert_eq!(registry.prune(&Topology::default()).await, 0);
        assert_eq!(registry.prune(&fixtures::topology()).await, 0);
        assert_eq!(registry.prune(&Topology::default()).await, 0);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_prior_entry() {
        let registry = registry();
        let now = Utc::now();
        let source = EventSource {
            udn: "uuid:zone-a".to_string(),
            // Nothing listens on port 9 locally
            location: "127.0.0.1:9".to_string(),
            event_path: "/evt".to_string(),
        };
        registry
            .record(&SubscriptionKey::from(&source), "sid-old".into(), 180, now)
            .await;

        let outcome = registry
            .ensure_subscribed_at("127.0.0.1:28080", &source, now + Duration::seconds(200))
            .await;

        assert_eq!(outcome, EnsureOutcome::Failed);
        assert_eq!(registry.list().await[0].sid, "sid-old");
        assert!(registry.pending.lock().await.is_empty());
    }
}
