//! Client pool
//!
//! Owns one `QbitClient` per configured instance: lazy construction with a
//! per-id singleflight lock, a health cache published to the API layer, a
//! background probe loop with exponential backoff, and eviction when the
//! admin layer mutates or deletes an instance.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::PoolSettings;
use crate::db::instances::{Instance, InstanceChange, InstanceStore};
use crate::qbit::{QbitClient, QbitError};

/// Published health of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Connected,
    Unauthenticated,
    Unreachable,
    /// No call has touched this instance yet
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub health: Health,
    pub connected: bool,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Instance {0} not found")]
    NotFound(i64),

    #[error("Instance {0} is disabled")]
    Disabled(i64),

    #[error("Authentication failed")]
    AuthFailure(#[source] QbitError),

    #[error("Client unavailable: {0}")]
    Unavailable(#[source] QbitError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Mutable health bookkeeping for one entry
struct EntryStatus {
    health: Health,
    last_error: Option<String>,
    since: DateTime<Utc>,
    consecutive_failures: u32,
    consecutive_auth_failures: u32,
    next_probe_at: DateTime<Utc>,
}

impl EntryStatus {
    fn new() -> Self {
        Self {
            health: Health::Unknown,
            last_error: None,
            since: Utc::now(),
            consecutive_failures: 0,
            consecutive_auth_failures: 0,
            next_probe_at: Utc::now(),
        }
    }
}

/// Runtime companion to one instance. The client mutex doubles as the
/// singleflight lock for first-time construction and login.
struct ClientEntry {
    client: Mutex<Option<Arc<QbitClient>>>,
    status: std::sync::Mutex<EntryStatus>,
}

impl ClientEntry {
    fn new() -> Self {
        Self {
            client: Mutex::new(None),
            status: std::sync::Mutex::new(EntryStatus::new()),
        }
    }
}

pub struct ClientPool {
    instances: InstanceStore,
    settings: PoolSettings,
    entries: RwLock<HashMap<i64, Arc<ClientEntry>>>,
    shutdown: watch::Receiver<bool>,
}

/// Probe delay after `failures` consecutive failures: exponential from the
/// base interval, capped.
pub fn probe_backoff(base: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    base.saturating_mul(factor).min(max)
}

impl ClientPool {
    pub fn new(
        instances: InstanceStore,
        settings: PoolSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances,
            settings,
            entries: RwLock::new(HashMap::new()),
            shutdown,
        })
    }

    /// Spawn the health probe loop and the instance-change listener
    pub fn start(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move { pool.health_loop().await });

        let pool = self.clone();
        let mut changes = self.instances.on_change();
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                match change {
                    InstanceChange::Updated(id) | InstanceChange::Deleted(id) => {
                        pool.invalidate(id).await;
                    }
                    InstanceChange::Created(_) => {}
                }
            }
        });
    }

    /// Get the live client for an instance, constructing and logging in on
    /// first use. Concurrent first-time callers serialize on the entry lock.
    pub async fn get_client(&self, id: i64) -> Result<Arc<QbitClient>> {
        let instance = self.lookup_instance(id)?;
        let entry = self.entry(id).await;

        let mut slot = entry.client.lock().await;
        if slot.is_none() {
            let client = QbitClient::new(
                &instance.base_url,
                instance.username.as_deref().unwrap_or(""),
                instance.password.as_deref().unwrap_or(""),
                Duration::from_secs(self.settings.request_timeout_secs),
            )
            .map_err(PoolError::Unavailable)?;
            *slot = Some(Arc::new(client));
        }
        let client = slot.as_ref().unwrap().clone();

        match client.login().await {
            Ok(()) => {
                drop(slot);
                self.note_success(&entry);
                Ok(client)
            }
            Err(QbitError::AuthenticationFailed) => {
                // Two consecutive auth failures evict the cookie jar so the
                // next attempt starts a clean session.
                let evict = {
                    let mut status = entry.status.lock().unwrap();
                    status.consecutive_auth_failures += 1;
                    status.consecutive_failures += 1;
                    status.health = Health::Unauthenticated;
                    status.last_error = Some("authentication failed".to_string());
                    status.since = Utc::now();
                    status.consecutive_auth_failures >= 2
                };
                if evict {
                    *slot = None;
                    debug!("Evicted session for instance {} after repeated auth failures", id);
                }
                Err(PoolError::AuthFailure(QbitError::AuthenticationFailed))
            }
            Err(e) => {
                // Network errors never evict; the entry and its cookies stay.
                drop(slot);
                self.note_failure(&entry, &e);
                Err(PoolError::Unavailable(e))
            }
        }
    }

    /// Non-blocking read of the health cache
    pub async fn health(&self, id: i64) -> HealthStatus {
        let entries = self.entries.read().await;
        match entries.get(&id) {
            Some(entry) => {
                let status = entry.status.lock().unwrap();
                HealthStatus {
                    health: status.health,
                    connected: status.health == Health::Connected,
                    last_error: status.last_error.clone(),
                    since: status.since,
                }
            }
            None => HealthStatus {
                health: Health::Unknown,
                connected: false,
                last_error: None,
                since: Utc::now(),
            },
        }
    }

    pub async fn is_healthy(&self, id: i64) -> bool {
        self.health(id).await.connected
    }

    /// Snapshot of all active instances, for fan-out callers
    pub fn all_instances(&self) -> Vec<Instance> {
        self.instances
            .list()
            .unwrap_or_default()
            .into_iter()
            .filter(|i| i.active)
            .collect()
    }

    /// Force eviction: cookies and cached state go; the next `get_client`
    /// re-authenticates from scratch.
    pub async fn invalidate(&self, id: i64) {
        let removed = self.entries.write().await.remove(&id);
        if removed.is_some() {
            info!("Invalidated client for instance {}", id);
        }
    }

    /// Record a successful upstream call made outside the pool. Resets the
    /// failure counters and re-arms the probe at the base interval.
    pub async fn record_success(&self, id: i64) {
        let entry = self.entry(id).await;
        self.note_success(&entry);
    }

    /// Record a failed upstream call made outside the pool
    pub async fn record_failure(&self, id: i64, error: &QbitError) {
        let entry = self.entry(id).await;
        self.note_failure(&entry, error);
    }

    fn lookup_instance(&self, id: i64) -> Result<Instance> {
        let instance = self
            .instances
            .get_by_id(id)
            .ok()
            .flatten()
            .ok_or(PoolError::NotFound(id))?;
        if !instance.active {
            return Err(PoolError::Disabled(id));
        }
        Ok(instance)
    }

    async fn entry(&self, id: i64) -> Arc<ClientEntry> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&id) {
                return entry.clone();
            }
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(id)
            .or_insert_with(|| Arc::new(ClientEntry::new()))
            .clone()
    }

    fn note_success(&self, entry: &ClientEntry) {
        let mut status = entry.status.lock().unwrap();
        if status.health != Health::Connected {
            status.since = Utc::now();
        }
        status.health = Health::Connected;
        status.last_error = None;
        status.consecutive_failures = 0;
        status.consecutive_auth_failures = 0;
        status.next_probe_at =
            Utc::now() + chrono::Duration::seconds(self.settings.health_interval_secs as i64);
    }

    fn note_failure(&self, entry: &ClientEntry, error: &QbitError) {
        let mut status = entry.status.lock().unwrap();
        status.consecutive_failures += 1;
        if status.health != Health::Unreachable {
            status.since = Utc::now();
        }
        status.health = match error {
            QbitError::AuthenticationFailed => Health::Unauthenticated,
            _ => Health::Unreachable,
        };
        status.last_error = Some(error.to_string());

        let delay = probe_backoff(
            Duration::from_secs(self.settings.health_interval_secs),
            status.consecutive_failures,
            Duration::from_secs(self.settings.health_backoff_max_secs),
        );
        status.next_probe_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    }

    /// Background re-probe of every registered instance. Failed instances
    /// back off exponentially; any success resets to the base cadence.
    async fn health_loop(self: Arc<Self>) {
        let tick = Duration::from_secs(self.settings.health_interval_secs.clamp(1, 5));
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Health loop stopping");
                        return;
                    }
                }
            }

            for instance in self.all_instances() {
                let due = {
                    let entries = self.entries.read().await;
                    match entries.get(&instance.id) {
                        Some(entry) => {
                            let status = entry.status.lock().unwrap();
                            status.next_probe_at <= Utc::now()
                        }
                        None => true,
                    }
                };
                if !due {
                    continue;
                }

                match self.probe(instance.id).await {
                    Ok(()) => debug!("Instance {} healthy", instance.id),
                    Err(e) => warn!("Instance {} probe failed: {}", instance.id, e),
                }
            }
        }
    }

    async fn probe(&self, id: i64) -> Result<()> {
        let client = self.get_client(id).await?;
        match client.get_version().await {
            Ok(_) => {
                self.record_success(id).await;
                Ok(())
            }
            Err(e) => {
                self.record_failure(id, &e).await;
                Err(PoolError::Unavailable(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::instances::InstanceInput;
    use crate::db::Database;

    fn make_pool() -> (Arc<ClientPool>, InstanceStore) {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db);
        let (_tx, rx) = watch::channel(false);
        let pool = ClientPool::new(store.clone(), PoolSettings::default(), rx);
        (pool, store)
    }

    #[test]
    fn test_probe_backoff_growth_and_cap() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        assert_eq!(probe_backoff(base, 0, max), Duration::from_secs(30));
        assert_eq!(probe_backoff(base, 1, max), Duration::from_secs(60));
        assert_eq!(probe_backoff(base, 2, max), Duration::from_secs(120));
        assert_eq!(probe_backoff(base, 3, max), Duration::from_secs(240));
        assert_eq!(probe_backoff(base, 4, max), Duration::from_secs(300));
        assert_eq!(probe_backoff(base, 30, max), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_get_client_unknown_instance() {
        let (pool, _store) = make_pool();
        match pool.get_client(99).await {
            Err(PoolError::NotFound(99)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_get_client_disabled_instance() {
        let (pool, store) = make_pool();
        let instance = store
            .create(&InstanceInput {
                name: "off".into(),
                base_url: "http://127.0.0.1:1".into(),
                username: None,
                password: None,
                active: false,
                sync_interval_mins: 0,
            })
            .unwrap();
        match pool.get_client(instance.id).await {
            Err(PoolError::Disabled(id)) => assert_eq!(id, instance.id),
            other => panic!("expected Disabled, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unreachable_instance_reports_unavailable_and_health() {
        let (pool, store) = make_pool();
        // Port 1 refuses connections immediately.
        let instance = store
            .create(&InstanceInput {
                name: "dead".into(),
                base_url: "http://127.0.0.1:1".into(),
                username: Some("admin".into()),
                password: Some("x".into()),
                active: true,
                sync_interval_mins: 0,
            })
            .unwrap();

        match pool.get_client(instance.id).await {
            Err(PoolError::Unavailable(_)) => {}
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }

        let health = pool.health(instance.id).await;
        assert_eq!(health.health, Health::Unreachable);
        assert!(!health.connected);
        assert!(health.last_error.is_some());
    }

    #[tokio::test]
    async fn test_health_unknown_before_first_use() {
        let (pool, store) = make_pool();
        let instance = store
            .create(&InstanceInput {
                name: "idle".into(),
                base_url: "http://127.0.0.1:1".into(),
                username: None,
                password: None,
                active: true,
                sync_interval_mins: 0,
            })
            .unwrap();
        assert_eq!(pool.health(instance.id).await.health, Health::Unknown);
    }

    #[tokio::test]
    async fn test_record_success_resets_failures() {
        let (pool, store) = make_pool();
        let instance = store
            .create(&InstanceInput {
                name: "flaky".into(),
                base_url: "http://127.0.0.1:1".into(),
                username: None,
                password: None,
                active: true,
                sync_interval_mins: 0,
            })
            .unwrap();

        let _ = pool.get_client(instance.id).await;
        assert_eq!(pool.health(instance.id).await.health, Health::Unreachable);

        pool.record_success(instance.id).await;
        let health = pool.health(instance.id).await;
        assert_eq!(health.health, Health::Connected);
        assert!(health.connected);
        assert!(health.last_error.is_none());
    }
}
