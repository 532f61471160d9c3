//! SSE stream manager
//!
//! Many clients subscribe to `(instance, page, limit, sort, order, search,
//! filters)` shapes; identical shapes coalesce into one group with a single
//! in-flight send, so a burst of sync updates costs one upstream query per
//! group no matter how many clients watch it.

use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::sync::filter::{QueryOptions, SortOrder, TorrentFilters, MAX_LIMIT};
use crate::sync::{SyncEvent, SyncManager};

/// Sync-failure backoff bounds
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_MAX_SECS: u64 = 30;

/// Outbound channel depth per connection; a client that cannot drain this
/// many events only loses intermediate payloads, never the latest.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Invalid stream request: {0}")]
    Validation(String),

    #[error("Shutting down")]
    ShuttingDown,
}

/// One entry of the `streams` query parameter
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// Echoed back on every event so the client can demultiplex
    #[serde(default)]
    pub key: Option<String>,
    pub instance_id: i64,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub filters: TorrentFilters,
}

impl StreamRequest {
    /// Validate and normalize into query options. `limit` outside
    /// `[1, 2000]` is a client error, not something to silently clamp.
    pub fn into_options(self) -> Result<(i64, QueryOptions), StreamError> {
        if self.instance_id <= 0 {
            return Err(StreamError::Validation("instanceId must be > 0".into()));
        }
        let limit = self.limit.unwrap_or(crate::sync::filter::DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(StreamError::Validation(format!(
                "limit must be in [1, {MAX_LIMIT}]"
            )));
        }

        let mut opts = QueryOptions {
            page: self.page,
            limit,
            sort: self
                .sort
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| crate::sync::filter::DEFAULT_SORT.to_string()),
            order: SortOrder::parse(self.order.as_deref().unwrap_or("desc")),
            search: self.search,
            filters: self.filters,
        };
        opts.normalize();
        Ok((self.instance_id, opts))
    }
}

/// What the handler writes to the wire: `event: <event>\ndata: <json>\n\n`
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

fn make_event(
    event_type: &str,
    instance_id: i64,
    stream_key: &str,
    data: Option<serde_json::Value>,
    error: Option<String>,
    retry_in_seconds: Option<u64>,
) -> OutboundEvent {
    let mut meta = serde_json::json!({
        "instanceId": instance_id,
        "timestamp": Utc::now().timestamp(),
        "streamKey": stream_key,
    });
    if let Some(retry) = retry_in_seconds {
        meta["retryInSeconds"] = serde_json::json!(retry);
    }
    let mut payload = serde_json::json!({ "type": event_type, "meta": meta });
    if let Some(data) = data {
        payload["data"] = data;
    }
    if let Some(error) = error {
        payload["error"] = serde_json::json!(error);
    }
    OutboundEvent {
        event: event_type.to_string(),
        payload,
    }
}

/// What a group is waiting to broadcast. Updates carry no payload: the page
/// is built at send time so members always get the newest snapshot.
#[derive(Debug, Clone)]
enum PendingEvent {
    Update,
    Error { message: String, retry_secs: u64 },
}

struct Member {
    client_key: String,
    tx: mpsc::Sender<OutboundEvent>,
}

#[derive(Default)]
struct GroupState {
    members: HashMap<String, Member>,
    pending: Option<PendingEvent>,
    sending: bool,
}

struct Group {
    instance_id: i64,
    options: QueryOptions,
    state: std::sync::Mutex<GroupState>,
}

#[derive(Default)]
struct Registry {
    groups: HashMap<String, Arc<Group>>,
    groups_by_instance: HashMap<i64, HashSet<String>>,
    /// subscription id -> group key
    subscriptions: HashMap<String, String>,
    /// connection id -> subscription ids
    connections: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct BackoffState {
    attempt: u32,
}

/// `min(base * 2^attempt, max)` in seconds
fn backoff_secs(attempt: u32) -> u64 {
    BACKOFF_BASE_SECS
        .saturating_mul(2u64.saturating_pow(attempt.min(16)))
        .min(BACKOFF_MAX_SECS)
}

pub struct StreamManager {
    sync: Arc<SyncManager>,
    registry: std::sync::RwLock<Registry>,
    backoff: std::sync::Mutex<HashMap<i64, BackoffState>>,
    heartbeat: Duration,
    shutting_down: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl StreamManager {
    pub fn new(
        sync: Arc<SyncManager>,
        heartbeat: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sync,
            registry: std::sync::RwLock::new(Registry::default()),
            backoff: std::sync::Mutex::new(HashMap::new()),
            heartbeat,
            shutting_down: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Spawn the sync-event listener and the heartbeat loop
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let mut events = self.sync.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SyncEvent::Updated { instance_id } => manager.handle_main_data(instance_id),
                    SyncEvent::Failed { instance_id, error } => {
                        manager.handle_sync_error(instance_id, &error)
                    }
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move { manager.heartbeat_loop().await });

        let manager = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if shutdown.changed().await.is_err() {
                    return;
                }
                if *shutdown.borrow() {
                    manager.shutdown();
                    return;
                }
            }
        });
    }

    /// Register one connection's stream requests. Returns the connection id
    /// and the event receiver; dropping the receiver ends delivery, and the
    /// handler must call `unregister_connection` on disconnect.
    pub fn register_connection(
        self: &Arc<Self>,
        requests: Vec<StreamRequest>,
    ) -> Result<(String, mpsc::Receiver<OutboundEvent>), StreamError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StreamError::ShuttingDown);
        }
        if requests.is_empty() {
            return Err(StreamError::Validation("streams must not be empty".into()));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection_id = uuid::Uuid::new_v4().to_string();
        let mut joined_groups = Vec::new();

        {
            let mut registry = self.registry.write().unwrap();
            for request in requests {
                let client_key = request.key.clone();
                let (instance_id, options) = request.into_options()?;
                let group_key = options.canonical_key(instance_id);
                let sub_id = uuid::Uuid::new_v4().to_string();
                let client_key = client_key.unwrap_or_else(|| sub_id.clone());

                let group = registry
                    .groups
                    .entry(group_key.clone())
                    .or_insert_with(|| {
                        Arc::new(Group {
                            instance_id,
                            options: options.clone(),
                            state: std::sync::Mutex::new(GroupState::default()),
                        })
                    })
                    .clone();
                group.state.lock().unwrap().members.insert(
                    sub_id.clone(),
                    Member {
                        client_key,
                        tx: tx.clone(),
                    },
                );

                registry
                    .groups_by_instance
                    .entry(instance_id)
                    .or_default()
                    .insert(group_key.clone());
                registry.subscriptions.insert(sub_id.clone(), group_key);
                registry
                    .connections
                    .entry(connection_id.clone())
                    .or_default()
                    .push(sub_id);
                joined_groups.push(group);
            }
        }

        // Seed every joined group with a first payload.
        for group in joined_groups {
            self.enqueue_group(&group, PendingEvent::Update);
        }

        Ok((connection_id, rx))
    }

    /// Remove one subscription; empty groups are garbage-collected
    pub fn unregister(&self, sub_id: &str) {
        let mut registry = self.registry.write().unwrap();
        let group_key = match registry.subscriptions.remove(sub_id) {
            Some(k) => k,
            None => return,
        };
        let empty = match registry.groups.get(&group_key) {
            Some(group) => {
                let mut state = group.state.lock().unwrap();
                state.members.remove(sub_id);
                state.members.is_empty()
            }
            None => false,
        };
        if empty {
            if let Some(group) = registry.groups.remove(&group_key) {
                if let Some(keys) = registry.groups_by_instance.get_mut(&group.instance_id) {
                    keys.remove(&group_key);
                }
                debug!("Garbage-collected stream group {}", group_key);
            }
        }
    }

    /// Remove every subscription a connection registered
    pub fn unregister_connection(&self, connection_id: &str) {
        let sub_ids = {
            let mut registry = self.registry.write().unwrap();
            registry.connections.remove(connection_id).unwrap_or_default()
        };
        for sub_id in sub_ids {
            self.unregister(&sub_id);
        }
    }

    /// Fan a successful sync out to every group of that instance
    pub fn handle_main_data(self: &Arc<Self>, instance_id: i64) {
        self.backoff.lock().unwrap().remove(&instance_id);
        for group in self.groups_of(instance_id) {
            self.enqueue_group(&group, PendingEvent::Update);
        }
    }

    /// Convert a sync failure into error events with a retry hint. The
    /// subscriptions stay alive; only the hint grows.
    pub fn handle_sync_error(self: &Arc<Self>, instance_id: i64, error: &str) {
        let retry_secs = {
            let mut backoff = self.backoff.lock().unwrap();
            let state = backoff.entry(instance_id).or_default();
            state.attempt += 1;
            backoff_secs(state.attempt)
        };
        for group in self.groups_of(instance_id) {
            self.enqueue_group(
                &group,
                PendingEvent::Error {
                    message: error.to_string(),
                    retry_secs,
                },
            );
        }
    }

    fn groups_of(&self, instance_id: i64) -> Vec<Arc<Group>> {
        let registry = self.registry.read().unwrap();
        registry
            .groups_by_instance
            .get(&instance_id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| registry.groups.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The coalescing protocol: set the pending slot; if no send task is in
    /// flight, start one. The task drains the slot until it is empty, so a
    /// burst of N enqueues costs at most the in-flight send plus one more.
    fn enqueue_group(self: &Arc<Self>, group: &Arc<Group>, event: PendingEvent) {
        let spawn_send = {
            let mut state = group.state.lock().unwrap();
            state.pending = Some(event);
            if state.sending {
                false
            } else {
                state.sending = true;
                true
            }
        };
        if spawn_send {
            let manager = self.clone();
            let group = group.clone();
            tokio::spawn(async move { manager.send_loop(group).await });
        }
    }

    async fn send_loop(self: Arc<Self>, group: Arc<Group>) {
        loop {
            let pending = {
                let mut state = group.state.lock().unwrap();
                match state.pending.take() {
                    Some(p) => p,
                    None => {
                        state.sending = false;
                        return;
                    }
                }
            };

            let outbound = match pending {
                PendingEvent::Update => {
                    match self.sync.query(group.instance_id, &group.options).await {
                        Ok(page) => {
                            EventFactory::Update(serde_json::to_value(&page).unwrap_or_default())
                        }
                        Err(e) => {
                            warn!(
                                "Stream query for instance {} failed: {}",
                                group.instance_id, e
                            );
                            EventFactory::error(e.to_string(), None)
                        }
                    }
                }
                PendingEvent::Error {
                    message,
                    retry_secs,
                } => EventFactory::error(message, Some(retry_secs)),
            };

            let members: Vec<(String, mpsc::Sender<OutboundEvent>)> = {
                let state = group.state.lock().unwrap();
                state
                    .members
                    .values()
                    .map(|m| (m.client_key.clone(), m.tx.clone()))
                    .collect()
            };
            for (client_key, tx) in members {
                let event = outbound.build(group.instance_id, &client_key);
                // Slow or gone clients just miss this payload.
                let _ = tx.try_send(event);
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let targets: Vec<(i64, String, mpsc::Sender<OutboundEvent>)> = {
                let registry = self.registry.read().unwrap();
                registry
                    .groups
                    .values()
                    .flat_map(|group| {
                        let state = group.state.lock().unwrap();
                        state
                            .members
                            .values()
                            .map(|m| (group.instance_id, m.client_key.clone(), m.tx.clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            };
            for (instance_id, client_key, tx) in targets {
                let event = make_event("heartbeat", instance_id, &client_key, None, None, None);
                let _ = tx.try_send(event);
            }
        }
    }

    /// Stop accepting registrations, tell every subscriber, drop the
    /// registry. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = {
            let mut registry = self.registry.write().unwrap();
            std::mem::take(&mut *registry)
        };
        for group in registry.groups.values() {
            let state = group.state.lock().unwrap();
            for member in state.members.values() {
                let event = make_event(
                    "error",
                    group.instance_id,
                    &member.client_key,
                    None,
                    Some("shutting down".to_string()),
                    None,
                );
                let _ = member.tx.try_send(event);
            }
        }
        debug!("Stream manager shut down");
    }

    #[cfg(test)]
    pub(crate) fn group_count(&self) -> usize {
        self.registry.read().unwrap().groups.len()
    }
}

/// Builds per-member events: updates share one serialized page, errors
/// share one message, and each member gets its own stream key stamped in.
enum EventFactory {
    Update(serde_json::Value),
    Error {
        message: String,
        retry_secs: Option<u64>,
    },
}

impl EventFactory {
    fn error(message: String, retry_secs: Option<u64>) -> Self {
        Self::Error {
            message,
            retry_secs,
        }
    }

    fn build(&self, instance_id: i64, client_key: &str) -> OutboundEvent {
        match self {
            Self::Update(page) => make_event(
                "update",
                instance_id,
                client_key,
                Some(page.clone()),
                None,
                None,
            ),
            Self::Error {
                message,
                retry_secs,
            } => make_event(
                "error",
                instance_id,
                client_key,
                None,
                Some(message.clone()),
                *retry_secs,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolSettings, SyncSettings};
    use crate::db::instances::InstanceStore;
    use crate::db::Database;
    use crate::pool::ClientPool;
    use crate::qbit::TorrentInfo;

    fn setup() -> (Arc<StreamManager>, Arc<SyncManager>) {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db);
        let (_tx, rx) = watch::channel(false);
        let pool = ClientPool::new(store.clone(), PoolSettings::default(), rx.clone());
        let sync = SyncManager::new(pool, store, SyncSettings::default(), rx.clone());
        let manager = StreamManager::new(sync.clone(), Duration::from_secs(30), rx);
        (manager, sync)
    }

    fn request(instance_id: i64, key: &str) -> StreamRequest {
        StreamRequest {
            key: Some(key.to_string()),
            instance_id,
            page: 0,
            limit: Some(50),
            sort: Some("added_on".to_string()),
            order: Some("desc".to_string()),
            search: None,
            filters: TorrentFilters::default(),
        }
    }

    fn torrent(hash: &str, name: &str) -> TorrentInfo {
        TorrentInfo {
            hash: hash.to_string(),
            name: name.to_string(),
            state: "uploading".to_string(),
            ..Default::default()
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        // Let pending send tasks run
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            while let Ok(e) = rx.try_recv() {
                events.push(e);
            }
            if !events.is_empty() {
                break;
            }
        }
        events
    }

    #[test]
    fn test_backoff_bounds() {
        assert_eq!(backoff_secs(1), 4);
        assert_eq!(backoff_secs(2), 8);
        assert_eq!(backoff_secs(3), 16);
        assert_eq!(backoff_secs(4), 30);
        assert_eq!(backoff_secs(10), 30);
    }

    #[test]
    fn test_request_validation() {
        assert!(matches!(
            request(0, "k").into_options(),
            Err(StreamError::Validation(_))
        ));

        let mut bad_limit = request(1, "k");
        bad_limit.limit = Some(5000);
        assert!(matches!(
            bad_limit.into_options(),
            Err(StreamError::Validation(_))
        ));

        let mut defaults = request(1, "k");
        defaults.sort = None;
        defaults.order = Some("upwards".to_string());
        let (id, opts) = defaults.into_options().unwrap();
        assert_eq!(id, 1);
        assert_eq!(opts.sort, "added_on");
        assert_eq!(opts.order, SortOrder::Desc);
    }

    #[tokio::test]
    async fn test_identical_shapes_share_one_group() {
        let (manager, sync) = setup();
        sync.seed_state_for_tests(1, vec![torrent("AAA", "a")]).await;

        let (_c1, mut rx1) = manager
            .register_connection(vec![request(1, "client-a")])
            .unwrap();
        let (_c2, mut rx2) = manager
            .register_connection(vec![request(1, "client-b")])
            .unwrap();

        assert_eq!(manager.group_count(), 1);

        let e1 = drain(&mut rx1).await;
        let e2 = drain(&mut rx2).await;
        assert!(e1.iter().any(|e| e.event == "update"));
        assert!(e2.iter().any(|e| e.event == "update"));
        // Stream keys are per subscriber
        assert_eq!(e1[0].payload["meta"]["streamKey"], "client-a");
        assert_eq!(e2[0].payload["meta"]["streamKey"], "client-b");
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_at_most_two_sends() {
        let (manager, sync) = setup();
        sync.seed_state_for_tests(1, vec![torrent("AAA", "a")]).await;

        let (_conn, mut rx) = manager
            .register_connection(vec![request(1, "k")])
            .unwrap();
        // Swallow the registration payload
        let _ = drain(&mut rx).await;

        for _ in 0..5 {
            manager.handle_main_data(1);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut updates = 0;
        while let Ok(e) = rx.try_recv() {
            if e.event == "update" {
                updates += 1;
            }
        }
        assert!(
            (1..=2).contains(&updates),
            "burst of 5 produced {updates} sends"
        );
    }

    #[tokio::test]
    async fn test_sync_error_reports_growing_retry_hint() {
        let (manager, sync) = setup();
        sync.seed_state_for_tests(1, vec![torrent("AAA", "a")]).await;
        let (_conn, mut rx) = manager
            .register_connection(vec![request(1, "k")])
            .unwrap();
        let _ = drain(&mut rx).await;

        let mut hints = Vec::new();
        for _ in 0..4 {
            manager.handle_sync_error(1, "upstream gone");
            tokio::time::sleep(Duration::from_millis(50)).await;
            while let Ok(e) = rx.try_recv() {
                if e.event == "error" {
                    hints.push(e.payload["meta"]["retryInSeconds"].as_u64().unwrap());
                }
            }
        }
        assert_eq!(hints, vec![4, 8, 16, 30]);

        // Success resets the backoff
        manager.handle_main_data(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.handle_sync_error(1, "again");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut last = None;
        while let Ok(e) = rx.try_recv() {
            if e.event == "error" {
                last = e.payload["meta"]["retryInSeconds"].as_u64();
            }
        }
        assert_eq!(last, Some(4));
    }

    #[tokio::test]
    async fn test_unregister_garbage_collects_group() {
        let (manager, sync) = setup();
        sync.seed_state_for_tests(1, vec![]).await;
        let (conn, _rx) = manager
            .register_connection(vec![request(1, "k")])
            .unwrap();
        assert_eq!(manager.group_count(), 1);
        manager.unregister_connection(&conn);
        assert_eq!(manager.group_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_registrations() {
        let (manager, sync) = setup();
        sync.seed_state_for_tests(1, vec![]).await;
        let (_conn, mut rx) = manager
            .register_connection(vec![request(1, "k")])
            .unwrap();
        let _ = drain(&mut rx).await;

        manager.shutdown();

        let final_events = drain(&mut rx).await;
        assert!(final_events
            .iter()
            .any(|e| e.event == "error" && e.payload["error"] == "shutting down"));

        assert!(matches!(
            manager.register_connection(vec![request(1, "k")]),
            Err(StreamError::ShuttingDown)
        ));
        // Idempotent
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_empty_requests_rejected() {
        let (manager, _sync) = setup();
        assert!(matches!(
            manager.register_connection(vec![]),
            Err(StreamError::Validation(_))
        ));
    }
}
