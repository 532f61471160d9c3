//! Sync manager
//!
//! Per-instance cached view of the torrent list plus its derived indexes.
//! Refreshes reconcile against upstream (full listing or incremental
//! maindata merge), queries serve filtered/sorted/paginated pages from the
//! cache, and mutations go to the client with optimistic snapshot updates
//! where the outcome is unambiguous.

pub mod filter;
mod hardlinks;
pub mod index;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::db::instances::{InstanceChange, InstanceStore};
use crate::pool::{ClientPool, PoolError};
use crate::qbit::{
    Category, MainData, QbitError, TorrentInfo, TorrentListQuery, TorrentPatch, TrackerInfo,
};
use crate::utils::{normalize_hash, normalize_hashes};
use filter::{QueryOptions, SearchMatcher, StatusBucket};
use index::TorrentIndexes;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Upstream(#[from] QbitError),

    #[error("Unknown filter: {0}")]
    InvalidFilter(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Published after every refresh attempt; the stream manager fans these out
/// to subscription groups. One-way: the sync core never calls streams back.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Updated { instance_id: i64 },
    Failed { instance_id: i64, error: String },
}

impl SyncEvent {
    pub fn instance_id(&self) -> i64 {
        match self {
            Self::Updated { instance_id } | Self::Failed { instance_id, .. } => *instance_id,
        }
    }
}

/// One page of a filtered view
#[derive(Debug, Clone, Serialize)]
pub struct TorrentPage {
    pub torrents: Vec<TorrentInfo>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Per-hash mutation outcome
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Bulk mutation actions. `args` carries the per-action payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", content = "args", rename_all = "snake_case")]
pub enum MutationAction {
    Pause,
    Resume,
    Recheck,
    Reannounce,
    Delete {
        #[serde(default)]
        delete_files: bool,
    },
    SetCategory {
        category: String,
    },
    AddTags {
        tags: Vec<String>,
    },
    RemoveTags {
        tags: Vec<String>,
    },
    SetLocation {
        location: String,
    },
    Rename {
        name: String,
    },
    SetPriority {
        file_index: i64,
        priority: i64,
    },
    SetShareLimits {
        ratio_limit: f64,
        seeding_time_limit: i64,
        inactive_seeding_time_limit: i64,
    },
}

impl MutationAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Recheck => "recheck",
            Self::Reannounce => "reannounce",
            Self::Delete { .. } => "delete",
            Self::SetCategory { .. } => "set_category",
            Self::AddTags { .. } => "add_tags",
            Self::RemoveTags { .. } => "remove_tags",
            Self::SetLocation { .. } => "set_location",
            Self::Rename { .. } => "rename",
            Self::SetPriority { .. } => "set_priority",
            Self::SetShareLimits { .. } => "set_share_limits",
        }
    }
}

/// Cached view of one instance
struct InstanceState {
    torrents: HashMap<String, TorrentInfo>,
    rid: i64,
    has_synced: bool,
    categories: HashMap<String, Category>,
    tags: Vec<String>,
    free_space: i64,
    last_synced: Option<DateTime<Utc>>,
    indexes: Arc<TorrentIndexes>,
}

impl InstanceState {
    fn new() -> Self {
        Self {
            torrents: HashMap::new(),
            rid: 0,
            has_synced: false,
            categories: HashMap::new(),
            tags: Vec::new(),
            free_space: 0,
            last_synced: None,
            indexes: Arc::new(TorrentIndexes::default()),
        }
    }
}

struct InstanceSync {
    state: RwLock<InstanceState>,
    /// Serializes refreshes so rid merges never race
    refresh_lock: Mutex<()>,
    /// Fires after every successful sync; the timer task re-arms on it
    rearm: watch::Sender<()>,
}

impl InstanceSync {
    fn new() -> Self {
        let (rearm, _) = watch::channel(());
        Self {
            state: RwLock::new(InstanceState::new()),
            refresh_lock: Mutex::new(()),
            rearm,
        }
    }
}

pub struct SyncManager {
    pool: Arc<ClientPool>,
    instances: InstanceStore,
    settings: SyncSettings,
    states: RwLock<HashMap<i64, Arc<InstanceSync>>>,
    timers: std::sync::Mutex<HashSet<i64>>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: watch::Receiver<bool>,
}

/// Fold a maindata payload into an existing snapshot map. Returns the new
/// map; the caller swaps it in under the write lock.
fn apply_main_data(
    current: &HashMap<String, TorrentInfo>,
    data: &MainData,
    rebuild: bool,
) -> HashMap<String, TorrentInfo> {
    let mut next = if rebuild {
        HashMap::with_capacity(data.torrents.len())
    } else {
        current.clone()
    };

    for (raw_hash, value) in &data.torrents {
        let hash = normalize_hash(raw_hash);
        match next.get_mut(&hash) {
            Some(existing) => {
                if let Ok(patch) = serde_json::from_value::<TorrentPatch>(value.clone()) {
                    patch.apply(existing);
                }
            }
            None => {
                let mut torrent: TorrentInfo =
                    serde_json::from_value(value.clone()).unwrap_or_default();
                torrent.hash = hash.clone();
                next.insert(hash, torrent);
            }
        }
    }

    for raw_hash in &data.torrents_removed {
        next.remove(&normalize_hash(raw_hash));
    }

    next
}

/// Apply the unambiguous part of a mutation to a cached torrent. Returns
/// false when the outcome is ambiguous and the hash needs a refetch.
fn apply_optimistic(action: &MutationAction, torrent: &mut TorrentInfo) -> bool {
    match action {
        MutationAction::Pause => {
            torrent.state = if torrent.progress >= 1.0 {
                "pausedUP".to_string()
            } else {
                "pausedDL".to_string()
            };
            torrent.dlspeed = 0;
            torrent.upspeed = 0;
            true
        }
        MutationAction::SetCategory { category } => {
            torrent.category = category.clone();
            true
        }
        MutationAction::AddTags { tags } => {
            let mut current = torrent.tag_list();
            for tag in tags {
                if !current.iter().any(|t| t == tag) {
                    current.push(tag.clone());
                }
            }
            torrent.tags = current.join(",");
            true
        }
        MutationAction::RemoveTags { tags } => {
            let current: Vec<String> = torrent
                .tag_list()
                .into_iter()
                .filter(|t| !tags.contains(t))
                .collect();
            torrent.tags = current.join(",");
            true
        }
        MutationAction::SetLocation { location } => {
            torrent.save_path = location.clone();
            true
        }
        MutationAction::Rename { name } => {
            torrent.name = name.clone();
            true
        }
        // Reannounce does not change visible state
        MutationAction::Reannounce => true,
        // Resume/recheck/priority/share-limit outcomes depend on upstream
        _ => false,
    }
}

impl SyncManager {
    pub fn new(
        pool: Arc<ClientPool>,
        instances: InstanceStore,
        settings: SyncSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            pool,
            instances,
            settings,
            states: RwLock::new(HashMap::new()),
            timers: std::sync::Mutex::new(HashSet::new()),
            events,
            shutdown,
        })
    }

    /// Subscribe to sync outcomes (used by the stream manager)
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Spawn per-instance sync timers and the instance-change listener
    pub fn start(self: &Arc<Self>) {
        for instance in self.pool.all_instances() {
            self.spawn_timer(instance.id);
        }

        let manager = self.clone();
        let mut changes = self.instances.on_change();
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                let id = change.instance_id();
                match change {
                    InstanceChange::Created(_) => manager.spawn_timer(id),
                    InstanceChange::Updated(_) => {
                        manager.evict(id).await;
                        manager.spawn_timer(id);
                    }
                    InstanceChange::Deleted(_) => manager.evict(id).await,
                }
            }
        });
    }

    /// Drop cached state for an instance (admin update/delete)
    pub async fn evict(&self, id: i64) {
        if self.states.write().await.remove(&id).is_some() {
            info!("Evicted sync state for instance {}", id);
        }
    }

    async fn instance_sync(&self, id: i64) -> Arc<InstanceSync> {
        {
            let states = self.states.read().await;
            if let Some(state) = states.get(&id) {
                return state.clone();
            }
        }
        let mut states = self.states.write().await;
        states
            .entry(id)
            .or_insert_with(|| Arc::new(InstanceSync::new()))
            .clone()
    }

    /// One-shot timer, re-armed after every successful sync regardless of
    /// what triggered it. A repeating ticker would drift from manual syncs.
    fn spawn_timer(self: &Arc<Self>, id: i64) {
        if !self.timers.lock().unwrap().insert(id) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.timer_loop(id).await;
            manager.timers.lock().unwrap().remove(&id);
        });
    }

    async fn timer_loop(self: &Arc<Self>, id: i64) {
        let mut shutdown = self.shutdown.clone();
        let sync = self.instance_sync(id).await;
        let mut rearm = sync.rearm.subscribe();

        loop {
            let instance = match self.instances.get_by_id(id) {
                Ok(Some(i)) if i.active => i,
                Ok(Some(_)) | Ok(None) => {
                    debug!("Sync timer for instance {} stopping", id);
                    return;
                }
                Err(e) => {
                    warn!("Sync timer for instance {}: {:?}", id, e);
                    return;
                }
            };

            let minutes = match instance.sync_interval_mins {
                0 => None,
                m => Some(m.max(1)),
            };

            tokio::select! {
                _ = async {
                    match minutes {
                        Some(m) => tokio::time::sleep(std::time::Duration::from_secs(m * 60)).await,
                        // Disabled: only manual syncs (rearm) or shutdown wake us
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Err(e) = self.refresh(id).await {
                        warn!("Periodic sync of instance {} failed: {}", id, e);
                    }
                    // The refresh itself re-armed the timer; clear the signal
                    // so the next select sleeps the full interval.
                    rearm.mark_unchanged();
                }
                _ = rearm.changed() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Reconcile the cached view against upstream. First sync (or a stale
    /// rid) takes the full path; otherwise the incremental maindata merge.
    pub async fn refresh(&self, id: i64) -> Result<()> {
        let sync = self.instance_sync(id).await;
        let _guard = sync.refresh_lock.lock().await;

        match self.refresh_inner(id, &sync).await {
            Ok(()) => {
                let _ = sync.rearm.send(());
                self.pool.record_success(id).await;
                let _ = self.events.send(SyncEvent::Updated { instance_id: id });
                Ok(())
            }
            Err(e) => {
                if let SyncError::Upstream(ref qe) = e {
                    self.pool.record_failure(id, qe).await;
                }
                let _ = self.events.send(SyncEvent::Failed {
                    instance_id: id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn refresh_inner(&self, id: i64, sync: &InstanceSync) -> Result<()> {
        let client = self.pool.get_client(id).await?;

        let (rid, has_synced, current) = {
            let state = sync.state.read().await;
            (state.rid, state.has_synced, state.torrents.clone())
        };

        let data = client.get_main_data(if has_synced { rid } else { 0 }).await?;
        let rebuild = !has_synced || data.full_update;
        let mut next = apply_main_data(&current, &data, rebuild);

        // Full syncs refresh tracker health in one shot when the server can
        // inline it; incremental merges keep previously fetched trackers.
        if rebuild && client.supports_tracker_health().await {
            let listed = client
                .get_torrents(&TorrentListQuery {
                    include_trackers: true,
                    ..Default::default()
                })
                .await?;
            for mut t in listed {
                t.hash = normalize_hash(&t.hash);
                next.insert(t.hash.clone(), t);
            }
        }

        let hardlink_scope = if self.settings.hardlink_scan {
            hardlinks::collect(&next)
        } else {
            HashMap::new()
        };
        let indexes = Arc::new(TorrentIndexes::build(&next, hardlink_scope));

        let mut state = sync.state.write().await;
        state.torrents = next;
        state.rid = data.rid;
        state.has_synced = true;
        state.last_synced = Some(Utc::now());
        state.indexes = indexes;

        for name in &data.categories_removed {
            state.categories.remove(name);
        }
        for (name, category) in &data.categories {
            state.categories.insert(name.clone(), category.clone());
        }
        for tag in &data.tags_removed {
            state.tags.retain(|t| t != tag);
        }
        for tag in &data.tags {
            if !state.tags.contains(tag) {
                state.tags.push(tag.clone());
            }
        }
        if let Some(ref server_state) = data.server_state {
            state.free_space = server_state.free_space_on_disk;
        }

        debug!(
            "Synced instance {}: {} torrents at rid {}",
            id,
            state.torrents.len(),
            state.rid
        );
        Ok(())
    }

    async fn ensure_synced(&self, id: i64) -> Result<Arc<InstanceSync>> {
        let sync = self.instance_sync(id).await;
        let synced = sync.state.read().await.has_synced;
        if !synced {
            self.refresh(id).await?;
        }
        Ok(sync)
    }

    /// Serve a filtered, sorted page from the cache
    pub async fn query(&self, id: i64, opts: &QueryOptions) -> Result<TorrentPage> {
        let mut opts = opts.clone();
        opts.normalize();

        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        let indexes = state.indexes.clone();

        let buckets: Vec<StatusBucket> = opts
            .filters
            .status
            .iter()
            .map(|s| {
                StatusBucket::parse(s).ok_or_else(|| SyncError::InvalidFilter(s.clone()))
            })
            .collect::<Result<_>>()?;

        let matcher = opts.search.as_deref().map(SearchMatcher::new);

        let mut matched: Vec<TorrentInfo> = state
            .torrents
            .values()
            .filter(|t| {
                if !buckets.is_empty()
                    && !buckets
                        .iter()
                        .any(|b| b.matches(t, &indexes.unregistered, &indexes.tracker_down))
                {
                    return false;
                }
                if !opts.filters.categories.is_empty()
                    && !opts.filters.categories.contains(&t.category)
                {
                    return false;
                }
                if !opts.filters.tags.is_empty() {
                    let tags = t.tag_list();
                    if !opts.filters.tags.iter().any(|f| tags.contains(f)) {
                        return false;
                    }
                }
                if !opts.filters.trackers.is_empty() {
                    let domain = crate::utils::tracker_domain(&t.tracker).unwrap_or_default();
                    if !opts.filters.trackers.iter().any(|f| f == &domain) {
                        return false;
                    }
                }
                if let Some(ref m) = matcher {
                    if !m.matches(t) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| filter::compare_torrents(a, b, &opts.sort, opts.order));

        let (torrents, total) = filter::paginate(&matched, opts.page, opts.limit);
        Ok(TorrentPage {
            torrents,
            total,
            page: opts.page,
            limit: opts.limit,
        })
    }

    /// Single cached torrent
    pub async fn torrent(&self, id: i64, hash: &str) -> Result<Option<TorrentInfo>> {
        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        Ok(state.torrents.get(&normalize_hash(hash)).cloned())
    }

    /// O(1) cardinalities for sidebar-style consumers
    pub async fn counts(&self, id: i64) -> Result<serde_json::Value> {
        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        let idx = &state.indexes;
        Ok(serde_json::json!({
            "total": state.torrents.len(),
            "categories": idx.category_counts(),
            "tags": idx.tag_counts(),
            "trackers": idx.tracker_counts(),
            "status": idx.status_counts(),
        }))
    }

    pub async fn duplicates(&self, id: i64) -> Result<Vec<index::DuplicateGroup>> {
        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        Ok(state.indexes.duplicates.clone())
    }

    pub async fn free_space(&self, id: i64) -> Result<i64> {
        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        Ok(state.free_space)
    }

    /// Cached snapshot of every torrent (reannounce scan, rule contexts)
    pub async fn all_torrents(&self, id: i64) -> Result<Vec<TorrentInfo>> {
        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        Ok(state.torrents.values().cloned().collect())
    }

    /// Aux maps for rule evaluation
    pub async fn indexes(&self, id: i64) -> Result<Arc<TorrentIndexes>> {
        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        Ok(state.indexes.clone())
    }

    /// Build a rule-evaluation context over the cached view: classifier
    /// sets, hardlink scopes, and per-category name indexes for cross
    /// lookups. The caller picks the clock.
    pub async fn eval_context(&self, id: i64, now_unix: i64) -> Result<crate::rules::EvalContext> {
        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        let idx = &state.indexes;

        let mut category_index: HashMap<String, Vec<crate::rules::CategoryEntry>> = HashMap::new();
        let mut missing_files = HashSet::new();
        for t in state.torrents.values() {
            category_index
                .entry(t.category.clone())
                .or_default()
                .push(crate::rules::CategoryEntry::from_torrent(t));
            if t.state == "missingFiles" {
                missing_files.insert(t.hash.clone());
            }
        }

        let mut ctx = crate::rules::EvalContext {
            now_unix,
            unregistered: idx.unregistered.clone(),
            tracker_down: idx.tracker_down.clone(),
            missing_files,
            hardlink_scope: idx.hardlink_scope.clone(),
            has_hardlink_data: !idx.hardlink_scope.is_empty(),
            category_index,
            ..Default::default()
        };
        ctx.projections
            .switch_source(&format!("instance-{id}"), state.free_space);
        Ok(ctx)
    }

    /// Stalled torrents with tracker data, preferring the one-shot listing
    /// on servers that can inline tracker health.
    pub async fn stalled_with_trackers(&self, id: i64) -> Result<Vec<TorrentInfo>> {
        let client = self.pool.get_client(id).await?;
        if client.supports_tracker_health().await {
            let mut listed = client
                .get_torrents(&TorrentListQuery {
                    filter: Some("stalled".to_string()),
                    include_trackers: true,
                    ..Default::default()
                })
                .await?;
            for t in &mut listed {
                t.hash = normalize_hash(&t.hash);
            }
            return Ok(listed);
        }

        let sync = self.ensure_synced(id).await?;
        let state = sync.state.read().await;
        let stalled = state
            .indexes
            .bucket_members(StatusBucket::Stalled)
            .cloned()
            .unwrap_or_default();
        Ok(state
            .torrents
            .values()
            .filter(|t| stalled.contains(&t.hash))
            .cloned()
            .collect())
    }

    /// Tracker listing; refreshes the cached torrent's tracker set so the
    /// health indexes pick up the observation.
    pub async fn trackers(&self, id: i64, hash: &str) -> Result<Vec<TrackerInfo>> {
        let client = self.pool.get_client(id).await?;
        let hash = normalize_hash(hash);
        let trackers = client.get_torrent_trackers(&hash).await?;

        let sync = self.instance_sync(id).await;
        let updated = {
            let mut state = sync.state.write().await;
            match state.torrents.get_mut(&hash) {
                Some(t) => {
                    t.trackers = trackers.clone();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.rebuild_indexes(&sync).await;
        }

        Ok(trackers)
    }

    pub async fn files(&self, id: i64, hash: &str) -> Result<Vec<crate::qbit::TorrentContent>> {
        let client = self.pool.get_client(id).await?;
        Ok(client.get_torrent_files(&normalize_hash(hash)).await?)
    }

    pub async fn categories(&self, id: i64) -> Result<HashMap<String, Category>> {
        let client = self.pool.get_client(id).await?;
        let categories = client.get_categories().await?;
        let sync = self.instance_sync(id).await;
        sync.state.write().await.categories = categories.clone();
        Ok(categories)
    }

    pub async fn tags(&self, id: i64) -> Result<Vec<String>> {
        let client = self.pool.get_client(id).await?;
        let tags = client.get_tags().await?;
        let sync = self.instance_sync(id).await;
        sync.state.write().await.tags = tags.clone();
        Ok(tags)
    }

    /// Execute a bulk mutation. Outcomes are reported per hash; unambiguous
    /// effects land in the snapshot immediately, everything else is refetched
    /// out-of-band via a hash-scoped listing.
    pub async fn mutate(
        &self,
        id: i64,
        action: &MutationAction,
        hashes: &[String],
    ) -> Result<HashMap<String, MutationOutcome>> {
        let hashes = normalize_hashes(hashes.iter());
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }

        let client = self.pool.get_client(id).await?;

        let call_result = match action {
            MutationAction::Pause => client.pause(&hashes).await,
            MutationAction::Resume => client.resume(&hashes).await,
            MutationAction::Recheck => client.recheck(&hashes).await,
            MutationAction::Reannounce => client.reannounce(&hashes).await,
            MutationAction::Delete { delete_files } => client.delete(&hashes, *delete_files).await,
            MutationAction::SetCategory { category } => {
                client.set_category(&hashes, category).await
            }
            MutationAction::AddTags { tags } => client.add_tags(&hashes, tags).await,
            MutationAction::RemoveTags { tags } => client.remove_tags(&hashes, tags).await,
            MutationAction::SetLocation { location } => {
                client.set_location(&hashes, location).await
            }
            MutationAction::Rename { name } => {
                // Single-hash upstream op; apply to each requested hash.
                let mut last = Ok(());
                for hash in &hashes {
                    last = client.rename_torrent(hash, name).await;
                    if last.is_err() {
                        break;
                    }
                }
                last
            }
            MutationAction::SetPriority {
                file_index,
                priority,
            } => {
                let mut last = Ok(());
                for hash in &hashes {
                    last = client.set_file_priority(hash, *file_index, *priority).await;
                    if last.is_err() {
                        break;
                    }
                }
                last
            }
            MutationAction::SetShareLimits {
                ratio_limit,
                seeding_time_limit,
                inactive_seeding_time_limit,
            } => {
                client
                    .set_share_limits(
                        &hashes,
                        *ratio_limit,
                        *seeding_time_limit,
                        *inactive_seeding_time_limit,
                    )
                    .await
            }
        };

        if let Err(e) = call_result {
            // Mutations that fail do not dirty the snapshot.
            let message = e.to_string();
            return Ok(hashes
                .into_iter()
                .map(|h| (h, MutationOutcome::failed(message.clone())))
                .collect());
        }

        let mut outcomes: HashMap<String, MutationOutcome> = HashMap::new();
        let sync = self.instance_sync(id).await;
        let mut dirty: Vec<String> = Vec::new();

        {
            let mut state = sync.state.write().await;
            match action {
                MutationAction::Delete { .. } => {
                    for hash in &hashes {
                        state.torrents.remove(hash);
                        outcomes.insert(hash.clone(), MutationOutcome::ok());
                    }
                }
                _ => {
                    for hash in &hashes {
                        match state.torrents.get_mut(hash) {
                            Some(t) => {
                                if !apply_optimistic(action, t) {
                                    dirty.push(hash.clone());
                                }
                                outcomes.insert(hash.clone(), MutationOutcome::ok());
                            }
                            None => {
                                dirty.push(hash.clone());
                                outcomes.insert(hash.clone(), MutationOutcome::ok());
                            }
                        }
                    }
                }
            }
        }

        if !dirty.is_empty() {
            if let Err(e) = self.refetch_hashes(id, &sync, &dirty).await {
                debug!("Post-mutation refetch for instance {} failed: {}", id, e);
            }
        }

        // Rebuild indexes against the mutated snapshot and notify streams.
        self.rebuild_indexes(&sync).await;
        let _ = self.events.send(SyncEvent::Updated { instance_id: id });

        Ok(outcomes)
    }

    /// Indexes are a strict function of the snapshot: build against a clone
    /// off-lock, then swap in under the write lock.
    async fn rebuild_indexes(&self, sync: &InstanceSync) {
        let (snapshot, scopes) = {
            let state = sync.state.read().await;
            (
                state.torrents.clone(),
                state.indexes.hardlink_scope.clone(),
            )
        };
        let indexes = Arc::new(TorrentIndexes::build(&snapshot, scopes));
        sync.state.write().await.indexes = indexes;
    }

    /// Targeted refresh of a few hashes via a hash-scoped listing. Hashes
    /// missing from the response are treated as deleted upstream.
    async fn refetch_hashes(&self, id: i64, sync: &InstanceSync, hashes: &[String]) -> Result<()> {
        let client = self.pool.get_client(id).await?;
        let listed = client
            .get_torrents(&TorrentListQuery {
                hashes: Some(hashes.to_vec()),
                include_trackers: true,
                ..Default::default()
            })
            .await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut state = sync.state.write().await;
        for mut t in listed {
            t.hash = normalize_hash(&t.hash);
            seen.insert(t.hash.clone());
            state.torrents.insert(t.hash.clone(), t);
        }
        for hash in hashes {
            if !seen.contains(hash) {
                state.torrents.remove(hash);
            }
        }
        Ok(())
    }

    /// Add a torrent and kick a refresh so the snapshot picks it up
    pub async fn add_torrent(
        &self,
        id: i64,
        source: &crate::qbit::TorrentSource,
        options: &crate::qbit::AddTorrentOptions,
    ) -> Result<Option<String>> {
        let client = self.pool.get_client(id).await?;
        client.add_torrent(source, options).await?;

        // A .torrent upload carries its own info-hash; report it back so the
        // caller can track the new torrent before the next sync lands.
        let hash = match source {
            crate::qbit::TorrentSource::File { bytes, .. } => {
                lava_torrent::torrent::v1::Torrent::read_from_bytes(bytes)
                    .ok()
                    .map(|t| normalize_hash(&t.info_hash()))
            }
            crate::qbit::TorrentSource::Urls(_) => None,
        };

        if let Err(e) = self.refresh(id).await {
            debug!("Post-add refresh for instance {} failed: {}", id, e);
        }
        Ok(hash)
    }

    #[cfg(test)]
    pub(crate) async fn seed_state_for_tests(&self, id: i64, torrents: Vec<TorrentInfo>) {
        let sync = self.instance_sync(id).await;
        let mut state = sync.state.write().await;
        state.torrents = torrents
            .into_iter()
            .map(|mut t| {
                t.hash = normalize_hash(&t.hash);
                (t.hash.clone(), t)
            })
            .collect();
        state.indexes = Arc::new(TorrentIndexes::build(&state.torrents, HashMap::new()));
        state.has_synced = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::db::Database;

    fn manager() -> Arc<SyncManager> {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db);
        let (_tx, rx) = watch::channel(false);
        let pool = ClientPool::new(store.clone(), PoolSettings::default(), rx.clone());
        SyncManager::new(pool, store, SyncSettings::default(), rx)
    }

    fn torrent(hash: &str, name: &str, state: &str, added_on: i64) -> TorrentInfo {
        TorrentInfo {
            hash: hash.to_string(),
            name: name.to_string(),
            state: state.to_string(),
            added_on,
            progress: if state.ends_with("UP") { 1.0 } else { 0.5 },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_main_data_incremental_merge() {
        let mut current = HashMap::new();
        current.insert("AAA".to_string(), torrent("AAA", "a", "downloading", 10));
        current.insert("BBB".to_string(), torrent("BBB", "b", "uploading", 20));

        let data: MainData = serde_json::from_str(
            r#"{
                "rid": 5,
                "torrents": {
                    "aaa": {"state": "stalledDL"},
                    "ccc": {"name": "c", "state": "downloading", "added_on": 30}
                },
                "torrents_removed": ["bbb"]
            }"#,
        )
        .unwrap();

        let next = apply_main_data(&current, &data, false);
        assert_eq!(next.len(), 2);
        assert_eq!(next["AAA"].state, "stalledDL");
        assert_eq!(next["AAA"].name, "a");
        assert_eq!(next["CCC"].name, "c");
        assert!(!next.contains_key("BBB"));
    }

    #[test]
    fn test_apply_main_data_full_rebuild_drops_stale() {
        let mut current = HashMap::new();
        current.insert("AAA".to_string(), torrent("AAA", "a", "downloading", 10));

        let data: MainData = serde_json::from_str(
            r#"{"rid": 1, "full_update": true,
                "torrents": {"ddd": {"name": "d", "state": "uploading"}}}"#,
        )
        .unwrap();

        let next = apply_main_data(&current, &data, true);
        assert_eq!(next.len(), 1);
        assert!(next.contains_key("DDD"));
    }

    #[test]
    fn test_optimistic_pause_sets_paused_state() {
        let mut downloading = torrent("AAA", "a", "downloading", 0);
        assert!(apply_optimistic(&MutationAction::Pause, &mut downloading));
        assert_eq!(downloading.state, "pausedDL");

        let mut seeding = torrent("BBB", "b", "uploading", 0);
        seeding.progress = 1.0;
        assert!(apply_optimistic(&MutationAction::Pause, &mut seeding));
        assert_eq!(seeding.state, "pausedUP");
    }

    #[test]
    fn test_optimistic_pause_is_idempotent() {
        let mut t = torrent("AAA", "a", "downloading", 0);
        apply_optimistic(&MutationAction::Pause, &mut t);
        let once = t.clone();
        apply_optimistic(&MutationAction::Pause, &mut t);
        assert_eq!(t.state, once.state);
        assert_eq!(t.dlspeed, once.dlspeed);
    }

    #[test]
    fn test_optimistic_resume_is_ambiguous() {
        let mut t = torrent("AAA", "a", "pausedDL", 0);
        assert!(!apply_optimistic(&MutationAction::Resume, &mut t));
    }

    #[test]
    fn test_optimistic_tag_edits() {
        let mut t = torrent("AAA", "a", "uploading", 0);
        t.tags = "keep,drop".to_string();
        apply_optimistic(
            &MutationAction::AddTags {
                tags: vec!["new".to_string(), "keep".to_string()],
            },
            &mut t,
        );
        assert_eq!(t.tags, "keep,drop,new");
        apply_optimistic(
            &MutationAction::RemoveTags {
                tags: vec!["drop".to_string()],
            },
            &mut t,
        );
        assert_eq!(t.tags, "keep,new");
    }

    #[tokio::test]
    async fn test_query_bucket_filter_scenario() {
        let manager = manager();
        manager
            .seed_state_for_tests(
                1,
                vec![
                    torrent("AAA", "stalled-seed", "stalledUP", 1),
                    torrent("BBB", "leech", "downloading", 2),
                    torrent("CCC", "broken", "error", 3),
                ],
            )
            .await;

        let mut opts = QueryOptions::default();
        opts.filters.status = vec!["stalled".to_string()];
        let page = manager.query(1, &opts).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.torrents[0].hash, "AAA");

        opts.filters.status = vec!["errored".to_string()];
        let page = manager.query(1, &opts).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.torrents[0].hash, "CCC");
    }

    #[tokio::test]
    async fn test_query_pagination_totality() {
        let manager = manager();
        let torrents: Vec<TorrentInfo> = (0..25)
            .map(|i| torrent(&format!("H{:03}", i), &format!("t{}", i), "uploading", i))
            .collect();
        manager.seed_state_for_tests(1, torrents).await;

        let mut collected = 0;
        for page_no in 0..4 {
            let opts = QueryOptions {
                page: page_no,
                limit: 10,
                ..Default::default()
            };
            let page = manager.query(1, &opts).await.unwrap();
            assert_eq!(page.total, 25);
            collected += page.torrents.len();
        }
        assert_eq!(collected, 25);
    }

    #[tokio::test]
    async fn test_query_invalid_filter_rejected() {
        let manager = manager();
        manager.seed_state_for_tests(1, vec![]).await;
        let mut opts = QueryOptions::default();
        opts.filters.status = vec!["bogus".to_string()];
        assert!(matches!(
            manager.query(1, &opts).await,
            Err(SyncError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_query_sort_with_hash_tiebreak() {
        let manager = manager();
        manager
            .seed_state_for_tests(
                1,
                vec![
                    torrent("BBB", "same", "uploading", 5),
                    torrent("AAA", "same", "uploading", 5),
                ],
            )
            .await;
        let opts = QueryOptions {
            sort: "name".to_string(),
            ..Default::default()
        };
        let page = manager.query(1, &opts).await.unwrap();
        assert_eq!(page.torrents[0].hash, "AAA");
        assert_eq!(page.torrents[1].hash, "BBB");
    }
}
