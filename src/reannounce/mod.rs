//! Reannounce controller
//!
//! Watches stalled torrents per instance and nudges their unhealthy
//! trackers with bounded, debounced reannounce jobs. The proxy layer hands
//! intercepted reannounce requests to the same path so external tooling
//! gets the same cooldown behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db::activity::{ActivityEvent, ActivityOutcome, ActivitySink};
use crate::db::settings::{ReannounceSettings, ReannounceSettingsStore};
use crate::pool::ClientPool;
use crate::qbit::models::tracker_status;
use crate::qbit::{TorrentInfo, TrackerInfo};
use crate::sync::index::is_unregistered_message;
use crate::sync::SyncManager;
use crate::utils::{normalize_hashes, tracker_domain};

/// Cadence of the stalled-torrent scan
const SCAN_INTERVAL: Duration = Duration::from_secs(7);

/// How long loaded settings stay fresh before re-reading the store
const SETTINGS_TTL: Duration = Duration::from_secs(60);

const JOB_TIMEOUT_FLOOR: Duration = Duration::from_secs(60);
const JOB_TIMEOUT_CEIL: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerHealth {
    Healthy,
    Updating,
    Unhealthy,
    Disabled,
    Excluded,
}

/// Classify one tracker for reannounce purposes. Unregistered trackers are
/// excluded: no amount of reannouncing brings a deleted torrent back.
pub fn classify_tracker(tr: &TrackerInfo, excluded_domains: &[String]) -> TrackerHealth {
    if !tr.is_real_tracker() {
        return TrackerHealth::Disabled;
    }
    if let Some(domain) = tracker_domain(&tr.url) {
        if excluded_domains.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
            return TrackerHealth::Excluded;
        }
    }
    if is_unregistered_message(&tr.msg) {
        return TrackerHealth::Excluded;
    }
    match tr.status {
        tracker_status::DISABLED => TrackerHealth::Disabled,
        tracker_status::WORKING => TrackerHealth::Healthy,
        tracker_status::UPDATING | tracker_status::NOT_CONTACTED => TrackerHealth::Updating,
        _ => TrackerHealth::Unhealthy,
    }
}

/// URLs of trackers that a reannounce could plausibly fix
pub fn unhealthy_urls(trackers: &[TrackerInfo], excluded_domains: &[String]) -> Vec<String> {
    trackers
        .iter()
        .filter(|tr| classify_tracker(tr, excluded_domains) == TrackerHealth::Unhealthy)
        .map(|tr| tr.url.clone())
        .collect()
}

/// Whether the scan should consider this torrent at all
pub fn torrent_in_scope(t: &TorrentInfo, settings: &ReannounceSettings, now_unix: i64) -> bool {
    if t.added_on > 0 && settings.max_age_secs > 0 {
        let age = (now_unix - t.added_on).max(0) as u64;
        if age > settings.max_age_secs {
            return false;
        }
    }
    if !settings.include_categories.is_empty()
        && !settings.include_categories.contains(&t.category)
    {
        return false;
    }
    if settings.exclude_categories.contains(&t.category) {
        return false;
    }
    let tags = t.tag_list();
    if !settings.include_tags.is_empty()
        && !settings.include_tags.iter().any(|tag| tags.contains(tag))
    {
        return false;
    }
    if settings.exclude_tags.iter().any(|tag| tags.contains(tag)) {
        return false;
    }
    true
}

/// Per-attempt job deadline: long enough for every retry plus slack,
/// bounded both ways.
pub fn job_timeout(settings: &ReannounceSettings) -> Duration {
    let retries = settings.max_retries.max(1) as u64;
    let computed = Duration::from_secs((retries - 1) * settings.interval_secs + 30);
    computed.max(JOB_TIMEOUT_FLOOR).min(JOB_TIMEOUT_CEIL)
}

/// Book-keeping for one (instance, hash) pair
#[derive(Debug, Default)]
struct JobState {
    last_requested: Option<Instant>,
    running: bool,
}

pub struct ReannounceController {
    pool: Arc<ClientPool>,
    sync: Arc<SyncManager>,
    settings_store: ReannounceSettingsStore,
    activity: Arc<dyn ActivitySink>,
    jobs: std::sync::Mutex<HashMap<(i64, String), JobState>>,
    settings_cache: std::sync::Mutex<HashMap<i64, (ReannounceSettings, Instant)>>,
    shutdown: watch::Receiver<bool>,
}

impl ReannounceController {
    pub fn new(
        pool: Arc<ClientPool>,
        sync: Arc<SyncManager>,
        settings_store: ReannounceSettingsStore,
        activity: Arc<dyn ActivitySink>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sync,
            settings_store,
            activity,
            jobs: std::sync::Mutex::new(HashMap::new()),
            settings_cache: std::sync::Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let controller = self.clone();
        tokio::spawn(async move { controller.scan_loop().await });
    }

    /// Settings with a short-lived cache so the scan does not hammer the
    /// store every tick.
    fn settings(&self, instance_id: i64) -> ReannounceSettings {
        {
            let cache = self.settings_cache.lock().unwrap();
            if let Some((settings, loaded_at)) = cache.get(&instance_id) {
                if loaded_at.elapsed() < SETTINGS_TTL {
                    return settings.clone();
                }
            }
        }
        let settings = self.settings_store.get(instance_id).unwrap_or_default();
        self.settings_cache
            .lock()
            .unwrap()
            .insert(instance_id, (settings.clone(), Instant::now()));
        settings
    }

    /// Drop cached settings (PUT on the settings API)
    pub fn invalidate_settings(&self, instance_id: i64) {
        self.settings_cache.lock().unwrap().remove(&instance_id);
    }

    async fn scan_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Reannounce scan loop stopping");
                        return;
                    }
                }
            }

            for instance in self.pool.all_instances() {
                let settings = self.settings(instance.id);
                if !settings.enabled {
                    continue;
                }
                if let Err(e) = self.scan_instance(instance.id, &settings).await {
                    warn!("Reannounce scan of instance {} failed: {}", instance.id, e);
                }
            }
        }
    }

    async fn scan_instance(
        self: &Arc<Self>,
        instance_id: i64,
        settings: &ReannounceSettings,
    ) -> crate::sync::Result<()> {
        let stalled = self.sync.stalled_with_trackers(instance_id).await?;
        let now_unix = chrono::Utc::now().timestamp();

        for torrent in stalled {
            if !torrent_in_scope(&torrent, settings, now_unix) {
                continue;
            }
            // An empty tracker snapshot is not proof of health; enqueue and
            // let the job fetch fresh data.
            let needs_job = torrent.trackers.is_empty()
                || !unhealthy_urls(&torrent.trackers, &settings.exclude_trackers).is_empty();
            if needs_job {
                self.enqueue(instance_id, &torrent.hash, Some(torrent.name.clone()), settings);
            }
        }
        Ok(())
    }

    /// Hand hashes to the controller (proxy interception, manual API call).
    /// Hashes are normalized and deduplicated before enqueueing.
    pub fn request_reannounce(self: &Arc<Self>, instance_id: i64, hashes: &[String]) {
        let settings = self.settings(instance_id);
        for hash in normalize_hashes(hashes.iter()) {
            self.enqueue(instance_id, &hash, None, &settings);
        }
    }

    /// Split an intercepted reannounce request: hashes this controller
    /// takes over (stalled with unhealthy or unknown trackers) versus
    /// hashes forwarded upstream untouched.
    pub async fn intercept(
        self: &Arc<Self>,
        instance_id: i64,
        hashes: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let settings = self.settings(instance_id);
        if !settings.enabled {
            return (Vec::new(), hashes.to_vec());
        }

        let mut handled = Vec::new();
        let mut forward = Vec::new();
        for hash in normalize_hashes(hashes.iter()) {
            let torrent = self.sync.torrent(instance_id, &hash).await.ok().flatten();
            let take_over = match torrent {
                Some(ref t) => {
                    t.trackers.is_empty()
                        || !unhealthy_urls(&t.trackers, &settings.exclude_trackers).is_empty()
                }
                None => false,
            };
            if take_over {
                let name = torrent.map(|t| t.name);
                self.enqueue(instance_id, &hash, name, &settings);
                handled.push(hash);
            } else {
                forward.push(hash);
            }
        }
        (handled, forward)
    }

    /// Debounced enqueue; at most one running job per (instance, hash)
    fn enqueue(
        self: &Arc<Self>,
        instance_id: i64,
        hash: &str,
        name: Option<String>,
        settings: &ReannounceSettings,
    ) {
        let cooldown = Duration::from_secs(settings.effective_debounce_secs());
        let key = (instance_id, hash.to_string());

        {
            let mut jobs = self.jobs.lock().unwrap();
            let state = jobs.entry(key).or_default();

            if state.running {
                return;
            }
            if let Some(last) = state.last_requested {
                if last.elapsed() < cooldown {
                    drop(jobs);
                    self.record(
                        instance_id,
                        hash,
                        name.as_deref(),
                        ActivityOutcome::Skipped,
                        "debounced",
                        None,
                    );
                    return;
                }
            }
            state.running = true;
            state.last_requested = Some(Instant::now());
        }

        let controller = self.clone();
        let hash = hash.to_string();
        let settings = settings.clone();
        tokio::spawn(async move {
            let deadline = job_timeout(&settings);
            let run = controller.run_job(instance_id, &hash, name.as_deref(), &settings);
            if tokio::time::timeout(deadline, run).await.is_err() {
                controller.record(
                    instance_id,
                    &hash,
                    name.as_deref(),
                    ActivityOutcome::Failed,
                    "job timed out",
                    None,
                );
            }
            let mut jobs = controller.jobs.lock().unwrap();
            if let Some(state) = jobs.get_mut(&(instance_id, hash.clone())) {
                state.running = false;
            }
        });
    }

    /// One job: up to `max_retries` reclassify-and-reannounce attempts,
    /// stopping early once no unhealthy tracker remains. Per-domain attempt
    /// counts never exceed the retry cap.
    async fn run_job(
        self: &Arc<Self>,
        instance_id: i64,
        hash: &str,
        name: Option<&str>,
        settings: &ReannounceSettings,
    ) {
        let client = match self.pool.get_client(instance_id).await {
            Ok(c) => c,
            Err(e) => {
                self.record(
                    instance_id,
                    hash,
                    name,
                    ActivityOutcome::Failed,
                    &format!("client unavailable: {e}"),
                    None,
                );
                return;
            }
        };

        let mut attempts_per_domain: HashMap<String, u32> = HashMap::new();
        let mut requests_made = 0u32;

        for attempt in 0..settings.max_retries.max(1) {
            let trackers = match client.get_torrent_trackers(hash).await {
                Ok(t) => t,
                Err(e) => {
                    self.record(
                        instance_id,
                        hash,
                        name,
                        ActivityOutcome::Failed,
                        &format!("tracker fetch failed: {e}"),
                        None,
                    );
                    return;
                }
            };

            let unhealthy = unhealthy_urls(&trackers, &settings.exclude_trackers);
            if unhealthy.is_empty() {
                let (outcome, reason) = if requests_made > 0 {
                    (ActivityOutcome::Success, "trackers recovered".to_string())
                } else {
                    (ActivityOutcome::Skipped, "no unhealthy trackers".to_string())
                };
                self.record(
                    instance_id,
                    hash,
                    name,
                    outcome,
                    &reason,
                    Some(serde_json::json!({ "attempts": requests_made })),
                );
                return;
            }

            // Respect the per-domain cap; drop URLs whose domain is spent.
            let eligible: Vec<String> = unhealthy
                .into_iter()
                .filter(|url| {
                    let domain = tracker_domain(url).unwrap_or_else(|| url.clone());
                    attempts_per_domain.get(&domain).copied().unwrap_or(0) < settings.max_retries
                })
                .collect();

            if eligible.is_empty() {
                self.record(
                    instance_id,
                    hash,
                    name,
                    ActivityOutcome::Failed,
                    "per-domain retry cap reached",
                    Some(serde_json::json!({ "attempts": requests_made })),
                );
                return;
            }

            if let Err(e) = client.reannounce_trackers(hash, &eligible).await {
                self.record(
                    instance_id,
                    hash,
                    name,
                    ActivityOutcome::Failed,
                    &format!("reannounce failed: {e}"),
                    None,
                );
                return;
            }
            requests_made += 1;
            for url in &eligible {
                let domain = tracker_domain(url).unwrap_or_else(|| url.clone());
                *attempts_per_domain.entry(domain).or_default() += 1;
            }

            if attempt + 1 < settings.max_retries.max(1) {
                tokio::time::sleep(Duration::from_secs(settings.interval_secs)).await;
            }
        }

        self.record(
            instance_id,
            hash,
            name,
            ActivityOutcome::Failed,
            "trackers still unhealthy after retries",
            Some(serde_json::json!({ "attempts": requests_made })),
        );
    }

    fn record(
        &self,
        instance_id: i64,
        hash: &str,
        name: Option<&str>,
        outcome: ActivityOutcome,
        reason: &str,
        details: Option<serde_json::Value>,
    ) {
        let event = ActivityEvent {
            instance_id,
            hash: hash.to_string(),
            torrent_name: name.unwrap_or("").to_string(),
            action: "reannounce".to_string(),
            outcome,
            reason: reason.to_string(),
            details,
        };
        let activity = self.activity.clone();
        tokio::spawn(async move { activity.record(event).await });
    }

    #[cfg(test)]
    pub(crate) fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolSettings, SyncSettings};
    use crate::db::instances::{InstanceInput, InstanceStore};
    use crate::db::Database;

    struct MemorySink(std::sync::Mutex<Vec<ActivityEvent>>);

    #[async_trait::async_trait]
    impl ActivitySink for MemorySink {
        async fn record(&self, event: ActivityEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn tracker(url: &str, status: i64, msg: &str) -> TrackerInfo {
        TrackerInfo {
            url: url.to_string(),
            status,
            msg: msg.to_string(),
            tier: 0,
        }
    }

    fn controller() -> (Arc<ReannounceController>, Arc<MemorySink>, InstanceStore) {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db.clone());
        let (_tx, rx) = watch::channel(false);
        let pool = ClientPool::new(store.clone(), PoolSettings::default(), rx.clone());
        let sync = SyncManager::new(pool.clone(), store.clone(), SyncSettings::default(), rx.clone());
        let sink = Arc::new(MemorySink(std::sync::Mutex::new(Vec::new())));
        let controller = ReannounceController::new(
            pool,
            sync,
            ReannounceSettingsStore::new(db),
            sink.clone(),
            rx,
        );
        (controller, sink, store)
    }

    #[test]
    fn test_classify_tracker() {
        let excluded = vec!["banned.org".to_string()];
        assert_eq!(
            classify_tracker(&tracker("** [DHT] **", 2, ""), &excluded),
            TrackerHealth::Disabled
        );
        assert_eq!(
            classify_tracker(&tracker("https://t.banned.org/announce", 4, ""), &excluded),
            TrackerHealth::Excluded
        );
        assert_eq!(
            classify_tracker(&tracker("https://t.ok.org/announce", 2, ""), &excluded),
            TrackerHealth::Healthy
        );
        assert_eq!(
            classify_tracker(&tracker("https://t.ok.org/announce", 3, ""), &excluded),
            TrackerHealth::Updating
        );
        assert_eq!(
            classify_tracker(&tracker("https://t.ok.org/announce", 4, "timeout"), &excluded),
            TrackerHealth::Unhealthy
        );
        // Unregistered is not fixable by reannouncing
        assert_eq!(
            classify_tracker(
                &tracker("https://t.ok.org/announce", 4, "Unregistered torrent"),
                &excluded
            ),
            TrackerHealth::Excluded
        );
    }

    #[test]
    fn test_torrent_scope_filters() {
        let settings = ReannounceSettings {
            max_age_secs: 3600,
            include_categories: vec!["movies".to_string()],
            exclude_tags: vec!["skip".to_string()],
            ..Default::default()
        };
        let now = 10_000;

        let mut t = TorrentInfo {
            category: "movies".to_string(),
            added_on: 9_000,
            ..Default::default()
        };
        assert!(torrent_in_scope(&t, &settings, now));

        t.added_on = 1_000;
        assert!(!torrent_in_scope(&t, &settings, now));

        t.added_on = 9_000;
        t.category = "tv".to_string();
        assert!(!torrent_in_scope(&t, &settings, now));

        t.category = "movies".to_string();
        t.tags = "keep,skip".to_string();
        assert!(!torrent_in_scope(&t, &settings, now));
    }

    #[test]
    fn test_job_timeout_bounds() {
        let mut settings = ReannounceSettings {
            interval_secs: 2,
            max_retries: 3,
            ..Default::default()
        };
        // (3-1)*2 + 30 = 34 < floor
        assert_eq!(job_timeout(&settings), Duration::from_secs(60));

        settings.interval_secs = 60;
        settings.max_retries = 10;
        // (10-1)*60 + 30 = 570
        assert_eq!(job_timeout(&settings), Duration::from_secs(570));

        settings.interval_secs = 600;
        // way past the ceiling
        assert_eq!(job_timeout(&settings), Duration::from_secs(20 * 60));
    }

    #[tokio::test]
    async fn test_request_reannounce_dedupes_hashes() {
        let (controller, _sink, store) = controller();
        let instance = store
            .create(&InstanceInput {
                name: "box".into(),
                base_url: "http://127.0.0.1:1".into(),
                username: None,
                password: None,
                active: true,
                sync_interval_mins: 0,
            })
            .unwrap();

        controller.request_reannounce(
            instance.id,
            &[
                "abcdef0123456789abcdef0123456789abcdef01".to_string(),
                "  ABCDEF0123456789ABCDEF0123456789ABCDEF01  ".to_string(),
            ],
        );
        assert_eq!(controller.job_count(), 1);
    }

    #[tokio::test]
    async fn test_debounce_records_skip() {
        let (controller, sink, store) = controller();
        let instance = store
            .create(&InstanceInput {
                name: "box".into(),
                base_url: "http://127.0.0.1:1".into(),
                username: None,
                password: None,
                active: true,
                sync_interval_mins: 0,
            })
            .unwrap();

        let hash = vec!["AAAA000000000000000000000000000000000000".to_string()];
        controller.request_reannounce(instance.id, &hash);
        // Wait for the first job to finish (client is unreachable, fails fast)
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let jobs = controller.jobs.lock().unwrap();
            if jobs.values().all(|j| !j.running) {
                break;
            }
        }

        controller.request_reannounce(instance.id, &hash);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = sink.0.lock().unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.outcome == ActivityOutcome::Skipped && e.reason == "debounced"),
            "expected a debounced skip event, got {:?}",
            events.iter().map(|e| (&e.reason, e.outcome)).collect::<Vec<_>>()
        );
    }
}
