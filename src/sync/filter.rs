//! Torrent filtering, search, sort, and pagination
//!
//! The status-bucket taxonomy is a fixed predicate set over the raw upstream
//! state string; `unregistered` and `tracker_down` additionally consult the
//! classifier sets maintained by the indexer.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::qbit::TorrentInfo;

pub const DEFAULT_LIMIT: usize = 300;
pub const MAX_LIMIT: usize = 2000;
pub const DEFAULT_SORT: &str = "added_on";

/// Clamp a requested page size into `[1, MAX_LIMIT]`
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// Anything other than `asc` normalizes to descending
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        }
    }
}

/// Named status buckets over the raw qBittorrent state string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusBucket {
    All,
    Completed,
    Downloading,
    Seeding,
    Paused,
    Running,
    Active,
    Inactive,
    Stalled,
    StalledUploading,
    StalledDownloading,
    Checking,
    Moving,
    Errored,
    Missingfiles,
    Unregistered,
    TrackerDown,
}

/// Buckets the indexer materializes (everything except `All`)
pub const INDEXED_BUCKETS: &[StatusBucket] = &[
    StatusBucket::Completed,
    StatusBucket::Downloading,
    StatusBucket::Seeding,
    StatusBucket::Paused,
    StatusBucket::Running,
    StatusBucket::Active,
    StatusBucket::Inactive,
    StatusBucket::Stalled,
    StatusBucket::StalledUploading,
    StatusBucket::StalledDownloading,
    StatusBucket::Checking,
    StatusBucket::Moving,
    StatusBucket::Errored,
    StatusBucket::Missingfiles,
    StatusBucket::Unregistered,
    StatusBucket::TrackerDown,
];

impl StatusBucket {
    pub fn parse(raw: &str) -> Option<Self> {
        let bucket = match raw.to_ascii_lowercase().as_str() {
            "all" => Self::All,
            "completed" => Self::Completed,
            "downloading" => Self::Downloading,
            "seeding" => Self::Seeding,
            "paused" | "stopped" => Self::Paused,
            "running" | "resumed" => Self::Running,
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            "stalled" => Self::Stalled,
            "stalled_uploading" => Self::StalledUploading,
            "stalled_downloading" => Self::StalledDownloading,
            "checking" => Self::Checking,
            "moving" => Self::Moving,
            "errored" | "error" => Self::Errored,
            "missingfiles" | "missing_files" => Self::Missingfiles,
            "unregistered" => Self::Unregistered,
            "tracker_down" => Self::TrackerDown,
            _ => return None,
        };
        Some(bucket)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Completed => "completed",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Stalled => "stalled",
            Self::StalledUploading => "stalled_uploading",
            Self::StalledDownloading => "stalled_downloading",
            Self::Checking => "checking",
            Self::Moving => "moving",
            Self::Errored => "errored",
            Self::Missingfiles => "missingfiles",
            Self::Unregistered => "unregistered",
            Self::TrackerDown => "tracker_down",
        }
    }

    /// Whether the torrent falls into this bucket. `unregistered` and
    /// `tracker_down` come from the tracker-message classifier.
    pub fn matches(
        &self,
        t: &TorrentInfo,
        unregistered: &HashSet<String>,
        tracker_down: &HashSet<String>,
    ) -> bool {
        let state = t.state.as_str();
        match self {
            Self::All => true,
            Self::Completed => t.progress >= 1.0,
            Self::Downloading => matches!(
                state,
                "downloading" | "metaDL" | "forcedDL" | "queuedDL" | "allocating"
            ),
            Self::Seeding => matches!(state, "uploading" | "stalledUP" | "forcedUP" | "queuedUP"),
            Self::Paused => matches!(
                state,
                "pausedDL" | "pausedUP" | "stoppedDL" | "stoppedUP"
            ),
            Self::Running => !Self::Paused.matches(t, unregistered, tracker_down),
            Self::Active => t.dlspeed > 0 || t.upspeed > 0,
            Self::Inactive => t.dlspeed <= 0 && t.upspeed <= 0,
            Self::Stalled => matches!(state, "stalledUP" | "stalledDL"),
            Self::StalledUploading => state == "stalledUP",
            Self::StalledDownloading => state == "stalledDL",
            Self::Checking => matches!(
                state,
                "checkingUP" | "checkingDL" | "checkingResumeData"
            ),
            Self::Moving => state == "moving",
            Self::Errored => state == "error",
            Self::Missingfiles => state == "missingFiles",
            Self::Unregistered => unregistered.contains(&t.hash),
            Self::TrackerDown => tracker_down.contains(&t.hash),
        }
    }
}

/// Structured filters carried by stream subscriptions: values within one
/// dimension are ORed, dimensions are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TorrentFilters {
    #[serde(default)]
    pub status: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub trackers: Vec<String>,
}

impl TorrentFilters {
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
            && self.categories.is_empty()
            && self.tags.is_empty()
            && self.trackers.is_empty()
    }
}

/// A filtered, sorted, paginated view request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub filters: TorrentFilters,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_sort() -> String {
    DEFAULT_SORT.to_string()
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            page: 0,
            limit: DEFAULT_LIMIT,
            sort: default_sort(),
            order: SortOrder::Desc,
            search: None,
            filters: TorrentFilters::default(),
        }
    }
}

impl QueryOptions {
    /// Clamp limit and normalize sort/order so that equivalent requests
    /// produce identical options (and identical group keys).
    pub fn normalize(&mut self) {
        self.limit = self.limit.clamp(1, MAX_LIMIT);
        if self.sort.trim().is_empty() {
            self.sort = default_sort();
        }
        if let Some(ref s) = self.search {
            if s.trim().is_empty() {
                self.search = None;
            }
        }
    }

    /// Canonical identity of a `(instance, options)` subscription shape.
    /// Identical shapes coalesce into one upstream poll.
    pub fn canonical_key(&self, instance_id: i64) -> String {
        let mut status = self.filters.status.clone();
        let mut categories = self.filters.categories.clone();
        let mut tags = self.filters.tags.clone();
        let mut trackers = self.filters.trackers.clone();
        status.sort();
        categories.sort();
        tags.sort();
        trackers.sort();

        format!(
            "i{}|p{}|l{}|s{}|o{:?}|q{}|st{}|c{}|t{}|tr{}",
            instance_id,
            self.page,
            self.limit,
            self.sort,
            self.order,
            self.search.as_deref().unwrap_or(""),
            status.join(","),
            categories.join(","),
            tags.join(","),
            trackers.join(","),
        )
    }
}

/// Compiled search pattern: whole-word containment by default, glob when
/// the pattern carries glob metacharacters.
pub enum SearchMatcher {
    Words(Vec<String>),
    Glob(regex::Regex),
}

impl SearchMatcher {
    pub fn new(pattern: &str) -> Self {
        let trimmed = pattern.trim();
        if trimmed.chars().any(|c| matches!(c, '*' | '?' | '[' | ']')) {
            if let Ok(re) = glob_to_regex(trimmed) {
                return Self::Glob(re);
            }
        }
        Self::Words(
            trimmed
                .split_whitespace()
                .map(|w| w.to_lowercase())
                .collect(),
        )
    }

    pub fn matches(&self, t: &TorrentInfo) -> bool {
        match self {
            Self::Words(words) => {
                if words.is_empty() {
                    return true;
                }
                let haystack: HashSet<String> = [t.name.as_str(), t.category.as_str(), t.tags.as_str()]
                    .iter()
                    .flat_map(|s| s.split(|c: char| !c.is_alphanumeric()))
                    .filter(|w| !w.is_empty())
                    .map(|w| w.to_lowercase())
                    .collect();
                words.iter().all(|w| haystack.contains(w))
            }
            Self::Glob(re) => {
                re.is_match(&t.name)
                    || re.is_match(&t.category)
                    || t.tag_list().iter().any(|tag| re.is_match(tag))
            }
        }
    }
}

/// Translate a glob (`* ? [ ]`) into an anchored case-insensitive regex
fn glob_to_regex(glob: &str) -> Result<regex::Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?i)^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' | ']' => pattern.push(c),
            c if "\\.+()|{}^$".contains(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    regex::Regex::new(&pattern)
}

/// Stable comparison over a named sort field, tiebreaking on hash so that
/// pagination never shuffles equal keys.
pub fn compare_torrents(
    a: &TorrentInfo,
    b: &TorrentInfo,
    sort: &str,
    order: SortOrder,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let primary = match sort {
        "name" => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        "category" => a.category.to_lowercase().cmp(&b.category.to_lowercase()),
        "state" => a.state.cmp(&b.state),
        "tracker" => a.tracker.cmp(&b.tracker),
        "size" => a.size.cmp(&b.size),
        "total_size" => a.total_size.cmp(&b.total_size),
        "downloaded" => a.downloaded.cmp(&b.downloaded),
        "uploaded" => a.uploaded.cmp(&b.uploaded),
        "amount_left" => a.amount_left.cmp(&b.amount_left),
        "progress" => a.progress.partial_cmp(&b.progress).unwrap_or(Ordering::Equal),
        "ratio" => a.ratio.partial_cmp(&b.ratio).unwrap_or(Ordering::Equal),
        "availability" => a
            .availability
            .partial_cmp(&b.availability)
            .unwrap_or(Ordering::Equal),
        "dlspeed" => a.dlspeed.cmp(&b.dlspeed),
        "upspeed" => a.upspeed.cmp(&b.upspeed),
        "num_seeds" => a.num_seeds.cmp(&b.num_seeds),
        "num_leechs" => a.num_leechs.cmp(&b.num_leechs),
        "num_complete" => a.num_complete.cmp(&b.num_complete),
        "num_incomplete" => a.num_incomplete.cmp(&b.num_incomplete),
        "completion_on" => a.completion_on.cmp(&b.completion_on),
        "last_activity" => a.last_activity.cmp(&b.last_activity),
        "time_active" => a.time_active.cmp(&b.time_active),
        "seeding_time" => a.seeding_time.cmp(&b.seeding_time),
        _ => a.added_on.cmp(&b.added_on),
    };

    let ordered = match order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    ordered.then_with(|| a.hash.cmp(&b.hash))
}

/// Slice one page out of a sorted listing; out-of-range pages yield an
/// empty slice while the total stays accurate.
pub fn paginate<T: Clone>(items: &[T], page: usize, limit: usize) -> (Vec<T>, usize) {
    let total = items.len();
    let start = page.saturating_mul(limit);
    if start >= total {
        return (Vec::new(), total);
    }
    let end = (start + limit).min(total);
    (items[start..end].to_vec(), total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(hash: &str, name: &str, state: &str, progress: f64) -> TorrentInfo {
        TorrentInfo {
            hash: hash.to_string(),
            name: name.to_string(),
            state: state.to_string(),
            progress,
            ..Default::default()
        }
    }

    #[test]
    fn test_bucket_parse_aliases() {
        assert_eq!(StatusBucket::parse("STALLED"), Some(StatusBucket::Stalled));
        assert_eq!(StatusBucket::parse("stopped"), Some(StatusBucket::Paused));
        assert_eq!(StatusBucket::parse("errored"), Some(StatusBucket::Errored));
        assert_eq!(StatusBucket::parse("bogus"), None);
    }

    #[test]
    fn test_bucket_predicates() {
        let empty = HashSet::new();
        let stalled = torrent("A", "a", "stalledUP", 1.0);
        let downloading = torrent("B", "b", "downloading", 0.5);
        let errored = torrent("C", "c", "error", 0.0);

        assert!(StatusBucket::Stalled.matches(&stalled, &empty, &empty));
        assert!(!StatusBucket::Stalled.matches(&downloading, &empty, &empty));
        assert!(!StatusBucket::Stalled.matches(&errored, &empty, &empty));

        assert!(StatusBucket::Errored.matches(&errored, &empty, &empty));
        assert!(!StatusBucket::Errored.matches(&stalled, &empty, &empty));

        assert!(StatusBucket::Seeding.matches(&stalled, &empty, &empty));
        assert!(StatusBucket::Completed.matches(&stalled, &empty, &empty));
        assert!(StatusBucket::Running.matches(&downloading, &empty, &empty));
        assert!(!StatusBucket::Running.matches(&torrent("D", "d", "pausedDL", 0.1), &empty, &empty));
    }

    #[test]
    fn test_unregistered_bucket_uses_classifier_set() {
        let t = torrent("ABC", "x", "uploading", 1.0);
        let mut unregistered = HashSet::new();
        let empty = HashSet::new();
        assert!(!StatusBucket::Unregistered.matches(&t, &unregistered, &empty));
        unregistered.insert("ABC".to_string());
        assert!(StatusBucket::Unregistered.matches(&t, &unregistered, &empty));
    }

    #[test]
    fn test_search_whole_word() {
        let t = TorrentInfo {
            name: "Ubuntu-22.04-desktop-amd64".to_string(),
            category: "linux".to_string(),
            tags: "iso,official".to_string(),
            ..Default::default()
        };
        assert!(SearchMatcher::new("ubuntu").matches(&t));
        assert!(SearchMatcher::new("UBUNTU desktop").matches(&t));
        assert!(SearchMatcher::new("linux iso").matches(&t));
        // Whole-word: a fragment is not a word
        assert!(!SearchMatcher::new("ubun").matches(&t));
        assert!(!SearchMatcher::new("fedora").matches(&t));
    }

    #[test]
    fn test_search_glob() {
        let t = TorrentInfo {
            name: "Ubuntu-22.04-desktop-amd64".to_string(),
            ..Default::default()
        };
        assert!(SearchMatcher::new("Ubuntu*amd64").matches(&t));
        assert!(SearchMatcher::new("ubuntu*").matches(&t));
        assert!(SearchMatcher::new("Ubuntu-2?.04*").matches(&t));
        assert!(!SearchMatcher::new("Debian*").matches(&t));
    }

    #[test]
    fn test_sort_stable_tiebreak() {
        let a = torrent("AAA", "same", "uploading", 1.0);
        let b = torrent("BBB", "same", "uploading", 1.0);
        assert_eq!(
            compare_torrents(&a, &b, "name", SortOrder::Desc),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            compare_torrents(&a, &b, "name", SortOrder::Asc),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn test_order_normalization() {
        assert_eq!(SortOrder::parse("asc"), SortOrder::Asc);
        assert_eq!(SortOrder::parse("ASC"), SortOrder::Asc);
        assert_eq!(SortOrder::parse("desc"), SortOrder::Desc);
        assert_eq!(SortOrder::parse("sideways"), SortOrder::Desc);
    }

    #[test]
    fn test_paginate_totality_and_bounds() {
        let items: Vec<i32> = (0..10).collect();
        let (page0, total) = paginate(&items, 0, 4);
        let (page1, _) = paginate(&items, 1, 4);
        let (page2, _) = paginate(&items, 2, 4);
        let (page3, total3) = paginate(&items, 3, 4);

        assert_eq!(total, 10);
        assert_eq!(page0.len() + page1.len() + page2.len() + page3.len(), total);
        assert_eq!(page2, vec![8, 9]);
        assert!(page3.is_empty());
        assert_eq!(total3, 10);
    }

    #[test]
    fn test_limit_clamp() {
        assert_eq!(clamp_limit(None), 300);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(5000)), 2000);
        assert_eq!(clamp_limit(Some(50)), 50);
    }

    #[test]
    fn test_canonical_key_order_insensitive_filters() {
        let mut a = QueryOptions::default();
        a.filters.tags = vec!["x".into(), "y".into()];
        let mut b = QueryOptions::default();
        b.filters.tags = vec!["y".into(), "x".into()];
        assert_eq!(a.canonical_key(1), b.canonical_key(1));
        assert_ne!(a.canonical_key(1), a.canonical_key(2));
    }
}
