//! Derived torrent indexes
//!
//! Every index is a strict function of the current snapshot and is rebuilt
//! off-lock, then swapped in atomically with the snapshot it was computed
//! from. Counter endpoints answer from cardinalities without scanning.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::filter::{StatusBucket, INDEXED_BUCKETS};
use crate::qbit::{models::tracker_status, TorrentInfo};
use crate::utils::tracker_domain;

/// Where a torrent's payload files are hardlinked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardlinkScope {
    /// No file has extra links
    None,
    /// Extra links all belong to other torrents in the snapshot
    Internal,
    /// Extra links all point outside the client
    External,
    Mixed,
}

/// Torrents sharing a normalized name
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub name: String,
    pub hashes: Vec<String>,
    /// Summed payload size of the members (what deleting all but one of
    /// them could reclaim, cross-seeds aside)
    pub size: i64,
}

#[derive(Debug, Default)]
pub struct TorrentIndexes {
    pub by_category: BTreeMap<String, BTreeSet<String>>,
    pub by_tag: HashMap<String, HashSet<String>>,
    pub by_tracker: HashMap<String, HashSet<String>>,
    pub by_bucket: HashMap<StatusBucket, HashSet<String>>,
    pub unregistered: HashSet<String>,
    pub tracker_down: HashSet<String>,
    pub hardlink_scope: HashMap<String, HardlinkScope>,
    pub duplicates: Vec<DuplicateGroup>,
}

/// Messages trackers use to say a torrent is gone from their side
const UNREGISTERED_PATTERNS: &[&str] = &[
    "unregistered",
    "not registered",
    "torrent not found",
    "torrent does not exist",
    "not exist",
    "not found",
    "trumped",
    "dupe of",
    "infohash not found",
    "not authorized",
];

/// A tracker whose status is OK but whose message matches a known
/// "not registered" pattern.
pub fn is_unregistered_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    UNREGISTERED_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify one torrent's tracker list. Returns `(unregistered, down)`.
/// Empty tracker lists classify as neither; callers that need certainty
/// fetch fresh tracker data first.
pub fn classify_trackers(t: &TorrentInfo) -> (bool, bool) {
    let real: Vec<_> = t.trackers.iter().filter(|tr| tr.is_real_tracker()).collect();
    if real.is_empty() {
        return (false, false);
    }

    let unregistered = real.iter().any(|tr| is_unregistered_message(&tr.msg));
    if unregistered {
        return (true, false);
    }

    let any_alive = real.iter().any(|tr| {
        matches!(
            tr.status,
            tracker_status::WORKING | tracker_status::UPDATING
        )
    });
    (false, !any_alive)
}

/// Normalize a release name for duplicate grouping: separators become
/// spaces, case folds, whitespace collapses.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_space = true;
    for c in name.chars() {
        let c = match c {
            '.' | '_' | '-' => ' ',
            c => c,
        };
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.extend(c.to_lowercase());
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

impl TorrentIndexes {
    /// Build every index from a snapshot. Hardlink scopes come from the
    /// optional collector output and are carried through unchanged.
    pub fn build(
        torrents: &HashMap<String, TorrentInfo>,
        hardlink_scope: HashMap<String, HardlinkScope>,
    ) -> Self {
        let mut by_category: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut by_tag: HashMap<String, HashSet<String>> = HashMap::new();
        let mut by_tracker: HashMap<String, HashSet<String>> = HashMap::new();
        let mut unregistered = HashSet::new();
        let mut tracker_down = HashSet::new();
        let mut by_name: HashMap<String, Vec<(String, i64)>> = HashMap::new();

        for (hash, t) in torrents {
            by_category
                .entry(t.category.clone())
                .or_default()
                .insert(hash.clone());

            for tag in t.tag_list() {
                by_tag.entry(tag).or_default().insert(hash.clone());
            }

            if let Some(domain) = tracker_domain(&t.tracker) {
                by_tracker.entry(domain).or_default().insert(hash.clone());
            }
            for tr in t.trackers.iter().filter(|tr| tr.is_real_tracker()) {
                if let Some(domain) = tracker_domain(&tr.url) {
                    by_tracker.entry(domain).or_default().insert(hash.clone());
                }
            }

            let (is_unregistered, is_down) = classify_trackers(t);
            if is_unregistered {
                unregistered.insert(hash.clone());
            }
            if is_down {
                tracker_down.insert(hash.clone());
            }

            by_name
                .entry(normalize_name(&t.name))
                .or_default()
                .push((hash.clone(), t.size));
        }

        let mut by_bucket: HashMap<StatusBucket, HashSet<String>> = HashMap::new();
        for bucket in INDEXED_BUCKETS {
            let members: HashSet<String> = torrents
                .iter()
                .filter(|(_, t)| bucket.matches(t, &unregistered, &tracker_down))
                .map(|(hash, _)| hash.clone())
                .collect();
            by_bucket.insert(*bucket, members);
        }

        let mut duplicates: Vec<DuplicateGroup> = by_name
            .into_iter()
            .filter(|(name, members)| !name.is_empty() && members.len() > 1)
            .map(|(name, mut members)| {
                members.sort();
                let size = members.iter().map(|(_, size)| (*size).max(0)).sum();
                DuplicateGroup {
                    name,
                    hashes: members.into_iter().map(|(hash, _)| hash).collect(),
                    size,
                }
            })
            .collect();
        duplicates.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            by_category,
            by_tag,
            by_tracker,
            by_bucket,
            unregistered,
            tracker_down,
            hardlink_scope,
            duplicates,
        }
    }

    pub fn bucket_members(&self, bucket: StatusBucket) -> Option<&HashSet<String>> {
        self.by_bucket.get(&bucket)
    }

    /// O(1) cardinality views
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        self.by_category
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    pub fn tag_counts(&self) -> BTreeMap<String, usize> {
        self.by_tag
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    pub fn tracker_counts(&self) -> BTreeMap<String, usize> {
        self.by_tracker
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        self.by_bucket
            .iter()
            .map(|(bucket, v)| (bucket.as_str(), v.len()))
            .collect()
    }
}
