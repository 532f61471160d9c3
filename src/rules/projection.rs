//! Free-space projection
//!
//! When automations evaluate "free space after hypothetical deletes", the
//! plan accumulates in a per-source projection so that cross-seeded files
//! (same payload, several torrents) are only counted once.

use std::collections::{HashMap, HashSet};

use crate::qbit::TorrentInfo;

#[derive(Debug, Clone, Default)]
pub struct FreeSpaceProjection {
    pub free_space: i64,
    pub space_to_clear: i64,
    files_to_clear: HashSet<String>,
    hardlink_signatures_to_clear: HashSet<String>,
}

fn payload_signature(t: &TorrentInfo) -> String {
    format!("{}:{}", t.content_path, t.size)
}

impl FreeSpaceProjection {
    pub fn new(free_space: i64) -> Self {
        Self {
            free_space,
            ..Default::default()
        }
    }

    /// Account a hypothetical delete. Returns false when the torrent's
    /// payload was already part of the plan (cross-seed double-count).
    pub fn plan_delete(&mut self, t: &TorrentInfo) -> bool {
        let signature = payload_signature(t);
        if !t.content_path.is_empty() && self.files_to_clear.contains(&t.content_path) {
            return false;
        }
        if self.hardlink_signatures_to_clear.contains(&signature) {
            return false;
        }
        if !t.content_path.is_empty() {
            self.files_to_clear.insert(t.content_path.clone());
        }
        self.hardlink_signatures_to_clear.insert(signature);
        self.space_to_clear += t.size.max(0);
        true
    }

    /// Free space assuming the accumulated plan executes
    pub fn projected(&self) -> i64 {
        self.free_space.saturating_add(self.space_to_clear)
    }
}

/// Projections keyed by source (one per instance or disk), with one active
/// at a time. Switching sources persists the outgoing projection and
/// restores any prior state of the incoming one.
#[derive(Debug, Clone, Default)]
pub struct ProjectionSet {
    sources: HashMap<String, FreeSpaceProjection>,
    active: Option<String>,
}

impl ProjectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a source, seeding its free space on first use
    pub fn switch_source(&mut self, source: &str, free_space: i64) {
        self.sources
            .entry(source.to_string())
            .or_insert_with(|| FreeSpaceProjection::new(free_space));
        self.active = Some(source.to_string());
    }

    pub fn active(&self) -> Option<&FreeSpaceProjection> {
        self.sources.get(self.active.as_ref()?)
    }

    pub fn active_mut(&mut self) -> Option<&mut FreeSpaceProjection> {
        let key = self.active.clone()?;
        self.sources.get_mut(&key)
    }

    /// Projected free space of the active source, if any
    pub fn projected_free_space(&self) -> Option<i64> {
        self.active().map(|p| p.projected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(hash: &str, content_path: &str, size: i64) -> TorrentInfo {
        TorrentInfo {
            hash: hash.to_string(),
            content_path: content_path.to_string(),
            size,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_accumulates() {
        let mut p = FreeSpaceProjection::new(1000);
        assert!(p.plan_delete(&torrent("A", "/data/a", 100)));
        assert!(p.plan_delete(&torrent("B", "/data/b", 50)));
        assert_eq!(p.space_to_clear, 150);
        assert_eq!(p.projected(), 1150);
    }

    #[test]
    fn test_cross_seeded_payload_counted_once() {
        let mut p = FreeSpaceProjection::new(0);
        assert!(p.plan_delete(&torrent("A", "/data/shared", 100)));
        // Same payload under a second torrent (cross-seed)
        assert!(!p.plan_delete(&torrent("B", "/data/shared", 100)));
        assert_eq!(p.space_to_clear, 100);
    }

    #[test]
    fn test_switch_source_persists_state() {
        let mut set = ProjectionSet::new();
        set.switch_source("disk1", 1000);
        set.active_mut()
            .unwrap()
            .plan_delete(&torrent("A", "/d1/a", 100));

        set.switch_source("disk2", 500);
        assert_eq!(set.projected_free_space(), Some(500));

        // Back to disk1: the earlier plan is still there
        set.switch_source("disk1", 0);
        assert_eq!(set.projected_free_space(), Some(1100));
    }
}
