//! qBittorrent Web API wire types
//!
//! Field names mirror the upstream JSON. Torrents keep the raw `state`
//! string and comma-separated `tags`; the sync layer derives buckets and
//! tag sets from them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One torrent as reported by `/torrents/info` or a full maindata update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentInfo {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    /// Comma-separated
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub save_path: String,
    #[serde(default)]
    pub content_path: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub total_size: i64,
    #[serde(default)]
    pub downloaded: i64,
    #[serde(default)]
    pub uploaded: i64,
    #[serde(default)]
    pub amount_left: i64,
    /// 0.0 ..= 1.0
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub ratio: f64,
    #[serde(default)]
    pub availability: f64,
    #[serde(default)]
    pub dlspeed: i64,
    #[serde(default)]
    pub upspeed: i64,
    #[serde(default)]
    pub num_seeds: i64,
    #[serde(default)]
    pub num_leechs: i64,
    #[serde(default)]
    pub num_complete: i64,
    #[serde(default)]
    pub num_incomplete: i64,
    /// Unix seconds
    #[serde(default)]
    pub added_on: i64,
    #[serde(default)]
    pub completion_on: i64,
    #[serde(default)]
    pub last_activity: i64,
    #[serde(default)]
    pub time_active: i64,
    #[serde(default)]
    pub seeding_time: i64,
    /// Primary tracker URL
    #[serde(default)]
    pub tracker: String,
    #[serde(default, rename = "private")]
    pub is_private: bool,
    /// Populated by `includeTrackers=true` (API >= 2.11.4) or a separate
    /// `/torrents/trackers` fetch; absent from plain listings.
    #[serde(default)]
    pub trackers: Vec<TrackerInfo>,
}

impl TorrentInfo {
    /// Parsed tag set, trimmed and without empties
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    }
}

/// Tracker entry from `/torrents/trackers`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub tier: i64,
}

/// Upstream tracker status codes
pub mod tracker_status {
    pub const DISABLED: i64 = 0;
    pub const NOT_CONTACTED: i64 = 1;
    pub const WORKING: i64 = 2;
    pub const UPDATING: i64 = 3;
    pub const NOT_WORKING: i64 = 4;
}

impl TrackerInfo {
    /// DHT/PeX/LSD placeholder rows carry bracketed pseudo-URLs
    pub fn is_real_tracker(&self) -> bool {
        !self.url.is_empty() && !self.url.starts_with("**")
    }
}

/// Partial torrent carried in an incremental maindata update. Every field
/// is optional; `apply` folds the delta into a cached snapshot entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TorrentPatch {
    pub name: Option<String>,
    pub category: Option<String>,
    pub tags: Option<String>,
    pub save_path: Option<String>,
    pub content_path: Option<String>,
    pub state: Option<String>,
    pub size: Option<i64>,
    pub total_size: Option<i64>,
    pub downloaded: Option<i64>,
    pub uploaded: Option<i64>,
    pub amount_left: Option<i64>,
    pub progress: Option<f64>,
    pub ratio: Option<f64>,
    pub availability: Option<f64>,
    pub dlspeed: Option<i64>,
    pub upspeed: Option<i64>,
    pub num_seeds: Option<i64>,
    pub num_leechs: Option<i64>,
    pub num_complete: Option<i64>,
    pub num_incomplete: Option<i64>,
    pub added_on: Option<i64>,
    pub completion_on: Option<i64>,
    pub last_activity: Option<i64>,
    pub time_active: Option<i64>,
    pub seeding_time: Option<i64>,
    pub tracker: Option<String>,
    #[serde(rename = "private")]
    pub is_private: Option<bool>,
}

impl TorrentPatch {
    pub fn apply(&self, torrent: &mut TorrentInfo) {
        macro_rules! patch {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &self.$field {
                    torrent.$field = v.clone();
                })*
            };
        }
        patch!(
            name, category, tags, save_path, content_path, state, size, total_size, downloaded,
            uploaded, amount_left, progress, ratio, availability, dlspeed, upspeed, num_seeds,
            num_leechs, num_complete, num_incomplete, added_on, completion_on, last_activity,
            time_active, seeding_time, tracker, is_private,
        );
    }
}

/// Incremental sync object from `/sync/maindata`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MainData {
    pub rid: i64,
    #[serde(default)]
    pub full_update: bool,
    #[serde(default)]
    pub torrents: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub torrents_removed: Vec<String>,
    #[serde(default)]
    pub categories: HashMap<String, Category>,
    #[serde(default)]
    pub categories_removed: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_removed: Vec<String>,
    #[serde(default)]
    pub server_state: Option<ServerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(rename = "savePath", default)]
    pub save_path: String,
}

/// Subset of the global transfer info the core consumes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub free_space_on_disk: i64,
    #[serde(default)]
    pub dl_info_speed: i64,
    #[serde(default)]
    pub up_info_speed: i64,
}

/// File entry from `/torrents/files`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentContent {
    #[serde(default)]
    pub index: i64,
    pub name: String,
    pub size: i64,
    pub progress: f64,
    #[serde(default)]
    pub priority: i64,
}

/// Listing filter for `/torrents/info`
#[derive(Debug, Clone, Default)]
pub struct TorrentListQuery {
    /// Upstream status filter (all, downloading, seeding, stalled, ...)
    pub filter: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub hashes: Option<Vec<String>>,
    /// Ask the server to inline tracker lists (API >= 2.11.4)
    pub include_trackers: bool,
}

/// Options accepted by `/torrents/add`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddTorrentOptions {
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paused: bool,
    pub savepath: Option<String>,
    pub rename: Option<String>,
    #[serde(default)]
    pub skip_checking: bool,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub first_last_piece_prio: bool,
}

/// Source payload for `/torrents/add`
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// Raw .torrent file bytes
    File { filename: String, bytes: Vec<u8> },
    /// HTTP/magnet URLs, one per line upstream
    Urls(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_list_parsing() {
        let torrent = TorrentInfo {
            tags: " linux , iso ,,arch ".to_string(),
            ..Default::default()
        };
        assert_eq!(torrent.tag_list(), vec!["linux", "iso", "arch"]);
        assert!(TorrentInfo::default().tag_list().is_empty());
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let mut torrent = TorrentInfo {
            name: "old".to_string(),
            progress: 0.25,
            state: "downloading".to_string(),
            ..Default::default()
        };
        let patch: TorrentPatch =
            serde_json::from_str(r#"{"progress": 0.5, "state": "stalledDL"}"#).unwrap();
        patch.apply(&mut torrent);
        assert_eq!(torrent.name, "old");
        assert_eq!(torrent.progress, 0.5);
        assert_eq!(torrent.state, "stalledDL");
    }

    #[test]
    fn test_maindata_deserializes_partial_payload() {
        let raw = r#"{
            "rid": 3,
            "torrents": {"ABC": {"progress": 1.0}},
            "torrents_removed": ["DEF"],
            "server_state": {"free_space_on_disk": 1024}
        }"#;
        let data: MainData = serde_json::from_str(raw).unwrap();
        assert_eq!(data.rid, 3);
        assert!(!data.full_update);
        assert_eq!(data.torrents.len(), 1);
        assert_eq!(data.torrents_removed, vec!["DEF"]);
        assert_eq!(data.server_state.unwrap().free_space_on_disk, 1024);
    }

    #[test]
    fn test_dht_placeholder_is_not_a_tracker() {
        let dht = TrackerInfo {
            url: "** [DHT] **".to_string(),
            ..Default::default()
        };
        assert!(!dht.is_real_tracker());
        let real = TrackerInfo {
            url: "https://tracker.example.org/announce".to_string(),
            ..Default::default()
        };
        assert!(real.is_real_tracker());
    }
}
