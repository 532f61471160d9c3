//! Per-instance reannounce settings store

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::Database;

/// Tuning for the reannounce controller of one instance.
///
/// `interval_secs` spaces attempts inside a job; `debounce_secs` is the
/// cooldown between jobs for the same hash. Aggressive mode shrinks the
/// cooldown down to `interval_secs` (quick retry).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReannounceSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Only torrents added within this window are monitored
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,

    #[serde(default)]
    pub aggressive: bool,

    #[serde(default)]
    pub include_categories: Vec<String>,

    #[serde(default)]
    pub exclude_categories: Vec<String>,

    #[serde(default)]
    pub include_tags: Vec<String>,

    #[serde(default)]
    pub exclude_tags: Vec<String>,

    /// Tracker domains never reannounced
    #[serde(default)]
    pub exclude_trackers: Vec<String>,
}

fn default_interval() -> u64 {
    7
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_age() -> u64 {
    3600
}

fn default_debounce() -> u64 {
    120
}

impl Default for ReannounceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval(),
            max_retries: default_max_retries(),
            max_age_secs: default_max_age(),
            debounce_secs: default_debounce(),
            aggressive: false,
            include_categories: Vec::new(),
            exclude_categories: Vec::new(),
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            exclude_trackers: Vec::new(),
        }
    }
}

impl ReannounceSettings {
    /// Cooldown between jobs for one hash
    pub fn effective_debounce_secs(&self) -> u64 {
        if self.aggressive {
            self.interval_secs
        } else {
            self.debounce_secs
        }
    }
}

#[derive(Clone)]
pub struct ReannounceSettingsStore {
    db: Database,
}

impl ReannounceSettingsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get settings for an instance, defaults when none stored
    pub fn get(&self, instance_id: i64) -> Result<ReannounceSettings> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT enabled, interval_secs, max_retries, max_age_secs, debounce_secs, aggressive,
                    include_categories, exclude_categories, include_tags, exclude_tags, exclude_trackers
             FROM reannounce_settings WHERE instance_id = ?1",
        )?;

        let mut rows = stmt.query_map([instance_id], |row| {
            Ok(ReannounceSettings {
                enabled: row.get::<_, i32>(0)? != 0,
                interval_secs: row.get::<_, i64>(1)? as u64,
                max_retries: row.get::<_, i64>(2)? as u32,
                max_age_secs: row.get::<_, i64>(3)? as u64,
                debounce_secs: row.get::<_, i64>(4)? as u64,
                aggressive: row.get::<_, i32>(5)? != 0,
                include_categories: split_csv(&row.get::<_, String>(6)?),
                exclude_categories: split_csv(&row.get::<_, String>(7)?),
                include_tags: split_csv(&row.get::<_, String>(8)?),
                exclude_tags: split_csv(&row.get::<_, String>(9)?),
                exclude_trackers: split_csv(&row.get::<_, String>(10)?),
            })
        })?;

        match rows.next() {
            Some(row) => Ok(row?),
            None => Ok(ReannounceSettings::default()),
        }
    }

    /// Upsert settings for an instance
    pub fn put(&self, instance_id: i64, settings: &ReannounceSettings) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO reannounce_settings
                (instance_id, enabled, interval_secs, max_retries, max_age_secs, debounce_secs,
                 aggressive, include_categories, exclude_categories, include_tags, exclude_tags,
                 exclude_trackers)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(instance_id) DO UPDATE SET
                enabled = excluded.enabled,
                interval_secs = excluded.interval_secs,
                max_retries = excluded.max_retries,
                max_age_secs = excluded.max_age_secs,
                debounce_secs = excluded.debounce_secs,
                aggressive = excluded.aggressive,
                include_categories = excluded.include_categories,
                exclude_categories = excluded.exclude_categories,
                include_tags = excluded.include_tags,
                exclude_tags = excluded.exclude_tags,
                exclude_trackers = excluded.exclude_trackers",
            rusqlite::params![
                instance_id,
                settings.enabled as i32,
                settings.interval_secs as i64,
                settings.max_retries as i64,
                settings.max_age_secs as i64,
                settings.debounce_secs as i64,
                settings.aggressive as i32,
                settings.include_categories.join(","),
                settings.exclude_categories.join(","),
                settings.include_tags.join(","),
                settings.exclude_tags.join(","),
                settings.exclude_trackers.join(","),
            ],
        )?;
        Ok(())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::instances::{InstanceInput, InstanceStore};

    #[test]
    fn test_defaults_when_missing() {
        let db = Database::in_memory().unwrap();
        let store = ReannounceSettingsStore::new(db);
        let settings = store.get(1).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.debounce_secs, 120);
        assert_eq!(settings.interval_secs, 7);
    }

    #[test]
    fn test_upsert_roundtrip() {
        let db = Database::in_memory().unwrap();
        let instances = InstanceStore::new(db.clone());
        let instance = instances
            .create(&InstanceInput {
                name: "box".into(),
                base_url: "http://localhost:8080".into(),
                username: None,
                password: None,
                active: true,
                sync_interval_mins: 2,
            })
            .unwrap();

        let store = ReannounceSettingsStore::new(db);
        let mut settings = ReannounceSettings {
            enabled: true,
            aggressive: true,
            exclude_trackers: vec!["example.org".to_string()],
            ..Default::default()
        };
        store.put(instance.id, &settings).unwrap();
        assert_eq!(store.get(instance.id).unwrap(), settings);

        settings.max_retries = 5;
        store.put(instance.id, &settings).unwrap();
        assert_eq!(store.get(instance.id).unwrap().max_retries, 5);
    }

    #[test]
    fn test_aggressive_shrinks_cooldown() {
        let settings = ReannounceSettings {
            interval_secs: 7,
            debounce_secs: 120,
            aggressive: true,
            ..Default::default()
        };
        assert_eq!(settings.effective_debounce_secs(), 7);

        let settings = ReannounceSettings {
            aggressive: false,
            ..settings
        };
        assert_eq!(settings.effective_debounce_secs(), 120);
    }
}
