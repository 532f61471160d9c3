//! Activity log
//!
//! Records the outcome of background actions (reannounce jobs, bulk
//! mutations) so operators can audit what the service did and why.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityOutcome {
    Success,
    Failed,
    Skipped,
}

impl ActivityOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub instance_id: i64,
    pub hash: String,
    pub torrent_name: String,
    pub action: String,
    pub outcome: ActivityOutcome,
    pub reason: String,
    pub details: Option<serde_json::Value>,
}

/// Stored event, as served by the activity read API
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub id: i64,
    #[serde(flatten)]
    pub event: ActivityEvent,
    pub created_at: String,
}

/// Sink for activity events. The reannounce controller only depends on this
/// seam, which keeps it testable without a database.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record(&self, event: ActivityEvent);
}

#[derive(Clone)]
pub struct SqliteActivityLog {
    db: Database,
}

impl SqliteActivityLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Page through events for one instance, newest first
    pub fn list(&self, instance_id: i64, page: usize, limit: usize) -> Result<Vec<ActivityRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, hash, torrent_name, action, outcome, reason, details, created_at
             FROM activity WHERE instance_id = ?1
             ORDER BY id DESC LIMIT ?2 OFFSET ?3",
        )?;

        let records = stmt
            .query_map(
                rusqlite::params![instance_id, limit as i64, (page * limit) as i64],
                |row| {
                    let outcome: String = row.get(5)?;
                    let details: Option<String> = row.get(7)?;
                    Ok(ActivityRecord {
                        id: row.get(0)?,
                        event: ActivityEvent {
                            instance_id: row.get(1)?,
                            hash: row.get(2)?,
                            torrent_name: row.get(3)?,
                            action: row.get(4)?,
                            outcome: match outcome.as_str() {
                                "success" => ActivityOutcome::Success,
                                "skipped" => ActivityOutcome::Skipped,
                                _ => ActivityOutcome::Failed,
                            },
                            reason: row.get(6)?,
                            details: details.and_then(|d| serde_json::from_str(&d).ok()),
                        },
                        created_at: row.get(8)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn insert(&self, event: &ActivityEvent) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO activity (instance_id, hash, torrent_name, action, outcome, reason, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                event.instance_id,
                event.hash,
                event.torrent_name,
                event.action,
                event.outcome.as_str(),
                event.reason,
                event.details.as_ref().map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ActivitySink for SqliteActivityLog {
    async fn record(&self, event: ActivityEvent) {
        if let Err(e) = self.insert(&event) {
            tracing::error!("Failed to record activity event: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_list() {
        let db = Database::in_memory().unwrap();
        let log = SqliteActivityLog::new(db);

        for i in 0..3 {
            log.record(ActivityEvent {
                instance_id: 1,
                hash: format!("HASH{i}"),
                torrent_name: "ubuntu.iso".to_string(),
                action: "reannounce".to_string(),
                outcome: ActivityOutcome::Success,
                reason: "2 unhealthy trackers".to_string(),
                details: Some(serde_json::json!({"attempts": i})),
            })
            .await;
        }

        let records = log.list(1, 0, 2).unwrap();
        assert_eq!(records.len(), 2);
        // Newest first
        assert_eq!(records[0].event.hash, "HASH2");

        let second_page = log.list(1, 1, 2).unwrap();
        assert_eq!(second_page.len(), 1);

        assert!(log.list(2, 0, 10).unwrap().is_empty());
    }
}
