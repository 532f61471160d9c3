//! Instance store
//!
//! Durable records for configured qBittorrent endpoints. The runtime
//! components (pool, sync manager, streams, reannounce) treat this store as
//! read-mostly and react to change events by evicting per-instance state.

use anyhow::Result;
use serde::Serialize;
use tokio::sync::broadcast;

use super::Database;
use crate::utils::{decrypt_password, encrypt_password};

/// A configured qBittorrent endpoint
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    pub active: bool,
    /// Minutes between background syncs; 0 disables the timer
    pub sync_interval_mins: u64,
}

/// Change events emitted when the admin layer mutates an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceChange {
    Created(i64),
    Updated(i64),
    Deleted(i64),
}

impl InstanceChange {
    pub fn instance_id(&self) -> i64 {
        match self {
            Self::Created(id) | Self::Updated(id) | Self::Deleted(id) => *id,
        }
    }
}

/// New or updated instance fields, as supplied by the admin API
#[derive(Debug, Clone)]
pub struct InstanceInput {
    pub name: String,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub active: bool,
    pub sync_interval_mins: u64,
}

#[derive(Clone)]
pub struct InstanceStore {
    db: Database,
    changes: broadcast::Sender<InstanceChange>,
}

impl InstanceStore {
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self { db, changes }
    }

    /// Subscribe to instance change events
    pub fn on_change(&self) -> broadcast::Receiver<InstanceChange> {
        self.changes.subscribe()
    }

    /// List all instances
    pub fn list(&self) -> Result<Vec<Instance>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, username, password_encrypted, active, sync_interval_mins
             FROM instances ORDER BY name",
        )?;

        let instances = stmt
            .query_map([], row_to_instance)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(instances)
    }

    /// Get a single instance by id
    pub fn get_by_id(&self, id: i64) -> Result<Option<Instance>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, username, password_encrypted, active, sync_interval_mins
             FROM instances WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map([id], row_to_instance)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Create a new instance and emit a change event
    pub fn create(&self, input: &InstanceInput) -> Result<Instance> {
        let id = {
            let conn = self.db.conn();
            conn.execute(
                "INSERT INTO instances (name, base_url, username, password_encrypted, active, sync_interval_mins)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    input.name,
                    input.base_url.trim_end_matches('/'),
                    input.username,
                    input.password.as_deref().map(encrypt_password),
                    input.active as i32,
                    input.sync_interval_mins as i64,
                ],
            )?;
            conn.last_insert_rowid()
        };

        let _ = self.changes.send(InstanceChange::Created(id));

        Ok(Instance {
            id,
            name: input.name.clone(),
            base_url: input.base_url.trim_end_matches('/').to_string(),
            username: input.username.clone(),
            password: input.password.clone(),
            active: input.active,
            sync_interval_mins: input.sync_interval_mins,
        })
    }

    /// Update an instance; returns false when the id does not exist.
    ///
    /// A `None` password keeps the stored credential.
    pub fn update(&self, id: i64, input: &InstanceInput) -> Result<bool> {
        let rows = {
            let conn = self.db.conn();
            if let Some(ref password) = input.password {
                conn.execute(
                    "UPDATE instances SET name = ?1, base_url = ?2, username = ?3,
                        password_encrypted = ?4, active = ?5, sync_interval_mins = ?6,
                        updated_at = datetime('now')
                     WHERE id = ?7",
                    rusqlite::params![
                        input.name,
                        input.base_url.trim_end_matches('/'),
                        input.username,
                        encrypt_password(password),
                        input.active as i32,
                        input.sync_interval_mins as i64,
                        id,
                    ],
                )?
            } else {
                conn.execute(
                    "UPDATE instances SET name = ?1, base_url = ?2, username = ?3,
                        active = ?4, sync_interval_mins = ?5, updated_at = datetime('now')
                     WHERE id = ?6",
                    rusqlite::params![
                        input.name,
                        input.base_url.trim_end_matches('/'),
                        input.username,
                        input.active as i32,
                        input.sync_interval_mins as i64,
                        id,
                    ],
                )?
            }
        };

        if rows == 0 {
            return Ok(false);
        }

        let _ = self.changes.send(InstanceChange::Updated(id));
        Ok(true)
    }

    /// Delete an instance; returns false when the id does not exist
    pub fn delete(&self, id: i64) -> Result<bool> {
        let rows = {
            let conn = self.db.conn();
            conn.execute("DELETE FROM instances WHERE id = ?1", [id])?
        };

        if rows == 0 {
            return Ok(false);
        }

        let _ = self.changes.send(InstanceChange::Deleted(id));
        Ok(true)
    }
}

fn row_to_instance(row: &rusqlite::Row) -> rusqlite::Result<Instance> {
    let encrypted: Option<String> = row.get(4)?;
    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        username: row.get(3)?,
        password: encrypted.as_deref().and_then(decrypt_password),
        active: row.get::<_, i32>(5)? != 0,
        sync_interval_mins: row.get::<_, i64>(6)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> InstanceInput {
        InstanceInput {
            name: name.to_string(),
            base_url: "http://localhost:8080/".to_string(),
            username: Some("admin".to_string()),
            password: Some("adminadmin".to_string()),
            active: true,
            sync_interval_mins: 2,
        }
    }

    #[test]
    fn test_create_and_fetch_roundtrip() {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db);

        let created = store.create(&input("seedbox")).unwrap();
        assert_eq!(created.base_url, "http://localhost:8080");

        let fetched = store.get_by_id(created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "seedbox");
        assert_eq!(fetched.password, Some("adminadmin".to_string()));
    }

    #[test]
    fn test_update_keeps_password_when_absent() {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db);
        let created = store.create(&input("seedbox")).unwrap();

        let mut updated = input("renamed");
        updated.password = None;
        assert!(store.update(created.id, &updated).unwrap());

        let fetched = store.get_by_id(created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "renamed");
        assert_eq!(fetched.password, Some("adminadmin".to_string()));
    }

    #[test]
    fn test_change_events() {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db);
        let mut rx = store.on_change();

        let created = store.create(&input("seedbox")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), InstanceChange::Created(created.id));

        store.delete(created.id).unwrap();
        assert_eq!(rx.try_recv().unwrap(), InstanceChange::Deleted(created.id));
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let db = Database::in_memory().unwrap();
        let store = InstanceStore::new(db);
        assert!(!store.delete(42).unwrap());
    }
}
