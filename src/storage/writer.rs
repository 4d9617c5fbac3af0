//! SQLite-backed key-value store on a dedicated thread fed by an mpsc channel.
//!
//! Writes are fire-and-forget and batched into one transaction per flush.
//! Reads carry a oneshot reply; the writer flushes its pending batch before
//! answering, so a read always observes every write sent before it.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::schema::create_tables;
use super::types::{ListKey, Scope, SETTINGS_KEY};
use crate::types::Settings;

const BATCH_SIZE: usize = 100;
const BATCH_TIMEOUT_MS: u64 = 100;

/// Messages sent to the storage thread.
pub enum StorageMessage {
    Set { scope: Scope, key: String, value: Value },
    Remove { scope: Scope, key: String },
    /// Append to a bounded list, evicting the oldest entries past its cap
    Append { list: ListKey, value: Value },
    ClearList { list: ListKey },
    Get {
        scope: Scope,
        key: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    ReadList {
        list: ListKey,
        reply: oneshot::Sender<Vec<Value>>,
    },
    /// Commit pending writes and acknowledge
    Flush { reply: oneshot::Sender<()> },
    Shutdown,
}

impl StorageMessage {
    fn is_write(&self) -> bool {
        matches!(
            self,
            StorageMessage::Set { .. }
                | StorageMessage::Remove { .. }
                | StorageMessage::Append { .. }
                | StorageMessage::ClearList { .. }
        )
    }
}

/// Cloneable handle to the store.
#[derive(Clone)]
pub struct StoreHandle {
    tx: Sender<StorageMessage>,
}

impl StoreHandle {
    pub fn set(&self, scope: Scope, key: &str, value: Value) {
        let _ = self.tx.send(StorageMessage::Set {
            scope,
            key: key.to_string(),
            value,
        });
    }

    pub fn remove(&self, scope: Scope, key: &str) {
        let _ = self.tx.send(StorageMessage::Remove {
            scope,
            key: key.to_string(),
        });
    }

    pub fn append(&self, list: ListKey, value: Value) {
        let _ = self.tx.send(StorageMessage::Append { list, value });
    }

    pub fn clear_list(&self, list: ListKey) {
        let _ = self.tx.send(StorageMessage::ClearList { list });
    }

    /// Read one key; `None` when absent or the store is gone.
    pub async fn get(&self, scope: Scope, key: &str) -> Option<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorageMessage::Get {
                scope,
                key: key.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Read one key as `T`; unreadable records count as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, scope: Scope, key: &str) -> Option<T> {
        let value = self.get(scope, key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("[STORAGE] Ignoring unreadable {}/{}: {}", scope, key, e);
                None
            }
        }
    }

    /// All entries of a list, oldest first.
    pub async fn read_list(&self, list: ListKey) -> Vec<Value> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StorageMessage::ReadList { list, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Wait until every write sent so far is committed.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StorageMessage::Flush { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(StorageMessage::Shutdown);
    }

    // === Typed records ===

    /// Current settings, defaults filling anything missing.
    pub async fn load_settings(&self) -> Settings {
        Settings::from_stored(self.get(Scope::Sync, SETTINGS_KEY).await)
    }

    pub fn save_settings(&self, settings: &Settings) {
        match serde_json::to_value(settings) {
            Ok(value) => self.set(Scope::Sync, SETTINGS_KEY, value),
            Err(e) => error!("[STORAGE] Failed to encode settings: {}", e),
        }
    }
}

/// Open (or create) the database and spawn the storage thread.
pub fn open_store(db_path: &str) -> Result<StoreHandle> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path))?;
    create_tables(&conn).context("Failed to create tables")?;
    info!("[STORAGE] Database initialized at {}", db_path);

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("r6mh-storage".into())
        .spawn(move || storage_loop(rx, conn))
        .context("Failed to spawn storage thread")?;

    Ok(StoreHandle { tx })
}

/// Main loop running in the storage thread.
fn storage_loop(rx: Receiver<StorageMessage>, conn: Connection) {
    let mut batch: Vec<StorageMessage> = Vec::with_capacity(BATCH_SIZE);
    let batch_timeout = Duration::from_millis(BATCH_TIMEOUT_MS);

    loop {
        match rx.recv_timeout(batch_timeout) {
            Ok(StorageMessage::Shutdown) => {
                flush_batch(&conn, &mut batch);
                info!("[STORAGE] Store shutdown complete");
                break;
            }
            Ok(msg) if msg.is_write() => {
                batch.push(msg);
                if batch.len() >= BATCH_SIZE {
                    flush_batch(&conn, &mut batch);
                }
            }
            Ok(read) => {
                flush_batch(&conn, &mut batch);
                answer(&conn, read);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                flush_batch(&conn, &mut batch);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                flush_batch(&conn, &mut batch);
                info!("[STORAGE] Channel disconnected, store exiting");
                break;
            }
        }
    }
}

fn answer(conn: &Connection, msg: StorageMessage) {
    match msg {
        StorageMessage::Get { scope, key, reply } => {
            let _ = reply.send(read_key(conn, scope, &key));
        }
        StorageMessage::ReadList { list, reply } => {
            let _ = reply.send(read_list(conn, list));
        }
        StorageMessage::Flush { reply } => {
            let _ = reply.send(());
        }
        _ => {}
    }
}

/// Apply a batch of writes in a single transaction.
fn flush_batch(conn: &Connection, batch: &mut Vec<StorageMessage>) {
    if batch.is_empty() {
        return;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => {
            error!("[STORAGE] Failed to start transaction: {}", e);
            batch.clear();
            return;
        }
    };

    let now = chrono::Utc::now().timestamp();
    let mut written = 0;
    let mut evicted = 0;

    for msg in batch.drain(..) {
        let result = match msg {
            StorageMessage::Set { scope, key, value } => tx
                .execute(
                    "INSERT INTO kv (scope, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![scope.as_str(), key, value.to_string(), now],
                )
                .map(|_| ()),
            StorageMessage::Remove { scope, key } => tx
                .execute(
                    "DELETE FROM kv WHERE scope = ?1 AND key = ?2",
                    params![scope.as_str(), key],
                )
                .map(|_| ()),
            StorageMessage::Append { list, value } => {
                append_bounded(&tx, list, &value, now).map(|removed| evicted += removed)
            }
            StorageMessage::ClearList { list } => tx
                .execute(
                    "DELETE FROM kv_lists WHERE scope = ?1 AND key = ?2",
                    params![list.scope.as_str(), list.key],
                )
                .map(|_| ()),
            _ => Ok(()),
        };
        match result {
            Ok(()) => written += 1,
            Err(e) => warn!("[STORAGE] Write failed: {}", e),
        }
    }

    if let Err(e) = tx.commit() {
        error!("[STORAGE] Failed to commit transaction: {}", e);
    } else {
        debug!("[STORAGE] Flushed {} writes ({} list entries evicted)", written, evicted);
    }
}

/// Insert one list entry and drop the oldest past the cap. Returns evicted rows.
fn append_bounded(conn: &Connection, list: ListKey, value: &Value, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO kv_lists (scope, key, value, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![list.scope.as_str(), list.key, value.to_string(), now],
    )?;
    conn.execute(
        "DELETE FROM kv_lists WHERE scope = ?1 AND key = ?2 AND id NOT IN (
            SELECT id FROM kv_lists WHERE scope = ?1 AND key = ?2 ORDER BY id DESC LIMIT ?3
        )",
        params![list.scope.as_str(), list.key, list.cap as i64],
    )
}

fn read_key(conn: &Connection, scope: Scope, key: &str) -> Option<Value> {
    let raw: String = conn
        .query_row(
            "SELECT value FROM kv WHERE scope = ?1 AND key = ?2",
            params![scope.as_str(), key],
            |row| row.get(0),
        )
        .ok()?;
    serde_json::from_str(&raw).ok()
}

fn read_list(conn: &Connection, list: ListKey) -> Vec<Value> {
    let mut stmt = match conn
        .prepare("SELECT value FROM kv_lists WHERE scope = ?1 AND key = ?2 ORDER BY id ASC")
    {
        Ok(s) => s,
        Err(e) => {
            error!("[STORAGE] Failed to read {}: {}", list.key, e);
            return Vec::new();
        }
    };
    let rows = stmt.query_map(params![list.scope.as_str(), list.key], |row| {
        row.get::<_, String>(0)
    });
    match rows {
        Ok(rows) => rows
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect(),
        Err(e) => {
            error!("[STORAGE] Failed to read {}: {}", list.key, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::ANALYTICS_EVENTS;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_observes_prior_writes() {
        let store = open_store(":memory:").unwrap();
        store.set(Scope::Local, "favorites", json!(["a"]));
        assert_eq!(store.get(Scope::Local, "favorites").await, Some(json!(["a"])));
        assert_eq!(store.get(Scope::Sync, "favorites").await, None);

        store.remove(Scope::Local, "favorites");
        assert_eq!(store.get(Scope::Local, "favorites").await, None);
    }

    #[tokio::test]
    async fn test_bounded_list_evicts_oldest() {
        let store = open_store(":memory:").unwrap();
        let list = ListKey { cap: 3, ..ANALYTICS_EVENTS };
        for i in 0..5 {
            store.append(list, json!(i));
        }
        assert_eq!(store.read_list(list).await, vec![json!(2), json!(3), json!(4)]);

        store.clear_list(list);
        assert!(store.read_list(list).await.is_empty());
    }

    #[tokio::test]
    async fn test_settings_round_trip_with_defaults() {
        let store = open_store(":memory:").unwrap();
        assert_eq!(store.load_settings().await, Settings::default());

        store.set(Scope::Sync, SETTINGS_KEY, json!({"enabled": false}));
        let settings = store.load_settings().await;
        assert!(!settings.enabled);
        assert!(settings.analytics_enabled);
    }
}
