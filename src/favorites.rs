//! Favorites writer: a single task owns the read-modify-write of the favorites key.
//!
//! Toggles from any frame are queued on one channel and applied in order,
//! so two concurrent clicks can never overwrite each other's update.

use rustc_hash::FxHashSet;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::storage::{Scope, StoreHandle, FAVORITES_KEY};

enum FavoritesCommand {
    Toggle {
        item_id: String,
        reply: oneshot::Sender<Toggled>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Result of one toggle.
#[derive(Debug, Clone)]
pub struct Toggled {
    /// Membership after the toggle
    pub favorite: bool,
    pub favorites: Arc<FxHashSet<String>>,
}

#[derive(Clone)]
pub struct FavoritesHandle {
    tx: mpsc::Sender<FavoritesCommand>,
}

impl FavoritesHandle {
    /// Spawn the writer task.
    pub fn spawn(store: StoreHandle) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(favorites_loop(rx, store));
        Self { tx }
    }

    /// Flip membership of `item_id`; `None` when the writer is gone.
    pub async fn toggle(&self, item_id: &str) -> Option<Toggled> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FavoritesCommand::Toggle {
                item_id: item_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Favorite ids in insertion order.
    pub async fn list(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(FavoritesCommand::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn set(&self) -> Arc<FxHashSet<String>> {
        Arc::new(self.list().await.into_iter().collect())
    }
}

async fn favorites_loop(mut rx: mpsc::Receiver<FavoritesCommand>, store: StoreHandle) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            FavoritesCommand::Toggle { item_id, reply } => {
                let mut list = load(&store).await;
                let favorite = match list.iter().position(|id| *id == item_id) {
                    Some(index) => {
                        list.remove(index);
                        false
                    }
                    None => {
                        list.push(item_id.clone());
                        true
                    }
                };
                store.set(
                    Scope::Local,
                    FAVORITES_KEY,
                    Value::Array(list.iter().cloned().map(Value::String).collect()),
                );
                info!(
                    "[FAVORITES] {} {} ({} total)",
                    if favorite { "⭐ Added" } else { "Removed" },
                    item_id,
                    list.len()
                );
                let _ = reply.send(Toggled {
                    favorite,
                    favorites: Arc::new(list.into_iter().collect()),
                });
            }
            FavoritesCommand::List { reply } => {
                let _ = reply.send(load(&store).await);
            }
        }
    }
}

async fn load(store: &StoreHandle) -> Vec<String> {
    match store.get(Scope::Local, FAVORITES_KEY).await {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(other) => {
            warn!("[FAVORITES] Ignoring malformed favorites record: {}", other);
            Vec::new()
        }
        None => Vec::new(),
    }
}
