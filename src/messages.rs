//! Typed envelopes exchanged between the background hub, tab agents and frame agents.
//!
//! Each hop is an mpsc channel; the envelope type says what the receiver
//! may do with it. Payloads are shared (`Arc`) because one intercepted
//! response fans out to several frames.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::cache::CacheSnapshot;
use crate::cdp::TargetId;
use crate::config::{NOTIFY_DEFAULT_MS, NOTIFY_ERROR_MS};
use crate::types::{MarketItem, Settings};

/// A marketplace page wants a debugging session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub tab_id: TargetId,
    pub url: String,
}

/// A parsed GraphQL response observed in a tab (background to page).
#[derive(Debug, Clone)]
pub struct GraphqlDataEvent {
    pub data: Arc<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Success => write!(f, "success"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A toast for the top-level page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowNotification {
    pub message: String,
    pub severity: Severity,
    pub duration_ms: u64,
}

impl ShowNotification {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        let duration_ms = match severity {
            Severity::Error => NOTIFY_ERROR_MS,
            _ => NOTIFY_DEFAULT_MS,
        };
        Self {
            message: message.into(),
            severity,
            duration_ms,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Info)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetItemDetailsRequest {
    pub item_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemDetailsResponse {
    pub details: Vec<MarketItem>,
}

/// Raw payload forwarded from the page into the embedded frame.
#[derive(Debug, Clone)]
pub struct MarketDataUpdate {
    pub data: Arc<Value>,
}

/// Everything a frame needs to render: the whole cache, settings and favorites.
#[derive(Debug, Clone)]
pub struct RenderPayload {
    pub snapshot: CacheSnapshot,
    pub settings: Settings,
    pub favorites: Arc<FxHashSet<String>>,
}

/// DOM change reported by the frame's session.
#[derive(Debug, Clone)]
pub enum DomMutation {
    /// `DOM.childNodeInserted` with the inserted node
    Inserted(Value),
    /// `DOM.documentUpdated`
    DocumentUpdated,
}

/// Inbox of a tab agent (top-level page).
#[derive(Debug, Clone)]
pub enum PageMessage {
    GraphqlData(GraphqlDataEvent),
    Notify(ShowNotification),
    /// The top-level document navigated
    Navigated(String),
}

/// Inbox of a frame agent.
#[derive(Debug, Clone)]
pub enum FrameMessage {
    /// Direct injection from the relay stage
    Render(RenderPayload),
    /// Raw payload relayed through the page
    MarketDataUpdate(MarketDataUpdate),
    /// Favorites changed somewhere
    Favorites(Arc<FxHashSet<String>>),
    Mutation(DomMutation),
    /// The frame navigated to a new URL
    Navigated(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_durations() {
        assert_eq!(ShowNotification::info("x").duration_ms, 4000);
        assert_eq!(ShowNotification::error("x").duration_ms, 6000);
        assert_eq!(ShowNotification::new("x", Severity::Warning).duration_ms, 4000);
    }

    #[test]
    fn test_notification_wire_shape() {
        let value = serde_json::to_value(ShowNotification::error("boom")).unwrap();
        assert_eq!(value["severity"], "error");
        assert_eq!(value["durationMs"], 6000);
        assert_eq!(value["message"], "boom");
    }
}
