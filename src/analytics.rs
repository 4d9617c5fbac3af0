//! Local usage analytics. Events never leave the machine.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::ANALYTICS_VERSION;
use crate::storage::{StoreHandle, ANALYTICS_EVENTS};
use crate::types::{PriceFormat, Position};

/// Maximum length of error details kept in an event
const ERROR_DETAILS_MAX: usize = 100;

/// Page routes worth recording a visit for
const TRACKED_PAGES: &[&str] = &["buy", "sell", "browse", "home"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub event: String,
    /// Unix millis
    pub timestamp: i64,
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub version: String,
}

/// Summary over the stored event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsStats {
    pub total_events: usize,
    pub sessions: usize,
    pub extension_usage: BTreeMap<String, usize>,
    pub error_count: usize,
    pub first_used: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

/// `r6mh_<millis>_<random>`
pub fn generate_session_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("r6mh_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

/// Event logger for one daemon lifetime.
#[derive(Clone)]
pub struct Analytics {
    store: StoreHandle,
    session_id: Arc<str>,
    enabled: Arc<AtomicBool>,
}

impl Analytics {
    pub fn new(store: StoreHandle, enabled: bool) -> Self {
        Self {
            store,
            session_id: Arc::from(generate_session_id()),
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn track(&self, event: &str, data: Value) {
        if !self.is_enabled() {
            return;
        }
        let record = AnalyticsEvent {
            event: event.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            session_id: self.session_id.to_string(),
            data,
            version: ANALYTICS_VERSION.to_string(),
        };
        debug!("[ANALYTICS] {} {}", record.event, record.data);
        match serde_json::to_value(&record) {
            Ok(value) => self.store.append(ANALYTICS_EVENTS, value),
            Err(e) => debug!("[ANALYTICS] Failed to encode event: {}", e),
        }
    }

    pub fn extension_loaded(&self) {
        self.track("extension_loaded", json!({}));
    }

    pub fn debugger_attached(&self) {
        self.track("debugger_attached", json!({}));
    }

    pub fn data_received(&self, item_count: usize) {
        self.track("marketplace_data_received", json!({ "itemCount": item_count }));
    }

    pub fn prices_injected(&self, card_count: usize, position: Position, format: PriceFormat) {
        self.track(
            "prices_injected",
            json!({
                "cardCount": card_count,
                "position": position.to_string(),
                "format": format.to_string(),
            }),
        );
    }

    pub fn favorite_toggled(&self, item_id: &str, favorite: bool) {
        self.track("favorite_toggled", json!({ "itemId": item_id, "favorite": favorite }));
    }

    /// Records the setting name and the JSON type of its value, never the value.
    pub fn settings_changed(&self, setting: &str, value: &Value) {
        let kind = match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        };
        self.track("settings_changed", json!({ "setting": setting, "value": kind }));
    }

    pub fn error_occurred(&self, error_type: &str, details: &str) {
        let details: String = details.chars().take(ERROR_DETAILS_MAX).collect();
        self.track("error_occurred", json!({ "errorType": error_type, "details": details }));
    }

    pub fn page_visited(&self, page: &str) {
        let lowered = page.to_lowercase();
        if TRACKED_PAGES.iter().any(|p| lowered.contains(p)) {
            self.track("page_visited", json!({ "page": page }));
        }
    }
}

/// Stored events, oldest first. Unreadable entries are skipped.
pub async fn load_events(store: &StoreHandle) -> Vec<AnalyticsEvent> {
    store
        .read_list(ANALYTICS_EVENTS)
        .await
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}

pub fn clear(store: &StoreHandle) {
    store.clear_list(ANALYTICS_EVENTS);
}

pub fn local_stats(events: &[AnalyticsEvent]) -> AnalyticsStats {
    if events.is_empty() {
        return AnalyticsStats::default();
    }

    let mut usage: BTreeMap<String, usize> = BTreeMap::new();
    let mut error_count = 0;
    for event in events {
        *usage.entry(event.event.clone()).or_default() += 1;
        if event.event.contains("error") {
            error_count += 1;
        }
    }

    let sessions: HashSet<&str> = events.iter().map(|e| e.session_id.as_str()).collect();
    let to_time = |millis: i64| Utc.timestamp_millis_opt(millis).single();

    AnalyticsStats {
        total_events: events.len(),
        sessions: sessions.len(),
        extension_usage: usage,
        error_count,
        first_used: events.iter().map(|e| e.timestamp).min().and_then(to_time),
        last_used: events.iter().map(|e| e.timestamp).max().and_then(to_time),
    }
}
