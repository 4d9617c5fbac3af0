//! System configuration constants and environment parsing.
//!
//! Everything the daemon matches against the marketplace (URLs, frame
//! markers, card selectors) lives here, together with the fixed delays and
//! storage caps. Runtime endpoints come from the environment.

use std::time::Duration;

// === Marketplace matching ===

/// Substring identifying the marketplace GraphQL endpoint whose responses we read
pub const TARGET_API_URL: &str = "public-ubiservices.ubi.com/v1/profiles/me/uplay/graphql";

/// Page URLs that should get a debugging session (the content-script match)
pub const MARKETPLACE_PAGE_MARKERS: &[&str] = &["ubisoft.com", "marketplace"];

/// Host of the embedded marketplace frame
pub const TARGET_FRAME_HOST: &str = "overlay.cdn.ubisoft.com";

/// Application marker carried by the embedded marketplace frame URL
pub const TARGET_FRAME_APP_MARKER: &str = "microApp=marketplace";

/// Custom element whose shadow root hosts the marketplace iframe
pub const FRAME_HOST_ELEMENT: &str = "ubisoft-connect";

/// Item card selectors, most specific first
pub const CARD_SELECTORS: &[&str] = &[
    r#"[data-e2e="secondary-store-grid-item"]"#,
    r#"[role="button"][class*="marketplace"]"#,
    r#"div[class*="marketplace-"][tabindex="0"]"#,
];

/// Selectors that make an inserted node worth a re-patch
pub const MUTATION_CARD_SELECTORS: &[&str] = &[
    r#"[data-e2e="secondary-store-grid-item"]"#,
    r#"[role="button"][class*="marketplace"]"#,
];

/// Card image selectors, most specific first
pub const CARD_IMAGE_SELECTORS: &[&str] = &[
    "img.item-image",
    r#"img[class*="marketplace"]"#,
    "img",
];

/// Class carried by every overlay we insert (idempotence marker)
pub const OVERLAY_CLASS: &str = "r6-market-helper-prices";

/// Name of the page binding invoked by favorite buttons
pub const FAVORITE_BINDING: &str = "r6MarketHelperFavorite";

// === Timing ===

/// One-shot delay before relaying into a tab whose target frame is not loaded yet
pub const RELAY_RETRY_DELAY_MS: u64 = 1000;

/// Body-ready poll interval inside a frame
pub const BODY_POLL_INTERVAL_MS: u64 = 100;

/// Debounce between a relevant DOM mutation and the re-patch
pub const REPATCH_DEBOUNCE_MS: u64 = 500;

/// Embedded-frame discovery: attempts and interval (30s total)
pub const FRAME_DISCOVERY_MAX_ATTEMPTS: u32 = 60;
pub const FRAME_DISCOVERY_INTERVAL_MS: u64 = 500;

/// DevTools command timeout
pub const CDP_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// DevTools ping interval (seconds) - keep connection alive
pub const CDP_PING_INTERVAL_SECS: u64 = 30;

/// Connection considered stale after this long without traffic
pub const CDP_STALE_AFTER_SECS: u64 = 120;

/// Reconnect delay after the DevTools connection drops (seconds)
pub const CDP_RECONNECT_DELAY_SECS: u64 = 5;

/// Heartbeat interval (seconds)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

// === Storage caps ===

/// Analytics events kept locally
pub const ANALYTICS_EVENT_CAP: usize = 1_000;

/// Marketplace records kept locally
pub const MARKETPLACE_RECORD_CAP: usize = 10_000;

/// Version stamped on analytics events
pub const ANALYTICS_VERSION: &str = "1.3.0";

/// Notification durations
pub const NOTIFY_DEFAULT_MS: u64 = 4000;
pub const NOTIFY_ERROR_MS: u64 = 6000;

#[inline]
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Sleep until `deadline`, or forever when there is none. Used as an
/// optional timer arm in `select!` loops.
pub async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runtime configuration from environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// DevTools HTTP endpoint used to discover the browser websocket
    pub cdp_http_url: String,
    /// Explicit browser websocket URL (skips discovery)
    pub cdp_ws_url: Option<String>,
    /// SQLite database path for the persistent store
    pub db_path: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            cdp_http_url: std::env::var("CDP_HTTP_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9222".to_string()),
            cdp_ws_url: std::env::var("CDP_WS_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            db_path: std::env::var("SQLITE_DB_PATH")
                .unwrap_or_else(|_| "r6-market-helper.db".to_string()),
        }
    }
}

/// Log full intercepted payloads (set R6MH_LOG_PAYLOADS=1 to enable)
pub fn log_payloads_enabled() -> bool {
    static CACHED: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *CACHED.get_or_init(|| env_flag("R6MH_LOG_PAYLOADS").unwrap_or(false))
}

/// Parse a boolean env var ("1"/"true"/"0"/"false"), None when unset or unparseable
pub fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Settings overrides from `R6MH_*` variables, as (stored field name, value) pairs
pub fn settings_overrides() -> Vec<(&'static str, serde_json::Value)> {
    let mut overrides = Vec::new();
    for (var, field) in [
        ("R6MH_ENABLED", "enabled"),
        ("R6MH_DATA_EXPORT", "dataExport"),
        ("R6MH_ANALYTICS", "analyticsEnabled"),
    ] {
        if let Some(flag) = env_flag(var) {
            overrides.push((field, serde_json::Value::Bool(flag)));
        }
    }
    for (var, field) in [
        ("R6MH_POSITION", "position"),
        ("R6MH_FORMAT", "format"),
        ("R6MH_EXPORT_FORMAT", "exportFormat"),
    ] {
        if let Ok(raw) = std::env::var(var) {
            let raw = raw.trim().to_lowercase();
            if !raw.is_empty() {
                overrides.push((field, serde_json::Value::String(raw)));
            }
        }
    }
    overrides
}
