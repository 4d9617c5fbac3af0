//! R6 Market Helper daemon
//!
//! Connects to a Chromium instance started with `--remote-debugging-port`,
//! attaches to Rainbow Six Siege marketplace tabs and overlays sell/buy
//! prices on the item cards of the embedded marketplace frame.
//!
//! ## Flow
//!
//! - **Interception**: marketplace GraphQL responses are read through the
//!   tab's debugging session
//! - **Resolution and caching**: item nodes are located in the payload and
//!   merged into process-wide price and details maps
//! - **Relay**: the cache is pushed into every reachable frame, or relayed
//!   through the page when the frame shares the page's session
//! - **Patching**: item cards get one overlay each, with a favorite toggle

use anyhow::{Context, Result};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use r6_market_helper::analytics::Analytics;
use r6_market_helper::background::Background;
use r6_market_helper::cdp::{discover_ws_url, CdpClient};
use r6_market_helper::config::{settings_overrides, AppConfig, CDP_RECONNECT_DELAY_SECS};
use r6_market_helper::favorites::FavoritesHandle;
use r6_market_helper::storage::{open_store, StoreHandle};
use r6_market_helper::types::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env first so RUST_LOG from it reaches the filter
    dotenvy::dotenv().ok();

    // Initialize logging with both stdout and file output
    let file_appender = tracing_appender::rolling::never(".", "r6-market-helper.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("r6_market_helper=info".parse().context("Invalid log directive")?);

    // Stdout layer
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // File layer
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let config = AppConfig::from_env();

    info!("🚀 R6 Market Helper v{}", env!("CARGO_PKG_VERSION"));
    info!("   DevTools: {}", config.cdp_ws_url.as_deref().unwrap_or(&config.cdp_http_url));
    info!("💾 SQLite storage: {}", config.db_path);

    let store = open_store(&config.db_path)?;
    let stored = store.load_settings().await;
    let analytics = Analytics::new(store.clone(), stored.analytics_enabled);
    let settings = apply_settings_overrides(&store, &analytics, stored);
    analytics.set_enabled(settings.analytics_enabled);
    info!(
        "   Prices: {} | position={} | format={} | export={}",
        if settings.enabled { "on" } else { "off" },
        settings.position,
        settings.format,
        if settings.data_export { settings.export_format.extension() } else { "off" }
    );

    analytics.extension_loaded();
    let favorites = FavoritesHandle::spawn(store.clone());

    let supervisor_store = store.clone();
    let supervisor = tokio::spawn(async move {
        loop {
            if let Err(e) = run(&config, &supervisor_store, &favorites, &analytics).await {
                error!("[CDP] {:#} - reconnecting...", e);
            }
            sleep(Duration::from_secs(CDP_RECONNECT_DELAY_SECS)).await;
        }
    });

    info!("✅ All systems operational - waiting for marketplace tabs");
    tokio::select! {
        _ = supervisor => warn!("Supervisor stopped"),
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    store.flush().await;
    store.shutdown();
    Ok(())
}

/// One DevTools connection, start to finish.
async fn run(
    config: &AppConfig,
    store: &StoreHandle,
    favorites: &FavoritesHandle,
    analytics: &Analytics,
) -> Result<()> {
    let ws_url = match &config.cdp_ws_url {
        Some(url) => url.clone(),
        None => discover_ws_url(&config.cdp_http_url).await?,
    };
    let (cdp, io) = CdpClient::connect(&ws_url).await?;

    let background = Background::new(cdp, store.clone(), favorites.clone(), analytics.clone())?;
    let result = background.run().await;
    io.abort();
    result
}

/// Write `R6MH_*` overrides into the stored settings.
fn apply_settings_overrides(store: &StoreHandle, analytics: &Analytics, mut settings: Settings) -> Settings {
    let overrides = settings_overrides();
    if overrides.is_empty() {
        return settings;
    }

    for (field, value) in overrides {
        match settings.with_field(field, value.clone()) {
            Ok(updated) => {
                info!("   ⚙️  {} = {}", field, value);
                analytics.settings_changed(field, &value);
                settings = updated;
            }
            Err(e) => warn!("   ⚠️ Ignoring {} = {}: {}", field, value, e),
        }
    }
    store.save_settings(&settings);
    settings
}
