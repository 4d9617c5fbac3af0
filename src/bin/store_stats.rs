//! Print favorites, settings and local analytics statistics.
//!
//! Usage: cargo run --bin store_stats [-- --clear-analytics]

use anyhow::Result;
use chrono::{DateTime, Utc};

use r6_market_helper::analytics::{clear, load_events, local_stats};
use r6_market_helper::config::AppConfig;
use r6_market_helper::favorites::FavoritesHandle;
use r6_market_helper::storage::open_store;

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();
    let store = open_store(&config.db_path)?;

    let settings = store.load_settings().await;
    println!("⚙️  Settings");
    println!("   {}", serde_json::to_string(&settings)?);

    let favorites = FavoritesHandle::spawn(store.clone()).list().await;
    println!("\n⭐ Favorites ({})", favorites.len());
    for item_id in &favorites {
        println!("   {}", item_id);
    }

    let events = load_events(&store).await;
    let stats = local_stats(&events);
    println!("\n📊 Analytics");
    println!("   Events:     {}", stats.total_events);
    println!("   Sessions:   {}", stats.sessions);
    println!("   Errors:     {}", stats.error_count);
    println!("   First used: {}", format_time(stats.first_used));
    println!("   Last used:  {}", format_time(stats.last_used));
    for (event, count) in &stats.extension_usage {
        println!("   {:<28} {}", event, count);
    }

    if std::env::args().any(|a| a == "--clear-analytics") {
        clear(&store);
        store.flush().await;
        println!("\n🧹 Analytics log cleared");
    }

    store.shutdown();
    Ok(())
}
