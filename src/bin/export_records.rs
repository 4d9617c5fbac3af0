//! Export the recorded marketplace history in the configured format.
//!
//! Usage: cargo run --bin export_records [-- <output path>]
//!
//! Records are only collected while `dataExport` is on (`R6MH_DATA_EXPORT=1`).

use anyhow::{Context, Result};

use r6_market_helper::config::AppConfig;
use r6_market_helper::export::{load_records, render};
use r6_market_helper::storage::open_store;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    let store = open_store(&config.db_path)?;
    let settings = store.load_settings().await;
    let records = load_records(&store).await;
    store.shutdown();

    if records.is_empty() {
        println!("No marketplace records in {} (is dataExport enabled?)", config.db_path);
        return Ok(());
    }

    let format = settings.export_format;
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("r6-market-records.{}", format.extension()));

    let body = render(format, &records)?;
    std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path))?;

    println!("📄 Exported {} records as {} to {}", records.len(), format.extension(), path);
    Ok(())
}
