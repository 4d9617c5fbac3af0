//! Marketplace history records and their export formats.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{StoreHandle, MARKETPLACE_RECORDS};
use crate::types::{ExportFormat, ItemNode};

/// CSV header, one column per record field
pub const CSV_HEADER: [&str; 22] = [
    "timestamp",
    "item_id",
    "name",
    "type",
    "asset_url",
    "weapon_character",
    "season",
    "rarity",
    "tags",
    "lowest_sell_price",
    "highest_sell_price",
    "sell_active_count",
    "lowest_buy_price",
    "highest_buy_price",
    "buy_active_count",
    "last_sold_price",
    "last_sold_at",
    "is_owned",
    "active_trade_id",
    "active_trade_category",
    "active_trade_price",
    "active_trade_state",
];

/// One observation of one item, flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceRecord {
    pub timestamp: DateTime<Utc>,
    pub item_id: String,
    pub name: String,
    pub item_type: String,
    pub asset_url: String,
    pub weapon_character: Option<String>,
    pub season: Option<String>,
    pub rarity: Option<String>,
    pub tags: Vec<String>,
    pub lowest_sell_price: Option<i64>,
    pub highest_sell_price: Option<i64>,
    pub sell_active_count: Option<i64>,
    pub lowest_buy_price: Option<i64>,
    pub highest_buy_price: Option<i64>,
    pub buy_active_count: Option<i64>,
    pub last_sold_price: Option<i64>,
    pub last_sold_at: Option<String>,
    pub is_owned: bool,
    pub active_trade_id: Option<String>,
    pub active_trade_category: Option<String>,
    pub active_trade_price: Option<i64>,
    pub active_trade_state: Option<String>,
}

impl MarketplaceRecord {
    pub fn from_node(node: &ItemNode, timestamp: DateTime<Utc>) -> Self {
        let item = &node.item;
        let market = node.market_data.clone().unwrap_or_default();
        let sell = market.sell_stats.first();
        let buy = market.buy_stats.first();
        let last = market.last_sale();
        let trade = node.viewer.active_trade.as_ref();

        Self {
            timestamp,
            item_id: item.item_id.clone(),
            name: item.name.clone(),
            item_type: item.item_type.clone(),
            asset_url: item.asset_url.clone(),
            weapon_character: item.weapon_character().map(str::to_string),
            season: item.season().map(str::to_string),
            rarity: item.rarity().map(str::to_string),
            tags: item.tags.clone(),
            lowest_sell_price: sell.and_then(|s| s.lowest_price),
            highest_sell_price: sell.and_then(|s| s.highest_price),
            sell_active_count: sell.and_then(|s| s.active_count),
            lowest_buy_price: buy.and_then(|s| s.lowest_price),
            highest_buy_price: buy.and_then(|s| s.highest_price),
            buy_active_count: buy.and_then(|s| s.active_count),
            last_sold_price: last.and_then(|l| l.price),
            last_sold_at: last.and_then(|l| l.performed_at.clone()),
            is_owned: node.viewer.is_owned,
            active_trade_id: trade.map(|t| t.trade_id.clone()),
            active_trade_category: trade.map(|t| t.category.clone()),
            active_trade_price: trade.and_then(|t| t.price()),
            active_trade_state: trade.map(|t| t.state.clone()),
        }
    }

    fn csv_row(&self) -> [String; 22] {
        let opt_i = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
        let opt_s = |v: &Option<String>| v.clone().unwrap_or_default();
        [
            self.timestamp.to_rfc3339(),
            self.item_id.clone(),
            self.name.clone(),
            self.item_type.clone(),
            self.asset_url.clone(),
            opt_s(&self.weapon_character),
            opt_s(&self.season),
            opt_s(&self.rarity),
            self.tags.join(";"),
            opt_i(self.lowest_sell_price),
            opt_i(self.highest_sell_price),
            opt_i(self.sell_active_count),
            opt_i(self.lowest_buy_price),
            opt_i(self.highest_buy_price),
            opt_i(self.buy_active_count),
            opt_i(self.last_sold_price),
            opt_s(&self.last_sold_at),
            self.is_owned.to_string(),
            opt_s(&self.active_trade_id),
            opt_s(&self.active_trade_category),
            opt_i(self.active_trade_price),
            opt_s(&self.active_trade_state),
        ]
    }
}

/// Append one record per node to the bounded history.
pub fn record_nodes(store: &StoreHandle, nodes: &[ItemNode]) -> usize {
    let now = Utc::now();
    let mut written = 0;
    for node in nodes {
        if let Ok(value) = serde_json::to_value(MarketplaceRecord::from_node(node, now)) {
            store.append(MARKETPLACE_RECORDS, value);
            written += 1;
        }
    }
    written
}

pub async fn load_records(store: &StoreHandle) -> Vec<MarketplaceRecord> {
    store
        .read_list(MARKETPLACE_RECORDS)
        .await
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}

pub fn to_csv(records: &[MarketplaceRecord]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.write_record(record.csv_row())?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to finish CSV: {}", e.error()))?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

pub fn to_json(records: &[MarketplaceRecord]) -> Result<String> {
    serde_json::to_string_pretty(records).context("Failed to encode records")
}

pub fn to_text(records: &[MarketplaceRecord]) -> String {
    let price = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_else(|| "-".into());
    let mut out = format!("R6 Marketplace records ({})\n", records.len());
    for record in records {
        out.push_str(&format!(
            "\n[{}] {} ({})\n  Item: {}\n  Sell: {} | Buy: {} | Last sold: {}\n",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            if record.name.is_empty() { "Unnamed item" } else { &record.name },
            if record.item_type.is_empty() { "unknown type" } else { &record.item_type },
            record.item_id,
            price(record.lowest_sell_price),
            price(record.highest_buy_price),
            price(record.last_sold_price),
        ));
        if let Some(trade) = &record.active_trade_id {
            out.push_str(&format!(
                "  Active {} order {} at {}\n",
                record.active_trade_category.as_deref().unwrap_or("?"),
                trade,
                price(record.active_trade_price),
            ));
        }
    }
    out
}

pub fn render(format: ExportFormat, records: &[MarketplaceRecord]) -> Result<String> {
    match format {
        ExportFormat::Csv => to_csv(records),
        ExportFormat::Json => to_json(records),
        ExportFormat::Txt => Ok(to_text(records)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActiveTrade, MarketData, MarketItem, OrderStats, PaymentOption, ViewerItemState};

    fn sample() -> MarketplaceRecord {
        let node = ItemNode {
            item: MarketItem {
                item_id: "i1".into(),
                asset_url: "https://x/a.png?v=1".into(),
                name: "Glacier, \"Arctic\"".into(),
                item_type: "WeaponSkin".into(),
                tags: vec!["rarity_rare".into(), "Y8S2".into()],
            },
            market_data: Some(MarketData {
                sell_stats: vec![OrderStats {
                    lowest_price: Some(900),
                    highest_price: Some(1500),
                    active_count: Some(4),
                }],
                ..Default::default()
            }),
            viewer: ViewerItemState {
                is_owned: true,
                active_trade: Some(ActiveTrade {
                    trade_id: "t1".into(),
                    category: "Sell".into(),
                    state: "Created".into(),
                    payment_options: vec![PaymentOption { price: Some(950) }],
                }),
            },
        };
        MarketplaceRecord::from_node(&node, Utc::now())
    }

    #[test]
    fn test_record_flattening() {
        let record = sample();
        assert_eq!(record.lowest_sell_price, Some(900));
        assert_eq!(record.sell_active_count, Some(4));
        assert_eq!(record.highest_buy_price, None);
        assert_eq!(record.rarity.as_deref(), Some("rare"));
        assert_eq!(record.season.as_deref(), Some("Y8S2"));
        assert_eq!(record.active_trade_price, Some(950));
    }

    #[test]
    fn test_csv_has_fixed_header_and_quotes_fields() {
        let csv = to_csv(&[sample()]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap().split(',').count(), 22);
        let row = lines.next().unwrap();
        assert!(row.contains("\"Glacier, \"\"Arctic\"\"\""));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_json_and_text() {
        let json = to_json(&[sample()]).unwrap();
        assert!(json.contains("\"itemId\": \"i1\""));

        let text = to_text(&[sample()]);
        assert!(text.contains("Sell: 900 | Buy: - "));
        assert!(text.contains("Active Sell order t1 at 950"));
    }
}
