//! Core type definitions for marketplace items, market data and display settings.
//!
//! Item and market-data shapes mirror the GraphQL payload (camelCase on the
//! wire). Settings mirror the stored record of the options page.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// === Identity ===

/// Derive the visual identity key of an asset URL: everything before the first `?`.
#[inline]
pub fn derive_key(asset_url: &str) -> &str {
    asset_url
        .split_once('?')
        .map_or(asset_url, |(base, _)| base)
}

/// GraphQL sends `null` for absent strings and lists; treat it as the default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// === Items ===

/// A tradeable item exposed by the marketplace API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketItem {
    pub item_id: String,
    pub asset_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, rename = "type", deserialize_with = "null_as_default")]
    pub item_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
}

impl MarketItem {
    /// Stripped asset URL, the key of the price cache
    pub fn key(&self) -> &str {
        derive_key(&self.asset_url)
    }

    /// Operator or weapon the item belongs to, if tagged
    pub fn weapon_character(&self) -> Option<&str> {
        tag_value(&self.tags, &["character", "operator", "weapon"])
    }

    pub fn season(&self) -> Option<&str> {
        tag_value(&self.tags, &["season"]).or_else(|| {
            self.tags
                .iter()
                .map(String::as_str)
                .find(|t| looks_like_season(t))
        })
    }

    pub fn rarity(&self) -> Option<&str> {
        tag_value(&self.tags, &["rarity"])
    }
}

/// Find the first tag of the form `<prefix>_<value>` or `<prefix>.<value>`
/// (prefix matched case-insensitively) and return `<value>`.
fn tag_value<'a>(tags: &'a [String], prefixes: &[&str]) -> Option<&'a str> {
    tags.iter().find_map(|tag| {
        let (head, value) = tag.split_once(['_', '.'])?;
        let matched = prefixes.iter().any(|p| head.eq_ignore_ascii_case(p));
        (matched && !value.is_empty()).then_some(value)
    })
}

/// Season codes look like `Y8S2`.
fn looks_like_season(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    bytes.len() >= 4
        && bytes[0].eq_ignore_ascii_case(&b'y')
        && bytes[1].is_ascii_digit()
        && tag[1..].contains(['S', 's'])
        && bytes[bytes.len() - 1].is_ascii_digit()
}

// === Market data ===

/// Aggregate order-book statistics for one side of the book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    #[serde(default)]
    pub lowest_price: Option<i64>,
    #[serde(default)]
    pub highest_price: Option<i64>,
    #[serde(default)]
    pub active_count: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSale {
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub performed_at: Option<String>,
}

/// Buy/sell statistics for one item at observation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub sell_stats: Vec<OrderStats>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub buy_stats: Vec<OrderStats>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_sold_at: Vec<LastSale>,
}

impl MarketData {
    /// Cheapest sell order
    pub fn lowest_sell(&self) -> Option<i64> {
        self.sell_stats.first().and_then(|s| s.lowest_price)
    }

    /// Best buy order
    pub fn highest_buy(&self) -> Option<i64> {
        self.buy_stats.first().and_then(|s| s.highest_price)
    }

    pub fn last_sale(&self) -> Option<&LastSale> {
        self.last_sold_at.first()
    }

    /// True when there is anything worth rendering on a card
    pub fn has_prices(&self) -> bool {
        self.lowest_sell().is_some() || self.highest_buy().is_some()
    }
}

// === Viewer state ===

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOption {
    #[serde(default)]
    pub price: Option<i64>,
}

/// An order the viewer currently has open for the item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTrade {
    #[serde(default, deserialize_with = "null_as_default")]
    pub trade_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub state: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payment_options: Vec<PaymentOption>,
}

impl ActiveTrade {
    pub fn price(&self) -> Option<i64> {
        self.payment_options.first().and_then(|p| p.price)
    }
}

/// Viewer-specific fields (`item.viewer.meta`), only used for history records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerItemState {
    #[serde(default)]
    pub is_owned: bool,
    #[serde(default)]
    pub active_trade: Option<ActiveTrade>,
}

/// One resolved marketable-items node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemNode {
    pub item: MarketItem,
    pub market_data: Option<MarketData>,
    pub viewer: ViewerItemState,
}

/// Price-cache value: the latest market data and the item it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceCacheEntry {
    pub market_data: MarketData,
    pub item_id: String,
}

// === Settings ===

/// Corner of the card the overlay is pinned to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    TopLeft,
    #[default]
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Position {
    /// CSS offsets for an absolutely positioned overlay
    pub fn css(&self) -> &'static str {
        match self {
            Position::TopLeft => "top: 8px; left: 8px;",
            Position::TopRight => "top: 8px; right: 8px;",
            Position::BottomLeft => "bottom: 8px; left: 8px;",
            Position::BottomRight => "bottom: 8px; right: 8px;",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::TopLeft => write!(f, "top-left"),
            Position::TopRight => write!(f, "top-right"),
            Position::BottomLeft => write!(f, "bottom-left"),
            Position::BottomRight => write!(f, "bottom-right"),
        }
    }
}

/// How prices are labelled in the overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceFormat {
    #[default]
    Full,
    Short,
    Icons,
}

impl PriceFormat {
    pub fn sell_text(&self, price: i64) -> String {
        match self {
            PriceFormat::Full => format!("Sell now: {}", price),
            PriceFormat::Short => format!("Sell: {}", price),
            PriceFormat::Icons => format!("🔻 {}", price),
        }
    }

    pub fn buy_text(&self, price: i64) -> String {
        match self {
            PriceFormat::Full => format!("Buy now: {}", price),
            PriceFormat::Short => format!("Buy: {}", price),
            PriceFormat::Icons => format!("🔺 {}", price),
        }
    }
}

impl fmt::Display for PriceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceFormat::Full => write!(f, "full"),
            PriceFormat::Short => write!(f, "short"),
            PriceFormat::Icons => write!(f, "icons"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
    Txt,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
        }
    }
}

/// User display settings (synchronized scope, single record, last-write-wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    pub position: Position,
    pub format: PriceFormat,
    pub data_export: bool,
    pub export_format: ExportFormat,
    pub analytics_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            position: Position::TopRight,
            format: PriceFormat::Full,
            data_export: false,
            export_format: ExportFormat::Csv,
            analytics_enabled: true,
        }
    }
}

impl Settings {
    /// Parse a stored record, falling back to defaults for anything unreadable
    pub fn from_stored(value: Option<serde_json::Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Copy with one field replaced, addressed by its stored (camelCase) name.
    pub fn with_field(&self, field: &str, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut record = serde_json::to_value(self)?;
        record[field] = value;
        serde_json::from_value(record)
    }
}

// =============================================================================
// TESTS
// =============================================================================
