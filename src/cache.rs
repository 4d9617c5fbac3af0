//! Process-wide price and item-details caches.
//!
//! Both maps are keyed from the same node: the price map by the stripped
//! asset URL, the details map by item id. Entries are overwritten on every
//! observation and never evicted; the whole cache lives as long as the
//! DevTools connection that filled it.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{derive_key, ItemNode, MarketItem, PriceCacheEntry};

pub type PriceMap = FxHashMap<String, PriceCacheEntry>;
pub type DetailsMap = FxHashMap<String, MarketItem>;

/// The process-wide cache; merges happen under the write lock.
pub type SharedCache = Arc<RwLock<MarketCache>>;

/// Result of folding one batch into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Nodes applied to the maps
    pub merged: usize,
    /// Price keys that did not exist before this batch (instrumentation only)
    pub new_key_count: usize,
}

/// Price-by-visual-identity and details-by-id maps.
#[derive(Debug, Default, Clone)]
pub struct MarketCache {
    prices: PriceMap,
    details: DetailsMap,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch of nodes into both maps, last observation wins.
    ///
    /// Nodes without market data still refresh the details map but leave the
    /// price entry untouched, since there is nothing to render for them.
    pub fn merge(&mut self, nodes: &[ItemNode]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for node in nodes {
            let item = &node.item;
            self.details.insert(item.item_id.clone(), item.clone());

            if let Some(market_data) = &node.market_data {
                let key = derive_key(&item.asset_url).to_string();
                let entry = PriceCacheEntry {
                    market_data: market_data.clone(),
                    item_id: item.item_id.clone(),
                };
                if self.prices.insert(key, entry).is_none() {
                    outcome.new_key_count += 1;
                }
            }
            outcome.merged += 1;
        }
        outcome
    }

    pub fn prices(&self) -> &PriceMap {
        &self.prices
    }

    pub fn details(&self) -> &DetailsMap {
        &self.details
    }

    pub fn price_count(&self) -> usize {
        self.prices.len()
    }

    pub fn detail_count(&self) -> usize {
        self.details.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty() && self.details.is_empty()
    }

    /// Look up cached details for the requested ids, in request order.
    /// Unknown ids are omitted.
    pub fn item_details(&self, item_ids: &[String]) -> Vec<MarketItem> {
        item_ids
            .iter()
            .filter_map(|id| self.details.get(id).cloned())
            .collect()
    }

    /// Rebuild a mutable cache from a relayed snapshot.
    pub fn from_snapshot(snapshot: &CacheSnapshot) -> Self {
        Self {
            prices: snapshot.prices.as_ref().clone(),
            details: snapshot.details.as_ref().clone(),
        }
    }

    /// Immutable copy of both maps for relaying into frames
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            prices: Arc::new(self.prices.clone()),
            details: Arc::new(self.details.clone()),
        }
    }
}

/// Shared read-only view of the cache at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub prices: Arc<PriceMap>,
    pub details: Arc<DetailsMap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketData, OrderStats, ViewerItemState};

    fn node(id: &str, url: &str, sell: Option<i64>) -> ItemNode {
        ItemNode {
            item: MarketItem {
                item_id: id.into(),
                asset_url: url.into(),
                name: format!("Item {}", id),
                item_type: "WeaponSkin".into(),
                tags: vec![],
            },
            market_data: sell.map(|p| MarketData {
                sell_stats: vec![OrderStats {
                    lowest_price: Some(p),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            viewer: ViewerItemState::default(),
        }
    }

    #[test]
    fn test_merge_keys_by_stripped_url() {
        let mut cache = MarketCache::new();
        let outcome = cache.merge(&[node("i1", "https://x/a.png?v=2", Some(900))]);
        assert_eq!(outcome.new_key_count, 1);
        let entry = cache.prices().get("https://x/a.png").unwrap();
        assert_eq!(entry.item_id, "i1");
        assert_eq!(entry.market_data.lowest_sell(), Some(900));
        assert!(cache.details().contains_key("i1"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let batch = vec![
            node("i1", "https://x/a.png?v=1", Some(1)),
            node("i2", "https://x/b.png", Some(2)),
        ];
        let mut once = MarketCache::new();
        once.merge(&batch);

        let mut twice = MarketCache::new();
        twice.merge(&batch);
        let second = twice.merge(&batch);

        assert_eq!(second.new_key_count, 0);
        assert_eq!(once.prices(), twice.prices());
        assert_eq!(once.details(), twice.details());
    }

    #[test]
    fn test_last_observation_wins() {
        let mut cache = MarketCache::new();
        cache.merge(&[node("i1", "https://x/a.png?v=1", Some(100))]);
        cache.merge(&[node("i1", "https://x/a.png?v=2", Some(250))]);
        assert_eq!(cache.price_count(), 1);
        assert_eq!(
            cache.prices()["https://x/a.png"].market_data.lowest_sell(),
            Some(250)
        );
    }

    #[test]
    fn test_nodes_without_market_data_only_refresh_details() {
        let mut cache = MarketCache::new();
        cache.merge(&[node("i1", "https://x/a.png", Some(100))]);
        let outcome = cache.merge(&[node("i1", "https://x/a.png", None)]);
        assert_eq!(outcome.new_key_count, 0);
        assert_eq!(outcome.merged, 1);
        assert_eq!(
            cache.prices()["https://x/a.png"].market_data.lowest_sell(),
            Some(100)
        );
    }

    #[test]
    fn test_item_details_in_request_order() {
        let mut cache = MarketCache::new();
        cache.merge(&[
            node("a", "https://x/a.png", None),
            node("b", "https://x/b.png", None),
        ]);
        let ids = vec!["b".to_string(), "missing".to_string(), "a".to_string()];
        let found: Vec<String> = cache
            .item_details(&ids)
            .into_iter()
            .map(|i| i.item_id)
            .collect();
        assert_eq!(found, vec!["b", "a"]);
    }
}
