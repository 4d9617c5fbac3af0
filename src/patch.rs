//! DOM patch planning: which cards get which overlay.
//!
//! Planning is pure. It takes a document snapshot, the price map and the
//! display settings and returns the overlays to insert. Cards that already
//! carry an overlay are skipped, so planning twice over an unchanged
//! document never yields a second overlay for the same card.

use rustc_hash::FxHashSet;
use std::fmt;

use crate::cache::{DetailsMap, PriceMap};
use crate::config::{
    CARD_IMAGE_SELECTORS, CARD_SELECTORS, MUTATION_CARD_SELECTORS, OVERLAY_CLASS,
    TARGET_FRAME_APP_MARKER, TARGET_FRAME_HOST,
};
use crate::dom::{DomNode, Selector, SelectorError};
use crate::types::{derive_key, MarketData, PriceCacheEntry, Settings};

/// Lifecycle of the patch routine inside one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Uninitialized,
    /// Document exists but `<body>` is not attached yet; polled
    WaitingForBody,
    Active,
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameState::Uninitialized => write!(f, "uninitialized"),
            FrameState::WaitingForBody => write!(f, "waiting-for-body"),
            FrameState::Active => write!(f, "active"),
        }
    }
}

/// Only the embedded marketplace application gets patched.
pub fn is_target_frame(url: &str) -> bool {
    url.contains(TARGET_FRAME_HOST) && url.contains(TARGET_FRAME_APP_MARKER)
}

/// Parsed selectors used by the planner and the mutation filter.
#[derive(Debug, Clone)]
pub struct PatchRules {
    cards: Vec<Selector>,
    images: Vec<Selector>,
    marker: Selector,
    mutation: Vec<Selector>,
}

impl PatchRules {
    /// The marketplace rules from `config`.
    pub fn marketplace() -> Result<Self, SelectorError> {
        let parse_all = |sources: &[&str]| -> Result<Vec<Selector>, SelectorError> {
            sources.iter().map(|s| Selector::parse(s)).collect()
        };
        Ok(Self {
            cards: parse_all(CARD_SELECTORS)?,
            images: parse_all(CARD_IMAGE_SELECTORS)?,
            marker: Selector::parse(&format!(".{}", OVERLAY_CLASS))?,
            mutation: parse_all(MUTATION_CARD_SELECTORS)?,
        })
    }

    /// Cards of the first strategy that finds any.
    pub fn find_cards<'a>(&self, document: &'a DomNode) -> Vec<&'a DomNode> {
        self.cards
            .iter()
            .map(|selector| document.query_all(selector))
            .find(|cards| !cards.is_empty())
            .unwrap_or_default()
    }

    pub fn is_patched(&self, card: &DomNode) -> bool {
        card.query_first(&self.marker).is_some()
    }

    /// `src` of the card image, by image-selector priority
    pub fn card_image_url<'a>(&self, card: &'a DomNode) -> Option<&'a str> {
        self.images
            .iter()
            .find_map(|selector| card.query_first(selector))
            .and_then(|img| img.attr("src"))
    }

    /// An inserted node is worth a re-patch when it is, or contains, a card.
    pub fn mutation_is_relevant(&self, node: &DomNode) -> bool {
        node.is_element() && self.mutation.iter().any(|s| s.matches_or_contains(node))
    }
}

/// Price entry for a card image: exact key first, then containment either way.
pub fn lookup_price<'a>(prices: &'a PriceMap, image_url: &str) -> Option<&'a PriceCacheEntry> {
    let key = derive_key(image_url);
    if key.is_empty() {
        return None;
    }
    if let Some(entry) = prices.get(key) {
        return Some(entry);
    }
    prices
        .iter()
        .find(|(api_key, _)| !api_key.is_empty() && (key.contains(api_key.as_str()) || api_key.contains(key)))
        .map(|(_, entry)| entry)
}

/// One overlay to insert into one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPatch {
    pub card_node_id: i64,
    pub backend_node_id: i64,
    pub item_id: String,
    pub html: String,
}

/// Outcome of planning over one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    pub cards_found: usize,
    pub already_patched: usize,
    pub unmatched: usize,
    pub patches: Vec<OverlayPatch>,
}

/// Plan overlays for every unpatched card whose image resolves to a price.
pub fn plan_patch(
    rules: &PatchRules,
    document: &DomNode,
    prices: &PriceMap,
    details: &DetailsMap,
    favorites: &FxHashSet<String>,
    settings: &Settings,
) -> PatchPlan {
    let cards = rules.find_cards(document);
    let mut plan = PatchPlan {
        cards_found: cards.len(),
        ..Default::default()
    };

    for card in cards {
        if rules.is_patched(card) {
            plan.already_patched += 1;
            continue;
        }
        let Some(entry) = rules
            .card_image_url(card)
            .and_then(|url| lookup_price(prices, url))
        else {
            plan.unmatched += 1;
            continue;
        };
        if !entry.market_data.has_prices() {
            plan.unmatched += 1;
            continue;
        }

        let item_id = entry.item_id.as_str();
        let name = details.get(item_id).map(|item| item.name.as_str());
        plan.patches.push(OverlayPatch {
            card_node_id: card.node_id,
            backend_node_id: card.backend_node_id,
            item_id: item_id.to_string(),
            html: render_overlay(
                &entry.market_data,
                item_id,
                name,
                favorites.contains(item_id),
                settings,
            ),
        });
    }
    plan
}

// === Rendering ===

const OVERLAY_STYLE: &str = "position: absolute; z-index: 1000; background: rgba(0, 0, 0, 0.85); \
padding: 6px 8px; border-radius: 4px; font-size: 11px; font-family: \"Ubisoft Sans\", Arial, sans-serif; \
color: white; backdrop-filter: blur(4px); border: 1px solid rgba(255, 255, 255, 0.2); \
box-shadow: 0 2px 8px rgba(0, 0, 0, 0.3);";

const SELL_STYLE: &str = "color: #ff6b6b; margin-bottom: 2px; font-weight: 600;";
const BUY_STYLE: &str = "color: #51cf66; font-weight: 600;";
const FAVORITE_STYLE: &str = "background: none; border: none; padding: 0; margin-top: 2px; \
cursor: pointer; font-size: 13px; line-height: 1;";

/// Overlay markup for one card.
pub fn render_overlay(
    market_data: &MarketData,
    item_id: &str,
    name: Option<&str>,
    is_favorite: bool,
    settings: &Settings,
) -> String {
    let mut html = format!(
        "<div class=\"{}\" style=\"{} {}\"",
        OVERLAY_CLASS,
        OVERLAY_STYLE,
        settings.position.css()
    );
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        html.push_str(&format!(" title=\"{}\"", escape_html(name)));
    }
    html.push('>');

    if let Some(price) = market_data.lowest_sell() {
        html.push_str(&format!(
            "<div style=\"{}\">{}</div>",
            SELL_STYLE,
            escape_html(&settings.format.sell_text(price))
        ));
    }
    if let Some(price) = market_data.highest_buy() {
        html.push_str(&format!(
            "<div style=\"{}\">{}</div>",
            BUY_STYLE,
            escape_html(&settings.format.buy_text(price))
        ));
    }
    if !item_id.is_empty() {
        html.push_str(&format!(
            "<button type=\"button\" data-r6-favorite=\"{}\" aria-pressed=\"{}\" style=\"{} color: {};\">{}</button>",
            escape_html(item_id),
            is_favorite,
            FAVORITE_STYLE,
            if is_favorite { "#ffd43b" } else { "#adb5bd" },
            if is_favorite { "★" } else { "☆" }
        ));
    }
    html.push_str("</div>");
    html
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStats, Position, PriceFormat};

    fn entry(item_id: &str, sell: Option<i64>, buy: Option<i64>) -> PriceCacheEntry {
        PriceCacheEntry {
            market_data: MarketData {
                sell_stats: vec![OrderStats {
                    lowest_price: sell,
                    ..Default::default()
                }],
                buy_stats: vec![OrderStats {
                    highest_price: buy,
                    ..Default::default()
                }],
                ..Default::default()
            },
            item_id: item_id.to_string(),
        }
    }

    fn card(src: &str) -> DomNode {
        DomNode::element("div")
            .with_attr("data-e2e", "secondary-store-grid-item")
            .with_child(DomNode::element("img").with_attr("src", src))
    }

    fn page(cards: Vec<DomNode>) -> DomNode {
        DomNode::document(
            "https://overlay.cdn.ubisoft.com/?microApp=marketplace",
            vec![DomNode::element("html").with_child(DomNode::element("body").with_children(cards))],
        )
    }

    #[test]
    fn test_target_frame_needs_both_markers() {
        assert!(is_target_frame("https://overlay.cdn.ubisoft.com/app?microApp=marketplace&x=1"));
        assert!(!is_target_frame("https://overlay.cdn.ubisoft.com/app?microApp=store"));
        assert!(!is_target_frame("https://www.ubisoft.com/?microApp=marketplace"));
    }

    #[test]
    fn test_lookup_exact_then_substring() {
        let mut prices = PriceMap::default();
        prices.insert("https://x/a.png".into(), entry("a", Some(1), None));
        prices.insert("https://cdn/items/b.png".into(), entry("b", Some(2), None));

        assert_eq!(lookup_price(&prices, "https://x/a.png?v=9").unwrap().item_id, "a");
        assert_eq!(
            lookup_price(&prices, "https://cdn/items/b.png/thumb").unwrap().item_id,
            "b"
        );
        assert_eq!(lookup_price(&prices, "items/b.png").unwrap().item_id, "b");
        assert!(lookup_price(&prices, "https://y/c.png").is_none());
        assert!(lookup_price(&prices, "").is_none());
        assert!(lookup_price(&prices, "?v=1").is_none());
    }

    #[test]
    fn test_card_strategy_priority() {
        let rules = PatchRules::marketplace().unwrap();
        let doc = page(vec![
            DomNode::element("div")
                .with_attr("class", "marketplace-card")
                .with_attr("tabindex", "0"),
            DomNode::element("div")
                .with_attr("role", "button")
                .with_attr("class", "marketplace-tile"),
        ]);
        let cards = rules.find_cards(&doc);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].attr("role"), Some("button"));
    }

    #[test]
    fn test_image_selector_priority() {
        let rules = PatchRules::marketplace().unwrap();
        let node = DomNode::element("div").with_children(vec![
            DomNode::element("img").with_attr("src", "generic"),
            DomNode::element("img")
                .with_attr("class", "item-image")
                .with_attr("src", "specific"),
        ]);
        assert_eq!(rules.card_image_url(&node), Some("specific"));
    }

    #[test]
    fn test_plan_skips_patched_and_priceless_cards() {
        let rules = PatchRules::marketplace().unwrap();
        let mut prices = PriceMap::default();
        prices.insert("https://x/a.png".into(), entry("a", Some(900), Some(1000)));
        prices.insert("https://x/b.png".into(), entry("b", None, None));

        let patched = card("https://x/a.png")
            .with_child(DomNode::element("div").with_attr("class", OVERLAY_CLASS));
        let doc = page(vec![
            card("https://x/a.png?v=9"),
            patched,
            card("https://x/b.png"),
            card("https://x/unknown.png"),
        ]);

        let plan = plan_patch(
            &rules,
            &doc,
            &prices,
            &DetailsMap::default(),
            &FxHashSet::default(),
            &Settings::default(),
        );
        assert_eq!(plan.cards_found, 4);
        assert_eq!(plan.already_patched, 1);
        assert_eq!(plan.unmatched, 2);
        assert_eq!(plan.patches.len(), 1);
        assert_eq!(plan.patches[0].item_id, "a");
    }

    #[test]
    fn test_render_respects_settings_and_favorites() {
        let settings = Settings {
            position: Position::BottomLeft,
            format: PriceFormat::Short,
            ..Default::default()
        };
        let data = entry("a", Some(900), Some(1000)).market_data;
        let html = render_overlay(&data, "a", Some("Black Ice <R4-C>"), true, &settings);
        assert!(html.contains(OVERLAY_CLASS));
        assert!(html.contains("bottom: 8px; left: 8px;"));
        assert!(html.contains("Sell: 900"));
        assert!(html.contains("Buy: 1000"));
        assert!(html.contains("data-r6-favorite=\"a\""));
        assert!(html.contains("aria-pressed=\"true\""));
        assert!(html.contains("title=\"Black Ice &lt;R4-C&gt;\""));

        let no_toggle = render_overlay(&data, "", None, false, &settings);
        assert!(!no_toggle.contains("data-r6-favorite"));
    }

    #[test]
    fn test_mutation_filter() {
        let rules = PatchRules::marketplace().unwrap();
        let grid = DomNode::element("section").with_child(card("x"));
        assert!(rules.mutation_is_relevant(&grid));
        assert!(rules.mutation_is_relevant(&card("x")));

        let overlay = DomNode::element("div").with_attr("class", OVERLAY_CLASS);
        assert!(!rules.mutation_is_relevant(&overlay));

        let tabindex_card = DomNode::element("div")
            .with_attr("class", "marketplace-card")
            .with_attr("tabindex", "0");
        assert!(!rules.mutation_is_relevant(&tabindex_card));
    }
}
