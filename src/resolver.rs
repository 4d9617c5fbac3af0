//! Response resolver: find the marketable-items list in an intercepted GraphQL payload.
//!
//! The marketplace backend serves the same list under several response
//! shapes and never tags them with a version, so responses are classified by
//! structure: a fixed priority list of schema paths is tried in order and the
//! first non-empty match wins. Batched GraphQL responses arrive as a
//! top-level array; each element is searched with the same list.
//!
//! Most intercepted responses are unrelated API calls on the same host. No
//! match is the normal outcome for them and yields an empty result.

use serde_json::Value;
use tracing::debug;

use crate::types::{ItemNode, MarketData, MarketItem, ViewerItemState};

/// Known locations of the marketable-items node list, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPath {
    /// `data.game.viewer.meta.marketableItems.nodes`
    GameViewerMeta,
    /// `data.game.marketableItems.nodes`
    Game,
    /// `data.marketableItems.nodes`
    Data,
    /// `marketableItems.nodes`
    Bare,
    /// `data.viewer.meta.marketableItems.nodes`
    ViewerMeta,
    /// `game.viewer.meta.marketableItems.nodes`
    UnwrappedGameViewerMeta,
}

impl SchemaPath {
    pub const PRIORITY: [SchemaPath; 6] = [
        SchemaPath::GameViewerMeta,
        SchemaPath::Game,
        SchemaPath::Data,
        SchemaPath::Bare,
        SchemaPath::ViewerMeta,
        SchemaPath::UnwrappedGameViewerMeta,
    ];

    fn segments(&self) -> &'static [&'static str] {
        match self {
            SchemaPath::GameViewerMeta => &["data", "game", "viewer", "meta", "marketableItems", "nodes"],
            SchemaPath::Game => &["data", "game", "marketableItems", "nodes"],
            SchemaPath::Data => &["data", "marketableItems", "nodes"],
            SchemaPath::Bare => &["marketableItems", "nodes"],
            SchemaPath::ViewerMeta => &["data", "viewer", "meta", "marketableItems", "nodes"],
            SchemaPath::UnwrappedGameViewerMeta => &["game", "viewer", "meta", "marketableItems", "nodes"],
        }
    }

    /// The node list at this path, if present and non-empty
    pub fn extract<'a>(&self, value: &'a Value) -> Option<&'a Vec<Value>> {
        let mut current = value;
        for segment in self.segments() {
            current = current.get(*segment)?;
        }
        current.as_array().filter(|nodes| !nodes.is_empty())
    }
}

impl std::fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments().join("."))
    }
}

/// Where a node list was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathMatch {
    pub path: SchemaPath,
    /// Index into a top-level array, `None` for an object payload
    pub element: Option<usize>,
}

/// Locate the raw node list in a payload.
pub fn resolve_path(payload: &Value) -> Option<(PathMatch, &Vec<Value>)> {
    match payload {
        Value::Array(elements) => elements.iter().enumerate().find_map(|(i, element)| {
            let (path, nodes) = first_path(element)?;
            Some((PathMatch { path, element: Some(i) }, nodes))
        }),
        _ => {
            let (path, nodes) = first_path(payload)?;
            Some((PathMatch { path, element: None }, nodes))
        }
    }
}

fn first_path(value: &Value) -> Option<(SchemaPath, &Vec<Value>)> {
    SchemaPath::PRIORITY
        .iter()
        .find_map(|p| p.extract(value).map(|nodes| (*p, nodes)))
}

/// Resolve a payload into item nodes, in payload order.
pub fn resolve(payload: &Value) -> Vec<ItemNode> {
    let Some((found, nodes)) = resolve_path(payload) else {
        return Vec::new();
    };

    let items: Vec<ItemNode> = nodes.iter().filter_map(parse_node).collect();
    debug!(
        "[RESOLVE] {} via {} (element {:?}): {} nodes, {} usable",
        if items.is_empty() { "empty" } else { "matched" },
        found.path,
        found.element,
        nodes.len(),
        items.len()
    );
    items
}

/// Parse one raw node. Nodes without `item.assetUrl` or `item.itemId` are skipped.
pub fn parse_node(node: &Value) -> Option<ItemNode> {
    let item_value = node.get("item")?;
    item_value.get("assetUrl")?.as_str()?;
    item_value.get("itemId")?.as_str()?;

    let item: MarketItem = serde_json::from_value(item_value.clone()).ok()?;

    let market_data = node
        .get("marketData")
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value::<MarketData>(v.clone()).ok());

    let viewer = item_value
        .get("viewer")
        .and_then(|v| v.get("meta"))
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value::<ViewerItemState>(v.clone()).ok())
        .unwrap_or_default();

    Some(ItemNode {
        item,
        market_data,
        viewer,
    })
}
