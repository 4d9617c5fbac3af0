//! DOM snapshots as returned by `DOM.getDocument` and a compound-selector matcher.
//!
//! The patch planner never talks to the browser: it walks a snapshot of the
//! frame's document and decides what to insert. Only the selector forms the
//! marketplace rules need are supported: an optional tag followed by any
//! number of `.class`, `[attr]`, `[attr="v"]`, `[attr*="v"]`, `[attr^="v"]`
//! and `[attr$="v"]` parts. Combinators are rejected.

use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// CDP node type of an element
pub const ELEMENT_NODE: i64 = 1;

/// One node of a CDP DOM snapshot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomNode {
    pub node_id: i64,
    #[serde(default)]
    pub backend_node_id: i64,
    pub node_type: i64,
    pub node_name: String,
    /// Flat `[name0, value0, name1, value1, ...]` list
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub children: Vec<DomNode>,
    #[serde(default)]
    pub shadow_roots: Vec<DomNode>,
    #[serde(default)]
    pub content_document: Option<Box<DomNode>>,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default, rename = "documentURL")]
    pub document_url: Option<String>,
}

static NEXT_DETACHED_ID: AtomicI64 = AtomicI64::new(1_000_000);

impl DomNode {
    /// Build a detached element (fixtures and synthetic trees).
    pub fn element(tag: &str) -> Self {
        let id = NEXT_DETACHED_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            node_id: id,
            backend_node_id: id,
            node_type: ELEMENT_NODE,
            node_name: tag.to_uppercase(),
            attributes: Vec::new(),
            children: Vec::new(),
            shadow_roots: Vec::new(),
            content_document: None,
            frame_id: None,
            document_url: None,
        }
    }

    /// Build a detached document node.
    pub fn document(url: &str, children: Vec<DomNode>) -> Self {
        let id = NEXT_DETACHED_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            node_id: id,
            backend_node_id: id,
            node_type: 9,
            node_name: "#document".to_string(),
            attributes: Vec::new(),
            children,
            shadow_roots: Vec::new(),
            content_document: None,
            frame_id: None,
            document_url: Some(url.to_string()),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.push(name.to_string());
        self.attributes.push(value.to_string());
        self
    }

    pub fn with_child(mut self, child: DomNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<DomNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn is_element(&self) -> bool {
        self.node_type == ELEMENT_NODE
    }

    /// Lowercased tag name
    pub fn tag(&self) -> String {
        self.node_name.to_ascii_lowercase()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .chunks_exact(2)
            .find(|pair| pair[0].eq_ignore_ascii_case(name))
            .map(|pair| pair[1].as_str())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|c| c.split_ascii_whitespace().any(|part| part == class))
            .unwrap_or(false)
    }

    /// Descendant nodes in document order, not crossing shadow roots or frames.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children.iter().rev().collect(),
        }
    }

    /// All descendant elements matching `selector`, in document order.
    pub fn query_all<'a>(&'a self, selector: &Selector) -> Vec<&'a DomNode> {
        self.descendants()
            .filter(|n| n.is_element() && selector.matches(n))
            .collect()
    }

    pub fn query_first<'a>(&'a self, selector: &Selector) -> Option<&'a DomNode> {
        self.descendants()
            .find(|n| n.is_element() && selector.matches(n))
    }

    /// The `<body>` element of a document snapshot, if attached yet
    pub fn body(&self) -> Option<&DomNode> {
        self.descendants()
            .find(|n| n.is_element() && n.node_name.eq_ignore_ascii_case("body"))
    }

    /// Find a node anywhere in the snapshot, crossing shadow roots and frame documents.
    pub fn find_deep<'a, F>(&'a self, predicate: &F) -> Option<&'a DomNode>
    where
        F: Fn(&DomNode) -> bool,
    {
        if predicate(self) {
            return Some(self);
        }
        self.children
            .iter()
            .chain(self.shadow_roots.iter())
            .chain(self.content_document.as_deref())
            .find_map(|child| child.find_deep(predicate))
    }
}

/// Depth-first, pre-order walk over light-DOM children.
pub struct Descendants<'a> {
    stack: Vec<&'a DomNode>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a DomNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

// === Selectors ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrOp {
    Exists,
    Equals(String),
    Contains(String),
    Prefix(String),
    Suffix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrMatch {
    pub name: String,
    pub op: AttrOp,
}

impl AttrMatch {
    fn matches(&self, node: &DomNode) -> bool {
        let Some(value) = node.attr(&self.name) else {
            return false;
        };
        match &self.op {
            AttrOp::Exists => true,
            AttrOp::Equals(v) => value == v,
            AttrOp::Contains(v) => !v.is_empty() && value.contains(v.as_str()),
            AttrOp::Prefix(v) => !v.is_empty() && value.starts_with(v.as_str()),
            AttrOp::Suffix(v) => !v.is_empty() && value.ends_with(v.as_str()),
        }
    }
}

/// A compound selector: `tag.class[attr op "value"]...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    tag: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorError {
    pub selector: String,
    pub reason: &'static str,
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid selector {:?}: {}", self.selector, self.reason)
    }
}

impl std::error::Error for SelectorError {}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        let fail = |reason| SelectorError {
            selector: source.to_string(),
            reason,
        };
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(fail("empty selector"));
        }

        let chars: Vec<char> = trimmed.chars().collect();
        let mut pos = 0;
        let mut selector = Selector {
            source: trimmed.to_string(),
            tag: None,
            classes: Vec::new(),
            attrs: Vec::new(),
        };

        let ident = |pos: &mut usize| -> String {
            let start = *pos;
            while *pos < chars.len() && (chars[*pos].is_alphanumeric() || chars[*pos] == '-' || chars[*pos] == '_') {
                *pos += 1;
            }
            chars[start..*pos].iter().collect()
        };

        let tag = ident(&mut pos);
        if !tag.is_empty() {
            selector.tag = Some(tag.to_ascii_lowercase());
        }

        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    let class = ident(&mut pos);
                    if class.is_empty() {
                        return Err(fail("missing class name"));
                    }
                    selector.classes.push(class);
                }
                '[' => {
                    pos += 1;
                    let name = ident(&mut pos);
                    if name.is_empty() {
                        return Err(fail("missing attribute name"));
                    }
                    let op_char = chars.get(pos).copied();
                    let op = match op_char {
                        Some(']') => {
                            pos += 1;
                            selector.attrs.push(AttrMatch { name, op: AttrOp::Exists });
                            continue;
                        }
                        Some('=') => {
                            pos += 1;
                            '='
                        }
                        Some(c @ ('*' | '^' | '$')) if chars.get(pos + 1) == Some(&'=') => {
                            pos += 2;
                            c
                        }
                        _ => return Err(fail("unsupported attribute operator")),
                    };

                    let value = match chars.get(pos).copied() {
                        Some(quote @ ('"' | '\'')) => {
                            pos += 1;
                            let start = pos;
                            while pos < chars.len() && chars[pos] != quote {
                                pos += 1;
                            }
                            if pos >= chars.len() {
                                return Err(fail("unterminated string"));
                            }
                            let value: String = chars[start..pos].iter().collect();
                            pos += 1;
                            value
                        }
                        _ => ident(&mut pos),
                    };
                    if chars.get(pos) != Some(&']') {
                        return Err(fail("missing closing bracket"));
                    }
                    pos += 1;

                    let op = match op {
                        '=' => AttrOp::Equals(value),
                        '*' => AttrOp::Contains(value),
                        '^' => AttrOp::Prefix(value),
                        _ => AttrOp::Suffix(value),
                    };
                    selector.attrs.push(AttrMatch { name, op });
                }
                _ => return Err(fail("combinators are not supported")),
            }
        }

        Ok(selector)
    }

    pub fn matches(&self, node: &DomNode) -> bool {
        if !node.is_element() {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !node.node_name.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        self.classes.iter().all(|c| node.has_class(c)) && self.attrs.iter().all(|a| a.matches(node))
    }

    /// Node matches, or has a matching descendant
    pub fn matches_or_contains(&self, node: &DomNode) -> bool {
        self.matches(node) || node.query_first(self).is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_match_compound_selectors() {
        let card = DomNode::element("div")
            .with_attr("class", "marketplace-card active")
            .with_attr("tabindex", "0")
            .with_attr("role", "button");

        let cases = [
            (r#"div[class*="marketplace-"][tabindex="0"]"#, true),
            (r#"[role="button"][class*="marketplace"]"#, true),
            (r#"[data-e2e="secondary-store-grid-item"]"#, false),
            ("div.active", true),
            ("span.active", false),
            ("[tabindex]", true),
            ("[class^='market']", true),
            ("[class$=\"active\"]", true),
        ];
        for (source, expected) in cases {
            let selector = Selector::parse(source).unwrap();
            assert_eq!(selector.matches(&card), expected, "{}", source);
        }
    }

    #[test]
    fn test_rejects_unsupported_syntax() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("div img").is_err());
        assert!(Selector::parse("div > img").is_err());
        assert!(Selector::parse("[class~=\"x\"]").is_err());
        assert!(Selector::parse("[class=\"x\"").is_err());
    }

    #[test]
    fn test_query_all_document_order_and_no_shadow_crossing() {
        let mut host = DomNode::element("section").with_attr("id", "host");
        host.shadow_roots.push(
            DomNode::element("div").with_child(DomNode::element("img").with_attr("src", "hidden")),
        );
        let root = DomNode::element("div").with_children(vec![
            DomNode::element("img").with_attr("src", "1"),
            DomNode::element("p").with_child(DomNode::element("img").with_attr("src", "2")),
            host,
            DomNode::element("img").with_attr("src", "3"),
        ]);
        let img = Selector::parse("img").unwrap();
        let srcs: Vec<&str> = root
            .query_all(&img)
            .into_iter()
            .filter_map(|n| n.attr("src"))
            .collect();
        assert_eq!(srcs, vec!["1", "2", "3"]);

        let hidden = root.find_deep(&|n| n.attr("src") == Some("hidden"));
        assert!(hidden.is_some());
    }

    #[test]
    fn test_deserialize_cdp_node() {
        let node: DomNode = serde_json::from_value(json!({
            "nodeId": 1,
            "backendNodeId": 2,
            "nodeType": 9,
            "nodeName": "#document",
            "documentURL": "https://overlay.cdn.ubisoft.com/?microApp=marketplace",
            "children": [{
                "nodeId": 3, "backendNodeId": 4, "nodeType": 1, "nodeName": "HTML",
                "attributes": [],
                "children": [{"nodeId": 5, "backendNodeId": 6, "nodeType": 1, "nodeName": "BODY"}]
            }]
        }))
        .unwrap();
        assert!(node.body().is_some());
        assert_eq!(node.body().unwrap().node_id, 5);
        assert_eq!(
            node.document_url.as_deref(),
            Some("https://overlay.cdn.ubisoft.com/?microApp=marketplace")
        );
    }
}
