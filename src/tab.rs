//! Tab agents: the page-side half of a debugging session.
//!
//! A tab agent renders notifications in the top-level page and acts as the
//! cross-frame relay for the embedded marketplace frame. The frame sits
//! inside the `ubisoft-connect` element's shadow root and appears some time
//! after load, so the agent polls for it a bounded number of times. When
//! the frame is in-process (no session of its own) the agent starts a
//! page-scoped frame agent for it, seeds it with everything cached so far
//! and then forwards every intercepted payload.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cdp::{CdpClient, SessionId, TargetId};
use crate::config::{ms, wait_until, FRAME_DISCOVERY_INTERVAL_MS, FRAME_DISCOVERY_MAX_ATTEMPTS, FRAME_HOST_ELEMENT};
use crate::dom::DomNode;
use crate::frame::{spawn_cdp_frame, DocumentScope, FrameContext, FrameSpawn};
use crate::messages::{FrameMessage, MarketDataUpdate, PageMessage, RenderPayload};
use crate::notify;
use crate::registry::{FrameRoute, SharedRegistry};

pub const PAGE_INBOX_CAPACITY: usize = 64;

/// The embedded frame as found in the page snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedFrame {
    pub frame_id: String,
    pub url: String,
    /// The frame document is part of the page snapshot (same process)
    pub in_process: bool,
}

/// Locate the first iframe inside the frame host's shadow root.
pub fn find_embedded_frame(page: &DomNode) -> Option<EmbeddedFrame> {
    let host = page.find_deep(&|n| n.is_element() && n.node_name.eq_ignore_ascii_case(FRAME_HOST_ELEMENT))?;
    let iframe = host
        .shadow_roots
        .iter()
        .find_map(|root| root.find_deep(&|n| n.is_element() && n.node_name.eq_ignore_ascii_case("iframe")))?;

    let content = iframe.content_document.as_deref();
    let url = content
        .and_then(|doc| doc.document_url.clone())
        .or_else(|| iframe.attr("src").map(str::to_string))
        .unwrap_or_default();

    Some(EmbeddedFrame {
        frame_id: iframe.frame_id.clone()?,
        url,
        in_process: content.is_some(),
    })
}

/// Bounded discovery schedule.
#[derive(Debug, Clone, Copy)]
struct Discovery {
    attempts: u32,
    next_at: Option<Instant>,
}

impl Discovery {
    fn start() -> Self {
        Self {
            attempts: 0,
            next_at: Some(Instant::now()),
        }
    }

    fn stop(&mut self) {
        self.next_at = None;
    }

    /// Count an unsuccessful attempt and schedule the next one if any remain.
    fn retry(&mut self) -> bool {
        if self.attempts >= FRAME_DISCOVERY_MAX_ATTEMPTS {
            self.next_at = None;
            return false;
        }
        self.next_at = Some(Instant::now() + ms(FRAME_DISCOVERY_INTERVAL_MS));
        true
    }
}

pub struct TabAgent {
    tab_id: TargetId,
    session_id: SessionId,
    cdp: CdpClient,
    registry: SharedRegistry,
    ctx: FrameContext,
    /// Own inbox, handed to page-scoped frame agents for notifications
    page_tx: mpsc::Sender<PageMessage>,
    cancel: CancellationToken,
    last_payload: Option<Arc<Value>>,
    discovery: Discovery,
}

impl TabAgent {
    pub fn new(
        tab_id: TargetId,
        session_id: SessionId,
        cdp: CdpClient,
        registry: SharedRegistry,
        ctx: FrameContext,
        page_tx: mpsc::Sender<PageMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tab_id,
            session_id,
            cdp,
            registry,
            ctx,
            page_tx,
            cancel,
            last_payload: None,
            discovery: Discovery::start(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<PageMessage>) {
        debug!("[RELAY] Tab agent started for {}", self.tab_id);
        loop {
            let wake = self.discovery.next_at;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = wait_until(wake) => self.discover().await,
            }
        }
        debug!("[RELAY] Tab agent stopped for {}", self.tab_id);
    }

    async fn handle(&mut self, msg: PageMessage) {
        match msg {
            PageMessage::GraphqlData(event) => {
                self.last_payload = Some(event.data.clone());
                let relayed = self.registry.read().await.relayed_frames(&self.tab_id);
                for frame in relayed {
                    let update = FrameMessage::MarketDataUpdate(MarketDataUpdate {
                        data: event.data.clone(),
                    });
                    if frame.tx.send(update).await.is_err() {
                        debug!("[RELAY] Frame {} is gone", frame.frame_id);
                    }
                }
            }
            PageMessage::Notify(note) => {
                notify::show(&self.cdp, &self.session_id, &note).await;
            }
            PageMessage::Navigated(url) => {
                debug!("[RELAY] Page {} navigated to {}", self.tab_id, url);
                self.ctx.analytics.page_visited(&url);
                self.discovery = Discovery::start();
            }
        }
    }

    /// One discovery attempt.
    async fn discover(&mut self) {
        self.discovery.attempts += 1;

        if self.registry.read().await.has_target_frame(&self.tab_id) {
            debug!("[RELAY] Marketplace frame reachable directly, discovery stopped");
            self.discovery.stop();
            return;
        }

        let page = match self.page_snapshot().await {
            Some(page) => page,
            None => {
                self.retry_or_give_up();
                return;
            }
        };

        let Some(found) = find_embedded_frame(&page) else {
            self.retry_or_give_up();
            return;
        };

        if self.registry.read().await.frame(&self.tab_id, &found.frame_id).is_some() {
            self.discovery.stop();
            return;
        }
        if !found.in_process {
            // Out-of-process: its own session is on the way through auto-attach.
            self.retry_or_give_up();
            return;
        }

        info!(
            "[RELAY] 🔗 Found marketplace frame {} after {} attempts: {}",
            found.frame_id, self.discovery.attempts, found.url
        );
        self.discovery.stop();

        let handle = spawn_cdp_frame(
            &self.cdp,
            &self.ctx,
            FrameSpawn {
                frame_id: found.frame_id.clone(),
                session_id: self.session_id.clone(),
                url: found.url,
                route: FrameRoute::Relayed,
                scope: DocumentScope::Subframe {
                    frame_id: found.frame_id,
                },
            },
            self.page_tx.clone(),
            &self.cancel,
        );
        let tx = handle.tx.clone();
        if !self.registry.write().await.add_frame(&self.tab_id, handle) {
            return;
        }
        self.seed(&tx).await;
    }

    /// Hand a freshly started frame agent the whole cache, then the last
    /// payload in case its merge has not landed in the cache yet.
    async fn seed(&self, tx: &mpsc::Sender<FrameMessage>) {
        let snapshot = self.ctx.cache.read().await.snapshot();
        let priced = snapshot.prices.len();
        let seed = FrameMessage::Render(RenderPayload {
            snapshot,
            settings: self.ctx.store.load_settings().await,
            favorites: self.ctx.favorites.set().await,
        });
        if tx.send(seed).await.is_err() {
            debug!("[RELAY] New frame stopped before seeding");
            return;
        }
        debug!("[RELAY] Seeded new frame with {} cached prices", priced);

        if let Some(data) = self.last_payload.clone() {
            let update = FrameMessage::MarketDataUpdate(MarketDataUpdate { data });
            if tx.send(update).await.is_err() {
                debug!("[RELAY] New frame stopped before replay");
            }
        }
    }

    fn retry_or_give_up(&mut self) {
        if !self.discovery.retry() {
            warn!(
                "[RELAY] Marketplace frame not found in {} after {} attempts",
                self.tab_id, self.discovery.attempts
            );
        }
    }

    async fn page_snapshot(&self) -> Option<DomNode> {
        let result = self
            .cdp
            .call(
                "DOM.getDocument",
                json!({ "depth": -1, "pierce": true }),
                Some(&self.session_id),
            )
            .await;
        match result {
            Ok(value) => serde_json::from_value(value["root"].clone()).ok(),
            Err(e) => {
                debug!("[RELAY] Page snapshot failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Analytics;
    use crate::cache::MarketCache;
    use crate::favorites::FavoritesHandle;
    use crate::messages::GraphqlDataEvent;
    use crate::patch::PatchRules;
    use crate::registry::{TabHandle, TabRegistry};
    use crate::resolver;
    use crate::storage::open_store;
    use rustc_hash::FxHashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::RwLock;
    use tokio::time::{sleep, timeout};

    const FRAME_URL: &str = "https://overlay.cdn.ubisoft.com/app?microApp=marketplace&lang=en";

    fn page_with_frame(in_process: bool) -> DomNode {
        let mut iframe = DomNode::element("iframe")
            .with_attr("src", "https://overlay.cdn.ubisoft.com/app?microApp=marketplace");
        iframe.frame_id = Some("F1".into());
        if in_process {
            iframe.content_document = Some(Box::new(DomNode::document(
                "https://overlay.cdn.ubisoft.com/app?microApp=marketplace&lang=en",
                vec![],
            )));
        }
        let mut host = DomNode::element("ubisoft-connect");
        host.shadow_roots.push(DomNode::element("div").with_child(iframe));
        DomNode::document(
            "https://www.ubisoft.com/marketplace",
            vec![DomNode::element("html").with_child(DomNode::element("body").with_child(host))],
        )
    }

    #[test]
    fn test_find_embedded_frame_in_shadow_root() {
        let found = find_embedded_frame(&page_with_frame(true)).unwrap();
        assert_eq!(found.frame_id, "F1");
        assert!(found.in_process);
        assert!(found.url.ends_with("&lang=en"));

        let remote = find_embedded_frame(&page_with_frame(false)).unwrap();
        assert!(!remote.in_process);
        assert!(remote.url.ends_with("microApp=marketplace"));
    }

    #[test]
    fn test_iframe_outside_host_is_ignored() {
        let mut iframe = DomNode::element("iframe");
        iframe.frame_id = Some("F2".into());
        let page = DomNode::document("https://www.ubisoft.com/", vec![iframe]);
        assert!(find_embedded_frame(&page).is_none());
    }

    #[test]
    fn test_discovery_is_bounded() {
        let mut discovery = Discovery::start();
        let mut scheduled = 0;
        loop {
            discovery.attempts += 1;
            if !discovery.retry() {
                break;
            }
            scheduled += 1;
        }
        assert_eq!(discovery.attempts, FRAME_DISCOVERY_MAX_ATTEMPTS);
        assert_eq!(scheduled, FRAME_DISCOVERY_MAX_ATTEMPTS - 1);
        assert!(discovery.next_at.is_none());
    }

    #[test]
    fn test_frame_url_comes_from_loaded_document() {
        let page: DomNode = serde_json::from_value(page_json(true, &["a"])).unwrap();
        let found = find_embedded_frame(&page).unwrap();
        assert_eq!(found.url, FRAME_URL);
        assert!(found.in_process);
    }

    fn listing(items: &[(&str, i64)]) -> Value {
        let nodes: Vec<Value> = items
            .iter()
            .map(|(id, price)| {
                json!({
                    "item": {"itemId": id, "assetUrl": format!("https://x/{}.png", id)},
                    "marketData": {"sellStats": [{"lowestPrice": price}]}
                })
            })
            .collect();
        json!({"data": {"marketableItems": {"nodes": nodes}}})
    }

    fn node(id: i64, name: &str, attributes: &[&str], children: Vec<Value>) -> Value {
        json!({
            "nodeId": id,
            "backendNodeId": id + 1000,
            "nodeType": 1,
            "nodeName": name,
            "attributes": attributes,
            "children": children
        })
    }

    /// Marketplace page; with `with_frame` the in-process frame shows one card per item.
    /// The iframe's `src` is stale, only the loaded document carries the real URL.
    fn page_json(with_frame: bool, item_ids: &[&str]) -> Value {
        let mut host = node(10, "UBISOFT-CONNECT", &[], vec![]);
        if with_frame {
            let cards: Vec<Value> = item_ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    let card_id = 100 + 2 * i as i64;
                    let src = format!("https://x/{}.png", id);
                    node(
                        card_id,
                        "DIV",
                        &["data-e2e", "secondary-store-grid-item"],
                        vec![node(card_id + 1, "IMG", &["src", &src], vec![])],
                    )
                })
                .collect();
            let mut iframe = node(20, "IFRAME", &["src", "about:blank"], vec![]);
            iframe["frameId"] = json!("F1");
            iframe["contentDocument"] = json!({
                "nodeId": 50,
                "backendNodeId": 1050,
                "nodeType": 9,
                "nodeName": "#document",
                "documentURL": FRAME_URL,
                "children": [node(51, "HTML", &[], vec![node(52, "BODY", &[], cards)])]
            });
            host["shadowRoots"] = json!([{
                "nodeId": 11,
                "backendNodeId": 1011,
                "nodeType": 11,
                "nodeName": "#document-fragment",
                "children": [iframe]
            }]);
        }
        json!({
            "nodeId": 1,
            "backendNodeId": 1001,
            "nodeType": 9,
            "nodeName": "#document",
            "documentURL": "https://www.ubisoft.com/marketplace",
            "children": [node(2, "HTML", &[], vec![node(3, "BODY", &[], vec![host])])]
        })
    }

    /// Answers the page session's commands. The marketplace frame shows up
    /// from the second snapshot on. Returns the objects that got an overlay.
    fn fake_browser(cdp: CdpClient, mut outgoing: mpsc::UnboundedReceiver<String>) -> Arc<Mutex<Vec<String>>> {
        let overlays = Arc::new(Mutex::new(Vec::new()));
        let seen = overlays.clone();
        tokio::spawn(async move {
            let mut snapshots = 0;
            while let Some(text) = outgoing.recv().await {
                let cmd: Value = serde_json::from_str(&text).unwrap();
                let params = &cmd["params"];
                let result = match cmd["method"].as_str().unwrap_or_default() {
                    "DOM.getDocument" => {
                        snapshots += 1;
                        json!({"root": page_json(snapshots > 1, &["a", "b", "c"])})
                    }
                    "DOM.resolveNode" => {
                        json!({"object": {"objectId": format!("obj-{}", params["backendNodeId"])}})
                    }
                    "Runtime.callFunctionOn" => {
                        let object = params["objectId"].as_str().unwrap_or_default().to_string();
                        let mut seen = seen.lock().unwrap();
                        let fresh = !seen.contains(&object);
                        if fresh {
                            seen.push(object);
                        }
                        json!({"result": {"type": "boolean", "value": fresh}})
                    }
                    _ => json!({}),
                };
                cdp.deliver(&json!({"id": cmd["id"], "result": result}).to_string())
                    .unwrap();
            }
        });
        overlays
    }

    async fn wait_for_overlays(overlays: &Mutex<Vec<String>>, objects: &[&str]) -> bool {
        let all_there = || {
            let seen = overlays.lock().unwrap();
            objects.iter().all(|o| seen.iter().any(|s| s == o))
        };
        timeout(Duration::from_secs(5), async {
            while !all_there() {
                sleep(ms(20)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_relayed_frame_gets_everything_cached_before_it_appeared() {
        let (cdp, outgoing) = CdpClient::detached();
        let overlays = fake_browser(cdp.clone(), outgoing);

        // Earlier responses already merged by the hub
        let mut cache = MarketCache::new();
        cache.merge(&resolver::resolve(&listing(&[("a", 1200)])));

        let store = open_store(":memory:").unwrap();
        let ctx = FrameContext {
            rules: Arc::new(PatchRules::marketplace().unwrap()),
            cache: Arc::new(RwLock::new(cache)),
            favorites: FavoritesHandle::spawn(store.clone()),
            analytics: Analytics::new(store.clone(), false),
            store,
        };
        let registry = TabRegistry::shared();
        let (page_tx, page_rx) = mpsc::channel(PAGE_INBOX_CAPACITY);
        let cancel = CancellationToken::new();
        registry.write().await.insert_tab(TabHandle {
            tab_id: "T1".into(),
            session_id: "S1".into(),
            url: "https://www.ubisoft.com/marketplace".into(),
            page_tx: page_tx.clone(),
            frames: FxHashMap::default(),
            cancel: cancel.clone(),
        });

        let agent = TabAgent::new(
            "T1".into(),
            "S1".into(),
            cdp,
            registry.clone(),
            ctx,
            page_tx.clone(),
            cancel.clone(),
        );
        tokio::spawn(agent.run(page_rx));

        // Arrives before the frame exists: only the last payload can be replayed
        let latest = PageMessage::GraphqlData(GraphqlDataEvent {
            data: Arc::new(listing(&[("b", 800)])),
        });
        page_tx.send(latest).await.unwrap();

        assert!(wait_for_overlays(&overlays, &["obj-1100", "obj-1102"]).await);
        let relayed = registry.read().await.relayed_frames("T1");
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].frame_id, "F1");
        assert_eq!(relayed[0].url, FRAME_URL);

        // Later payloads travel through the page to the frame
        let next = PageMessage::GraphqlData(GraphqlDataEvent {
            data: Arc::new(listing(&[("c", 450)])),
        });
        page_tx.send(next).await.unwrap();
        assert!(wait_for_overlays(&overlays, &["obj-1104"]).await);

        cancel.cancel();
    }
}
