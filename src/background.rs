//! Background hub: owns the caches and the tab registry for one DevTools
//! connection and dispatches protocol events to tabs and frames.
//!
//! Each connection gets a fresh hub, so a reconnect starts with empty caches.
//! Body fetches, merges and relays run in spawned tasks; the event loop only
//! routes.

use anyhow::{anyhow, Context, Result};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::analytics::Analytics;
use crate::cache::{MarketCache, SharedCache};
use crate::cdp::{CdpClient, CdpEvent, SessionId};
use crate::config::{FAVORITE_BINDING, HEARTBEAT_INTERVAL_SECS};
use crate::export;
use crate::favorites::FavoritesHandle;
use crate::frame::FrameContext;
use crate::interceptor::{attach_request, fetch_payload, target_request_id, Interceptor};
use crate::messages::{
    DomMutation, FrameMessage, GetItemDetailsRequest, GraphqlDataEvent, ItemDetailsResponse, PageMessage,
    ShowNotification,
};
use crate::patch::PatchRules;
use crate::registry::{SharedRegistry, TabRegistry};
use crate::relay::Relay;
use crate::resolver;
use crate::storage::StoreHandle;

/// Requests whose body is read once loading finishes
type PendingBodies = FxHashMap<String, SessionId>;

/// Drop in-flight requests whose session no longer belongs to any tab.
fn prune_pending(pending: &mut PendingBodies, registry: &TabRegistry) {
    let before = pending.len();
    pending.retain(|_, session| registry.owner_of(session).is_some());
    if pending.len() < before {
        debug!("[INTERCEPT] Dropped {} in-flight requests of detached sessions", before - pending.len());
    }
}

#[derive(Clone)]
pub struct Background {
    cdp: CdpClient,
    registry: SharedRegistry,
    cache: SharedCache,
    store: StoreHandle,
    ctx: FrameContext,
    interceptor: Interceptor,
    relay: Relay,
}

impl Background {
    pub fn new(cdp: CdpClient, store: StoreHandle, favorites: FavoritesHandle, analytics: Analytics) -> Result<Self> {
        let rules = PatchRules::marketplace().map_err(|e| anyhow!(e)).context("Invalid card selectors")?;
        let registry = TabRegistry::shared();
        let cache: SharedCache = Arc::new(RwLock::new(MarketCache::new()));
        let ctx = FrameContext {
            rules: Arc::new(rules),
            cache: cache.clone(),
            store: store.clone(),
            favorites: favorites.clone(),
            analytics,
        };
        Ok(Self {
            interceptor: Interceptor::new(cdp.clone(), registry.clone(), ctx.clone()),
            relay: Relay::new(registry.clone(), cache.clone(), favorites),
            cdp,
            registry,
            cache,
            store,
            ctx,
        })
    }

    /// Run until the connection closes.
    pub async fn run(self) -> Result<()> {
        let mut events = self.cdp.subscribe();
        let closed = self.cdp.closed();

        self.cdp
            .call("Target.setDiscoverTargets", json!({ "discover": true }), None)
            .await
            .context("Target.setDiscoverTargets failed")?;
        let targets = self
            .cdp
            .call("Target.getTargets", json!({}), None)
            .await
            .context("Target.getTargets failed")?;
        for info in targets["targetInfos"].as_array().into_iter().flatten() {
            self.maybe_attach(info);
        }
        info!("✅ Watching browser targets");

        let mut pending = PendingBodies::default();
        let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event, &mut pending).await,
                    Err(RecvError::Lagged(skipped)) => warn!("[CDP] Event loop lagged, {} events skipped", skipped),
                    Err(RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }

        let tabs: Vec<_> = self.registry.read().await.tabs().map(|t| t.cancel.clone()).collect();
        for cancel in tabs {
            cancel.cancel();
        }
        self.store.flush().await;
        warn!("[CDP] Connection closed");
        Ok(())
    }

    fn maybe_attach(&self, target_info: &Value) {
        let Some(req) = attach_request(target_info) else {
            return;
        };
        let interceptor = self.interceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = interceptor.attach(req).await {
                warn!("[INTERCEPT] {:#}", e);
            }
        });
    }

    async fn on_event(&self, event: CdpEvent, pending: &mut PendingBodies) {
        match event.method.as_str() {
            "Target.targetCreated" | "Target.targetInfoChanged" => {
                let info = &event.params["targetInfo"];
                let attached = match info["targetId"].as_str() {
                    Some(id) => self.registry.read().await.is_attached(id),
                    None => false,
                };
                if !attached {
                    self.maybe_attach(info);
                }
            }
            "Target.targetDestroyed" => {
                if let Some(target_id) = event.str_param("targetId") {
                    self.interceptor.detach(target_id).await;
                    prune_pending(pending, &*self.registry.read().await);
                }
            }
            "Target.detachedFromTarget" => {
                let Some(session) = event.str_param("sessionId") else {
                    return;
                };
                let owner = self.registry.read().await.owner_of(session).cloned();
                match owner {
                    Some(owner) => match owner.frame_id {
                        Some(frame_id) => {
                            self.registry.write().await.remove_frame(&owner.tab_id, &frame_id);
                            debug!("[INTERCEPT] Frame {} detached", frame_id);
                        }
                        None => self.interceptor.detach(&owner.tab_id).await,
                    },
                    None => debug!("[INTERCEPT] Unknown session {} detached", session),
                }
                prune_pending(pending, &*self.registry.read().await);
            }
            "Target.attachedToTarget" => self.on_attached_to_target(&event).await,
            "Network.responseReceived" => {
                let Some(session) = event.session_id.clone() else {
                    return;
                };
                if let Some(request_id) = target_request_id(&event.params) {
                    debug!("[INTERCEPT] Marketplace response {} on {}", request_id, session);
                    pending.insert(request_id.to_string(), session);
                }
            }
            "Network.loadingFinished" => {
                let Some(request_id) = event.str_param("requestId") else {
                    return;
                };
                if let Some(session) = pending.remove(request_id) {
                    let hub = self.clone();
                    let request_id = request_id.to_string();
                    tokio::spawn(async move { hub.ingest(session, request_id).await });
                }
            }
            "Network.loadingFailed" => {
                if let Some(request_id) = event.str_param("requestId") {
                    pending.remove(request_id);
                }
            }
            "DOM.childNodeInserted" => {
                let node = event.params["node"].clone();
                self.to_session_frames(&event, FrameMessage::Mutation(DomMutation::Inserted(node)))
                    .await;
            }
            "DOM.documentUpdated" => {
                self.to_session_frames(&event, FrameMessage::Mutation(DomMutation::DocumentUpdated))
                    .await;
            }
            "Page.frameNavigated" => self.on_frame_navigated(&event).await,
            "Runtime.bindingCalled" => {
                if event.str_param("name") != Some(FAVORITE_BINDING) {
                    return;
                }
                let payload = event.str_param("payload").unwrap_or_default().to_string();
                let hub = self.clone();
                tokio::spawn(async move { hub.on_favorite_clicked(&payload).await });
            }
            _ => {}
        }
    }

    async fn on_attached_to_target(&self, event: &CdpEvent) {
        // Browser-level attach events answer our own attachToTarget calls.
        let Some(parent) = event.session_id.as_deref() else {
            return;
        };
        let info = &event.params["targetInfo"];
        if info["type"].as_str() != Some("iframe") {
            return;
        }
        let Some(session) = event.str_param("sessionId").map(str::to_string) else {
            return;
        };
        let Some(tab_id) = self.registry.read().await.owner_of(parent).map(|o| o.tab_id.clone()) else {
            return;
        };

        let interceptor = self.interceptor.clone();
        let info = info.clone();
        tokio::spawn(async move {
            if let Err(e) = interceptor.attach_frame(&tab_id, session, &info).await {
                warn!("[INTERCEPT] {:#}", e);
            }
        });
    }

    async fn on_frame_navigated(&self, event: &CdpEvent) {
        let Some(session) = event.session_id.as_deref() else {
            return;
        };
        let frame = &event.params["frame"];
        let (Some(frame_id), Some(url)) = (frame["id"].as_str(), frame["url"].as_str()) else {
            return;
        };

        let mut registry = self.registry.write().await;
        let Some(owner) = registry.owner_of(session).cloned() else {
            return;
        };
        if let Some(handle) = registry.set_frame_url(&owner.tab_id, frame_id, url) {
            if handle.tx.try_send(FrameMessage::Navigated(url.to_string())).is_err() {
                debug!("[FRAME] {} inbox unavailable, navigation dropped", frame_id);
            }
        }
        let is_page_top = owner.frame_id.is_none() && frame.get("parentId").is_none();
        if is_page_top {
            if let Some(tab) = registry.tab_mut(&owner.tab_id) {
                tab.url = url.to_string();
                if tab.page_tx.try_send(PageMessage::Navigated(url.to_string())).is_err() {
                    debug!("[RELAY] Page inbox of {} unavailable, navigation dropped", owner.tab_id);
                }
            }
        }
    }

    async fn to_session_frames(&self, event: &CdpEvent, msg: FrameMessage) {
        let Some(session) = event.session_id.as_deref() else {
            return;
        };
        for frame in self.registry.read().await.frames_on_session(session) {
            if frame.tx.try_send(msg.clone()).is_err() {
                debug!("[FRAME] {} inbox full, mutation dropped", frame.frame_id);
            }
        }
    }

    /// Body → page → resolver → cache → export → relay, for one response.
    async fn ingest(&self, session: SessionId, request_id: String) {
        let (tab_id, page_tx) = {
            let registry = self.registry.read().await;
            let Some(owner) = registry.owner_of(&session) else {
                return;
            };
            let Some(tab) = registry.tab(&owner.tab_id) else {
                return;
            };
            (tab.tab_id.clone(), tab.page_tx.clone())
        };

        let payload = match fetch_payload(&self.cdp, &session, &request_id).await {
            Ok(Some(payload)) => Arc::new(payload),
            Ok(None) => return,
            Err(e) => {
                error!("[INTERCEPT] ❌ {:#}", e);
                self.ctx.analytics.error_occurred("parse_failed", &format!("{:#}", e));
                let note = ShowNotification::error("R6 Market Helper: could not read marketplace data");
                if page_tx.send(PageMessage::Notify(note)).await.is_err() {
                    debug!("[RELAY] Tab {} closed, notification dropped", tab_id);
                }
                return;
            }
        };

        let event = PageMessage::GraphqlData(GraphqlDataEvent { data: payload.clone() });
        if page_tx.send(event).await.is_err() {
            debug!("[RELAY] Tab {} closed, payload not forwarded to the page", tab_id);
        }

        let nodes = resolver::resolve(&payload);
        if nodes.is_empty() {
            debug!("[INTERCEPT] Response {} carries no marketable items", request_id);
            return;
        }

        let (outcome, prices, details) = {
            let mut cache = self.cache.write().await;
            let outcome = cache.merge(&nodes);
            (outcome, cache.price_count(), cache.detail_count())
        };
        info!(
            "[CACHE] 📦 Merged {} items ({} new) | {} prices, {} items cached",
            outcome.merged, outcome.new_key_count, prices, details
        );
        self.ctx.analytics.data_received(nodes.len());

        let settings = self.store.load_settings().await;
        if settings.data_export {
            let written = export::record_nodes(&self.store, &nodes);
            debug!("[EXPORT] Recorded {} marketplace records", written);
        }

        self.relay.relay(&tab_id, settings).await;
    }

    async fn on_favorite_clicked(&self, payload: &str) {
        let item_id = serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|v| v["itemId"].as_str().map(str::to_string));
        let Some(item_id) = item_id else {
            warn!("[FAVORITES] Ignoring malformed toggle: {}", payload);
            return;
        };
        let Some(toggled) = self.ctx.favorites.toggle(&item_id).await else {
            return;
        };
        self.ctx.analytics.favorite_toggled(&item_id, toggled.favorite);

        for frame in self.registry.read().await.all_frames() {
            if frame.tx.try_send(FrameMessage::Favorites(toggled.favorites.clone())).is_err() {
                debug!("[FRAME] {} inbox unavailable, favorites update dropped", frame.frame_id);
            }
        }
    }

    pub async fn item_details(&self, req: GetItemDetailsRequest) -> ItemDetailsResponse {
        ItemDetailsResponse {
            details: self.cache.read().await.item_details(&req.item_ids),
        }
    }

    pub async fn heartbeat(&self) {
        let tabs = self.registry.read().await.tab_count();
        let (prices, details) = {
            let cache = self.cache.read().await;
            (cache.price_count(), cache.detail_count())
        };
        let favorites = self.ctx.favorites.list().await;
        let favorite_count = favorites.len();
        let resolved = self
            .item_details(GetItemDetailsRequest { item_ids: favorites })
            .await
            .details;

        info!(
            "💓 Heartbeat | tabs: {} | prices: {} | items: {} | favorites: {} ({} seen this session)",
            tabs,
            prices,
            details,
            favorite_count,
            resolved.len()
        );
        for item in resolved.iter().take(3) {
            info!("   ⭐ {} ({})", item.name, item.item_id);
        }
    }
}
