//! Frame agents: one task per frame running the DOM patch routine.
//!
//! An agent owns the frame's price view, settings and favorites, and a
//! [`FrameDriver`] that reads the frame's document and applies overlays.
//! It re-plans when new data arrives, when a relevant DOM mutation settles
//! (debounced), and while waiting for `<body>` to attach (polled). Every
//! timer lives inside the agent loop and dies with the agent's token.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::Analytics;
use crate::cache::{DetailsMap, MarketCache, PriceMap, SharedCache};
use crate::cdp::{CdpClient, SessionId};
use crate::config::{ms, wait_until, BODY_POLL_INTERVAL_MS, FAVORITE_BINDING, OVERLAY_CLASS, REPATCH_DEBOUNCE_MS};
use crate::dom::DomNode;
use crate::favorites::FavoritesHandle;
use crate::messages::{DomMutation, FrameMessage, MarketDataUpdate, PageMessage, RenderPayload, ShowNotification};
use crate::patch::{is_target_frame, plan_patch, FrameState, OverlayPatch, PatchRules};
use crate::registry::{FrameHandle, FrameRoute};
use crate::resolver;
use crate::storage::StoreHandle;
use crate::types::Settings;

const FRAME_INBOX_CAPACITY: usize = 64;

/// Reads a frame's document and mutates it.
#[async_trait]
pub trait FrameDriver: Send + Sync {
    /// Current document snapshot; `None` while the frame has none.
    async fn document(&self) -> Result<Option<DomNode>>;

    /// Insert one overlay. `false` when the card already carries one.
    async fn insert_overlay(&self, patch: &OverlayPatch) -> Result<bool>;

    /// Bring existing favorite toggles in line with `favorites`.
    async fn sync_favorites(&self, favorites: &[String]) -> Result<()>;
}

// === CDP driver ===

const INSERT_OVERLAY_FUNCTION: &str = r#"function (html, markerClass, bindingName) {
  if (this.querySelector('.' + markerClass)) return false;
  const view = this.ownerDocument && this.ownerDocument.defaultView;
  if (view && view.getComputedStyle(this).position === 'static') {
    this.style.position = 'relative';
  }
  this.insertAdjacentHTML('beforeend', html);
  const overlay = this.lastElementChild;
  const button = overlay && overlay.querySelector('[data-r6-favorite]');
  if (button) {
    button.addEventListener('click', (event) => {
      event.preventDefault();
      event.stopPropagation();
      const notify = view && view[bindingName];
      if (typeof notify === 'function') {
        notify(JSON.stringify({ itemId: button.getAttribute('data-r6-favorite') }));
      }
    });
  }
  return true;
}"#;

const SYNC_FAVORITES_FUNCTION: &str = r#"function (favorites) {
  const set = new Set(favorites);
  const buttons = this.querySelectorAll('[data-r6-favorite]');
  buttons.forEach((button) => {
    const on = set.has(button.getAttribute('data-r6-favorite'));
    button.setAttribute('aria-pressed', String(on));
    button.textContent = on ? '★' : '☆';
    button.style.color = on ? '#ffd43b' : '#adb5bd';
  });
  return buttons.length;
}"#;

/// Which document of a session the driver works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentScope {
    /// The session's own document
    Root,
    /// An in-process iframe's document, reached through its owner element
    Subframe { frame_id: String },
}

pub struct CdpFrameDriver {
    cdp: CdpClient,
    session: SessionId,
    scope: DocumentScope,
}

impl CdpFrameDriver {
    pub fn new(cdp: CdpClient, session: SessionId, scope: DocumentScope) -> Self {
        Self { cdp, session, scope }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.cdp
            .call(method, params, Some(&self.session))
            .await
            .with_context(|| format!("{} failed", method))
    }

    async fn resolve_object(&self, backend_node_id: i64) -> Result<String> {
        let resolved = self
            .call("DOM.resolveNode", json!({ "backendNodeId": backend_node_id }))
            .await?;
        resolved["object"]["objectId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("node {} has no remote object", backend_node_id))
    }
}

/// The scoped document inside a full snapshot.
pub fn scoped_document(root: DomNode, scope: &DocumentScope) -> Option<DomNode> {
    match scope {
        DocumentScope::Root => Some(root),
        DocumentScope::Subframe { frame_id } => root
            .find_deep(&|n| n.frame_id.as_deref() == Some(frame_id.as_str()) && n.content_document.is_some())
            .and_then(|owner| owner.content_document.as_deref().cloned()),
    }
}

#[async_trait]
impl FrameDriver for CdpFrameDriver {
    async fn document(&self) -> Result<Option<DomNode>> {
        let result = self
            .call("DOM.getDocument", json!({ "depth": -1, "pierce": true }))
            .await?;
        let root: DomNode = serde_json::from_value(result["root"].clone())
            .context("Unexpected DOM.getDocument shape")?;
        Ok(scoped_document(root, &self.scope))
    }

    async fn insert_overlay(&self, patch: &OverlayPatch) -> Result<bool> {
        let object_id = self.resolve_object(patch.backend_node_id).await?;
        let result = self
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": INSERT_OVERLAY_FUNCTION,
                    "arguments": [
                        { "value": patch.html },
                        { "value": OVERLAY_CLASS },
                        { "value": FAVORITE_BINDING },
                    ],
                    "returnByValue": true,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            return Err(anyhow!("overlay script threw: {}", exception["text"]));
        }
        Ok(result["result"]["value"].as_bool().unwrap_or(false))
    }

    async fn sync_favorites(&self, favorites: &[String]) -> Result<()> {
        let Some(document) = self.document().await? else {
            return Ok(());
        };
        let object_id = self.resolve_object(document.backend_node_id).await?;
        self.call(
            "Runtime.callFunctionOn",
            json!({
                "objectId": object_id,
                "functionDeclaration": SYNC_FAVORITES_FUNCTION,
                "arguments": [{ "value": favorites }],
                "returnByValue": true,
            }),
        )
        .await?;
        Ok(())
    }
}

/// Where and how to start a CDP-backed frame agent.
#[derive(Debug, Clone)]
pub struct FrameSpawn {
    pub frame_id: String,
    pub session_id: SessionId,
    pub url: String,
    pub route: FrameRoute,
    pub scope: DocumentScope,
}

/// Start an agent for a live frame. Its token is a child of `parent`.
pub fn spawn_cdp_frame(
    cdp: &CdpClient,
    ctx: &FrameContext,
    spawn: FrameSpawn,
    notifier: mpsc::Sender<PageMessage>,
    parent: &CancellationToken,
) -> FrameHandle {
    let cancel = parent.child_token();
    let driver = CdpFrameDriver::new(cdp.clone(), spawn.session_id.clone(), spawn.scope);
    let tx = FrameAgent::new(
        spawn.frame_id.clone(),
        spawn.url.clone(),
        driver,
        ctx.clone(),
        notifier,
        cancel.clone(),
    )
    .spawn();
    FrameHandle {
        frame_id: spawn.frame_id,
        session_id: spawn.session_id,
        url: spawn.url,
        route: spawn.route,
        tx,
        cancel,
    }
}

// === Agent ===

/// Shared collaborators of every frame agent.
#[derive(Clone)]
pub struct FrameContext {
    pub rules: Arc<PatchRules>,
    /// The connection-wide cache, used to seed frames found late
    pub cache: SharedCache,
    pub store: StoreHandle,
    pub favorites: FavoritesHandle,
    pub analytics: Analytics,
}

/// Result of one patch invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// No prices known yet
    NoData,
    /// Not the marketplace frame
    NotTarget,
    /// Body not attached; polling
    WaitingForBody,
    Applied { cards: usize, inserted: usize },
    Failed,
}

pub struct FrameAgent<D: FrameDriver> {
    frame_id: String,
    url: String,
    driver: D,
    ctx: FrameContext,
    notifier: mpsc::Sender<PageMessage>,
    cancel: CancellationToken,
    state: FrameState,
    prices: Arc<PriceMap>,
    details: Arc<DetailsMap>,
    /// Merged view of payloads relayed through the page
    relayed: MarketCache,
    settings: Settings,
    favorites: Arc<FxHashSet<String>>,
    repatch_at: Option<Instant>,
    body_poll_at: Option<Instant>,
}

impl<D: FrameDriver + 'static> FrameAgent<D> {
    pub fn new(
        frame_id: String,
        url: String,
        driver: D,
        ctx: FrameContext,
        notifier: mpsc::Sender<PageMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frame_id,
            url,
            driver,
            ctx,
            notifier,
            cancel,
            state: FrameState::Uninitialized,
            prices: Arc::new(PriceMap::default()),
            details: Arc::new(DetailsMap::default()),
            relayed: MarketCache::new(),
            settings: Settings::default(),
            favorites: Arc::new(FxHashSet::default()),
            repatch_at: None,
            body_poll_at: None,
        }
    }

    /// Spawn the agent; returns its inbox.
    pub fn spawn(self) -> mpsc::Sender<FrameMessage> {
        let (tx, rx) = mpsc::channel(FRAME_INBOX_CAPACITY);
        tokio::spawn(self.run(rx));
        tx
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<FrameMessage>) {
        debug!("[FRAME] {} agent started ({})", self.frame_id, self.url);
        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = wait_until(wake) => self.on_timer().await,
            }
        }
        debug!("[FRAME] {} agent stopped", self.frame_id);
    }

    fn next_wake(&self) -> Option<Instant> {
        match (self.repatch_at, self.body_poll_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        let body_due = self.body_poll_at.is_some_and(|t| t <= now);
        let repatch_due = self.repatch_at.is_some_and(|t| t <= now);
        if body_due {
            self.body_poll_at = None;
        }
        if repatch_due {
            self.repatch_at = None;
        }
        if body_due || repatch_due {
            self.invoke().await;
        }
    }

    pub async fn handle(&mut self, msg: FrameMessage) {
        match msg {
            FrameMessage::Render(payload) => self.on_render(payload).await,
            FrameMessage::MarketDataUpdate(update) => self.on_market_data(update).await,
            FrameMessage::Favorites(favorites) => {
                self.favorites = favorites;
                if self.state == FrameState::Active && is_target_frame(&self.url) {
                    let list: Vec<String> = self.favorites.iter().cloned().collect();
                    if let Err(e) = self.driver.sync_favorites(&list).await {
                        debug!("[FRAME] {} favorites sync failed: {:#}", self.frame_id, e);
                    }
                }
            }
            FrameMessage::Mutation(DomMutation::Inserted(node)) => {
                if self.prices.is_empty() || !is_target_frame(&self.url) {
                    return;
                }
                let relevant = serde_json::from_value::<DomNode>(node)
                    .map(|n| self.ctx.rules.mutation_is_relevant(&n))
                    .unwrap_or(false);
                if relevant {
                    self.schedule_repatch();
                }
            }
            FrameMessage::Mutation(DomMutation::DocumentUpdated) => {
                self.state = FrameState::Uninitialized;
                if !self.prices.is_empty() {
                    self.schedule_repatch();
                }
            }
            FrameMessage::Navigated(url) => {
                debug!("[FRAME] {} navigated to {}", self.frame_id, url);
                self.url = url;
                self.state = FrameState::Uninitialized;
                self.body_poll_at = None;
                if !self.prices.is_empty() {
                    self.schedule_repatch();
                }
            }
        }
    }

    async fn on_render(&mut self, payload: RenderPayload) {
        self.relayed = MarketCache::from_snapshot(&payload.snapshot);
        self.prices = payload.snapshot.prices;
        self.details = payload.snapshot.details;
        self.settings = payload.settings;
        self.favorites = payload.favorites;
        if self.settings.enabled {
            self.invoke().await;
        }
    }

    async fn on_market_data(&mut self, update: MarketDataUpdate) {
        let nodes = resolver::resolve(&update.data);
        if nodes.is_empty() {
            debug!("[FRAME] {} relayed payload has no items", self.frame_id);
            return;
        }
        self.relayed.merge(&nodes);
        self.prices = Arc::new(self.relayed.prices().clone());
        self.details = Arc::new(self.relayed.details().clone());
        info!(
            "[FRAME] 📨 {} received relayed market data: {} items ({} priced)",
            self.frame_id,
            nodes.len(),
            self.prices.len()
        );

        self.settings = self.ctx.store.load_settings().await;
        if !self.settings.enabled {
            return;
        }
        self.favorites = self.ctx.favorites.set().await;
        self.invoke().await;
    }

    fn schedule_repatch(&mut self) {
        self.repatch_at = Some(Instant::now() + ms(REPATCH_DEBOUNCE_MS));
    }

    /// Run the patch routine once against the live document.
    pub async fn invoke(&mut self) -> PatchOutcome {
        if self.prices.is_empty() {
            return PatchOutcome::NoData;
        }
        if !is_target_frame(&self.url) {
            return PatchOutcome::NotTarget;
        }

        let document = match self.driver.document().await {
            Ok(Some(document)) => document,
            Ok(None) => return self.wait_for_body(),
            Err(e) => {
                warn!("[FRAME] {} could not read document: {:#}", self.frame_id, e);
                return PatchOutcome::Failed;
            }
        };
        if document.body().is_none() {
            return self.wait_for_body();
        }
        if self.state != FrameState::Active {
            debug!("[FRAME] {} {} -> active", self.frame_id, self.state);
            self.state = FrameState::Active;
            self.body_poll_at = None;
        }

        let plan = plan_patch(
            &self.ctx.rules,
            &document,
            &self.prices,
            &self.details,
            &self.favorites,
            &self.settings,
        );
        debug!(
            "[FRAME] {} found {} cards ({} already patched, {} without prices)",
            self.frame_id, plan.cards_found, plan.already_patched, plan.unmatched
        );

        let mut inserted = 0;
        for patch in &plan.patches {
            match self.driver.insert_overlay(patch).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    let details = format!("{:#}", e);
                    warn!("[FRAME] {} overlay injection failed: {}", self.frame_id, details);
                    self.ctx.analytics.error_occurred("injection_failed", &details);
                    let note = ShowNotification::error("R6 Market Helper: failed to show prices on the marketplace");
                    if self.notifier.try_send(PageMessage::Notify(note)).is_err() {
                        debug!("[FRAME] {} page inbox unavailable, notification dropped", self.frame_id);
                    }
                    return PatchOutcome::Failed;
                }
            }
        }

        if inserted > 0 {
            info!("[FRAME] ✅ Injected prices for {} cards in {}", inserted, self.frame_id);
            self.ctx
                .analytics
                .prices_injected(inserted, self.settings.position, self.settings.format);
        }
        PatchOutcome::Applied {
            cards: plan.cards_found,
            inserted,
        }
    }

    fn wait_for_body(&mut self) -> PatchOutcome {
        if self.state != FrameState::WaitingForBody {
            debug!("[FRAME] {} waiting for body", self.frame_id);
        }
        self.state = FrameState::WaitingForBody;
        self.body_poll_at = Some(Instant::now() + ms(BODY_POLL_INTERVAL_MS));
        PatchOutcome::WaitingForBody
    }
}
