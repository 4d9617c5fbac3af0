//! Interception layer: debugging sessions per marketplace tab and the
//! GraphQL response bodies read through them.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cdp::{CdpClient, SessionId};
use crate::config::{log_payloads_enabled, FAVORITE_BINDING, MARKETPLACE_PAGE_MARKERS, TARGET_API_URL};
use crate::frame::{spawn_cdp_frame, DocumentScope, FrameContext, FrameSpawn};
use crate::messages::{AttachRequest, ShowNotification};
use crate::notify;
use crate::registry::{FrameRoute, SharedRegistry, TabHandle};
use crate::tab::{TabAgent, PAGE_INBOX_CAPACITY};

/// An `AttachRequest` for page targets showing the marketplace.
pub fn attach_request(target_info: &Value) -> Option<AttachRequest> {
    if target_info["type"].as_str() != Some("page") {
        return None;
    }
    let url = target_info["url"].as_str()?;
    if !MARKETPLACE_PAGE_MARKERS.iter().all(|marker| url.contains(marker)) {
        return None;
    }
    Some(AttachRequest {
        tab_id: target_info["targetId"].as_str()?.to_string(),
        url: url.to_string(),
    })
}

/// Request id of a `Network.responseReceived` for the marketplace API.
pub fn target_request_id(params: &Value) -> Option<&str> {
    let url = params["response"]["url"].as_str()?;
    if !url.contains(TARGET_API_URL) {
        return None;
    }
    params["requestId"].as_str()
}

/// Decode a `Network.getResponseBody` result. `None` for an empty body.
pub fn decode_body(body: &str, base64_encoded: bool) -> Result<Option<Value>> {
    let text = if base64_encoded {
        let bytes = STANDARD.decode(body).context("Response body is not valid base64")?;
        String::from_utf8(bytes).context("Response body is not UTF-8")?
    } else {
        body.to_string()
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(&text).context("Malformed GraphQL response")?;
    Ok(Some(value))
}

/// Read and parse a finished response body.
///
/// Command failures and empty bodies are `Ok(None)`; only a body that is
/// present but unparseable is an error.
pub async fn fetch_payload(cdp: &CdpClient, session: &str, request_id: &str) -> Result<Option<Value>> {
    let body = match cdp
        .call("Network.getResponseBody", json!({ "requestId": request_id }), Some(session))
        .await
    {
        Ok(body) => body,
        Err(e) => {
            debug!("[INTERCEPT] No body for {}: {}", request_id, e);
            return Ok(None);
        }
    };

    let text = body["body"].as_str().unwrap_or_default();
    let base64_encoded = body["base64Encoded"].as_bool().unwrap_or(false);
    let payload = decode_body(text, base64_encoded)?;

    match &payload {
        Some(value) if log_payloads_enabled() => info!("[INTERCEPT] Payload {}: {}", request_id, value),
        Some(_) => debug!("[INTERCEPT] Payload {} ({} bytes)", request_id, text.len()),
        None => debug!("[INTERCEPT] Empty body for {}", request_id),
    }
    Ok(payload)
}

/// Attaches and detaches debugging sessions.
#[derive(Clone)]
pub struct Interceptor {
    cdp: CdpClient,
    registry: SharedRegistry,
    ctx: FrameContext,
}

impl Interceptor {
    pub fn new(cdp: CdpClient, registry: SharedRegistry, ctx: FrameContext) -> Self {
        Self { cdp, registry, ctx }
    }

    /// Attach to a tab once. Subsequent requests for the same tab are no-ops.
    pub async fn attach(&self, req: AttachRequest) -> Result<()> {
        if !self.registry.write().await.begin_attach(&req.tab_id) {
            debug!("[INTERCEPT] {} already attached", req.tab_id);
            return Ok(());
        }

        let attached = self
            .cdp
            .call(
                "Target.attachToTarget",
                json!({ "targetId": req.tab_id, "flatten": true }),
                None,
            )
            .await;
        let session_id = match attached
            .map_err(|e| anyhow!(e))
            .and_then(|v| v["sessionId"].as_str().map(str::to_string).ok_or_else(|| anyhow!("no sessionId")))
        {
            Ok(session_id) => session_id,
            Err(e) => {
                // No session means no page to show a toast in.
                self.registry.write().await.abort_attach(&req.tab_id);
                error!("[INTERCEPT] ❌ Failed to attach to {}: {:#}", req.tab_id, e);
                self.ctx.analytics.error_occurred("debugger_attach_failed", &format!("{:#}", e));
                return Err(e.context(format!("attach to {}", req.tab_id)));
            }
        };

        if let Err(e) = self.enable_session(&session_id).await {
            self.registry.write().await.abort_attach(&req.tab_id);
            self.ctx.analytics.error_occurred("debugger_enable_failed", &format!("{:#}", e));
            notify::show(
                &self.cdp,
                &session_id,
                &ShowNotification::error("R6 Market Helper: could not start watching marketplace traffic"),
            )
            .await;
            self.release(&session_id).await;
            return Err(e.context(format!("enable domains on {}", req.tab_id)));
        }

        let cancel = CancellationToken::new();
        let (page_tx, page_rx) = mpsc::channel(PAGE_INBOX_CAPACITY);
        let top = spawn_cdp_frame(
            &self.cdp,
            &self.ctx,
            FrameSpawn {
                frame_id: req.tab_id.clone(),
                session_id: session_id.clone(),
                url: req.url.clone(),
                route: FrameRoute::Direct,
                scope: DocumentScope::Root,
            },
            page_tx.clone(),
            &cancel,
        );
        let mut frames = FxHashMap::default();
        frames.insert(top.frame_id.clone(), top);

        {
            let mut registry = self.registry.write().await;
            if !registry.is_attaching(&req.tab_id) {
                drop(registry);
                debug!("[INTERCEPT] {} went away while attaching", req.tab_id);
                cancel.cancel();
                self.release(&session_id).await;
                return Ok(());
            }
            registry.insert_tab(TabHandle {
                tab_id: req.tab_id.clone(),
                session_id: session_id.clone(),
                url: req.url.clone(),
                page_tx: page_tx.clone(),
                frames,
                cancel: cancel.clone(),
            });
        }

        let agent = TabAgent::new(
            req.tab_id.clone(),
            session_id.clone(),
            self.cdp.clone(),
            self.registry.clone(),
            self.ctx.clone(),
            page_tx,
            cancel,
        );
        tokio::spawn(agent.run(page_rx));

        info!("[INTERCEPT] 🔌 Attached to {} ({})", req.tab_id, req.url);
        self.ctx.analytics.debugger_attached();
        self.ctx.analytics.page_visited(&req.url);
        Ok(())
    }

    /// Forget a tab and stop everything it owns. Safe for unknown tabs.
    pub async fn detach(&self, tab_id: &str) {
        let removed = self.registry.write().await.remove_tab(tab_id);
        let Some(tab) = removed else {
            return;
        };
        tab.cancel.cancel();
        info!("[INTERCEPT] Detached from {}", tab_id);
        self.release(&tab.session_id).await;
    }

    /// Enable an auto-attached out-of-process frame and start its agent.
    pub async fn attach_frame(&self, tab_id: &str, session_id: SessionId, target_info: &Value) -> Result<()> {
        let frame_id = target_info["targetId"]
            .as_str()
            .context("attached frame has no targetId")?
            .to_string();
        let url = target_info["url"].as_str().unwrap_or_default().to_string();

        self.enable_session(&session_id)
            .await
            .with_context(|| format!("enable domains on frame {}", frame_id))?;

        let mut registry = self.registry.write().await;
        let Some(tab) = registry.tab(tab_id) else {
            return Ok(());
        };
        let handle = spawn_cdp_frame(
            &self.cdp,
            &self.ctx,
            FrameSpawn {
                frame_id: frame_id.clone(),
                session_id,
                url: url.clone(),
                route: FrameRoute::Direct,
                scope: DocumentScope::Root,
            },
            tab.page_tx.clone(),
            &tab.cancel,
        );
        registry.add_frame(tab_id, handle);
        info!("[INTERCEPT] 🧩 Frame {} of {} has its own session: {}", frame_id, tab_id, url);
        Ok(())
    }

    async fn enable_session(&self, session: &str) -> Result<()> {
        let commands = [
            ("Network.enable", json!({})),
            ("Page.enable", json!({})),
            ("DOM.enable", json!({})),
            ("Runtime.enable", json!({})),
            ("Runtime.addBinding", json!({ "name": FAVORITE_BINDING })),
            (
                "Target.setAutoAttach",
                json!({ "autoAttach": true, "waitForDebuggerOnStart": false, "flatten": true }),
            ),
        ];
        for (method, params) in commands {
            self.cdp
                .call(method, params, Some(session))
                .await
                .with_context(|| format!("{} failed", method))?;
        }
        Ok(())
    }

    async fn release(&self, session: &str) {
        if let Err(e) = self
            .cdp
            .call("Target.detachFromTarget", json!({ "sessionId": session }), None)
            .await
        {
            if !matches!(e, crate::cdp::CdpError::Disconnected) {
                warn!("[INTERCEPT] detachFromTarget {}: {}", session, e);
            }
        }
    }
}
