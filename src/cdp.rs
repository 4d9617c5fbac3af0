//! Chrome DevTools Protocol client.
//!
//! One websocket to the browser endpoint carries every session in flat mode:
//! commands are `{id, method, params, sessionId?}`, responses echo the id,
//! and events carry a `method` plus the `sessionId` they belong to. The I/O
//! task correlates responses with pending calls and fans events out on a
//! broadcast channel.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    ms, CDP_COMMAND_TIMEOUT_MS, CDP_PING_INTERVAL_SECS, CDP_STALE_AFTER_SECS,
};

pub type SessionId = String;
pub type TargetId = String;

/// Event fan-out capacity; slow subscribers see `Lagged` and skip ahead
const EVENT_CHANNEL_CAPACITY: usize = 4096;

// === Errors ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdpError {
    /// The browser rejected the command
    Protocol { code: i64, message: String },
    /// No response within the command timeout
    Timeout { method: String },
    /// The websocket is gone
    Disconnected,
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdpError::Protocol { code, message } => write!(f, "protocol error {}: {}", code, message),
            CdpError::Timeout { method } => write!(f, "{} timed out", method),
            CdpError::Disconnected => write!(f, "devtools connection closed"),
        }
    }
}

impl std::error::Error for CdpError {}

// === Wire types ===

#[derive(Serialize)]
struct Outgoing<'a> {
    id: u64,
    method: &'a str,
    params: &'a Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
struct ProtocolError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct Incoming {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<ProtocolError>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// An unsolicited protocol notification.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    /// Session the event was raised on; `None` for browser-level events
    pub session_id: Option<SessionId>,
}

impl CdpEvent {
    /// String field of `params`
    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }
}

type PendingMap = FxHashMap<u64, oneshot::Sender<Result<Value, CdpError>>>;
type Pending = Arc<Mutex<PendingMap>>;

// === Client ===

/// Cloneable handle to one DevTools connection.
#[derive(Clone)]
pub struct CdpClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<CdpEvent>,
    closed: CancellationToken,
}

impl CdpClient {
    /// Connect to a browser websocket and spawn the I/O task.
    ///
    /// The returned handle finishes when the connection closes or goes stale.
    pub async fn connect(ws_url: &str) -> Result<(Self, JoinHandle<()>)> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .with_context(|| format!("Failed to connect to {}", ws_url))?;
        info!("[CDP] Connected to {}", ws_url);

        let (client, outgoing_rx) = Self::detached();
        let io = IoLoop {
            pending: client.pending.clone(),
            events: client.events.clone(),
            closed: client.closed.clone(),
        };
        let handle = tokio::spawn(io.run(ws_stream, outgoing_rx));
        Ok((client, handle))
    }

    /// A client with no transport; the caller owns the outgoing queue.
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                outgoing: tx,
                pending: Arc::new(Mutex::new(FxHashMap::default())),
                next_id: Arc::new(AtomicU64::new(1)),
                events,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Route one raw message as if the browser had sent it.
    #[cfg(test)]
    pub(crate) fn deliver(&self, text: &str) -> Result<()> {
        dispatch_incoming(text, &self.pending, &self.events)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Cancelled once the connection is gone
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a command and wait for its result.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session: Option<&str>,
    ) -> Result<Value, CdpError> {
        if self.is_closed() {
            return Err(CdpError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&Outgoing {
            id,
            method,
            params: &params,
            session_id: session,
        })
        .map_err(|e| CdpError::Protocol {
            code: -1,
            message: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id, tx);

        if self.outgoing.send(text).is_err() {
            self.pending_map().remove(&id);
            return Err(CdpError::Disconnected);
        }

        match tokio::time::timeout(ms(CDP_COMMAND_TIMEOUT_MS), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::Disconnected),
            Err(_) => {
                self.pending_map().remove(&id);
                Err(CdpError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    fn pending_map(&self) -> MutexGuard<'_, PendingMap> {
        lock_pending(&self.pending)
    }
}

fn lock_pending(pending: &Pending) -> MutexGuard<'_, PendingMap> {
    // Recover from poisoning; the map holds no invariants across entries.
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Route one text frame: resolve a pending call or broadcast an event.
fn dispatch_incoming(text: &str, pending: &Pending, events: &broadcast::Sender<CdpEvent>) -> Result<()> {
    let incoming: Incoming = serde_json::from_str(text).context("Malformed devtools message")?;

    if let Some(id) = incoming.id {
        let waiter = lock_pending(pending).remove(&id);
        let Some(waiter) = waiter else {
            debug!("[CDP] Response for unknown or expired id {}", id);
            return Ok(());
        };
        let outcome = match incoming.error {
            Some(e) => Err(CdpError::Protocol {
                code: e.code,
                message: e.message,
            }),
            None => Ok(incoming.result.unwrap_or(Value::Null)),
        };
        let _ = waiter.send(outcome);
        return Ok(());
    }

    if let Some(method) = incoming.method {
        // No subscribers is fine: nothing has attached yet.
        let _ = events.send(CdpEvent {
            method,
            params: incoming.params,
            session_id: incoming.session_id,
        });
    }
    Ok(())
}

/// At most `max_chars` characters of `text`, for log lines.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(end, _)| &text[..end])
}

/// Marks the connection closed when the I/O task ends, including by panic
/// or abort. Dropping the pending senders wakes every waiter with
/// `Disconnected`.
struct CloseOnDrop {
    pending: Pending,
    closed: CancellationToken,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.closed.cancel();
        lock_pending(&self.pending).clear();
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct IoLoop {
    pending: Pending,
    events: broadcast::Sender<CdpEvent>,
    closed: CancellationToken,
}

impl IoLoop {
    async fn run(self, ws_stream: WsStream, mut outgoing_rx: mpsc::UnboundedReceiver<String>) {
        let _close = CloseOnDrop {
            pending: self.pending.clone(),
            closed: self.closed.clone(),
        };
        let (mut write, mut read) = ws_stream.split();
        let mut ping_interval = interval(Duration::from_secs(CDP_PING_INTERVAL_SECS));
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        error!("[CDP] Failed to send ping: {}", e);
                        break;
                    }
                }

                out = outgoing_rx.recv() => {
                    let Some(text) = out else { break };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!("[CDP] Failed to send command: {}", e);
                        break;
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_message = Instant::now();
                            if let Err(e) = dispatch_incoming(&text, &self.pending, &self.events) {
                                warn!("[CDP] {}: {}", e, preview(&text, 200));
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                            last_message = Instant::now();
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_message = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("[CDP] Browser closed the connection: {:?}", frame);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("[CDP] WebSocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("[CDP] Stream ended");
                            break;
                        }
                        _ => {}
                    }
                }
            }

            if last_message.elapsed() > Duration::from_secs(CDP_STALE_AFTER_SECS) {
                warn!("[CDP] Stale connection, closing");
                break;
            }
        }
    }
}

// === Endpoint discovery ===

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
    #[serde(rename = "Browser", default)]
    browser: String,
}

/// Resolve the browser websocket URL from the DevTools HTTP endpoint.
pub async fn discover_ws_url(http_url: &str) -> Result<String> {
    let url = format!("{}/json/version", http_url.trim_end_matches('/'));
    let info: VersionInfo = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .with_context(|| format!("DevTools endpoint unreachable at {}", url))?
        .error_for_status()?
        .json()
        .await
        .context("Unexpected /json/version response")?;
    info!("[CDP] Browser: {}", if info.browser.is_empty() { "unknown" } else { &info.browser });
    Ok(info.web_socket_debugger_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_response_resolves_pending_call() {
        let (client, mut outgoing) = CdpClient::detached();
        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .call("DOM.getDocument", json!({"depth": -1}), Some("S1"))
                .await
        });

        let sent = outgoing.recv().await.unwrap();
        let sent: Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(sent["method"], "DOM.getDocument");
        assert_eq!(sent["sessionId"], "S1");

        let reply = json!({"id": sent["id"], "result": {"root": {"nodeId": 1}}}).to_string();
        dispatch_incoming(&reply, &client.pending, &client.events).unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["root"]["nodeId"], 1);
    }

    #[tokio::test]
    async fn test_protocol_error_is_surfaced() {
        let (client, mut outgoing) = CdpClient::detached();
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("Network.enable", json!({}), None).await });

        let sent: Value = serde_json::from_str(&outgoing.recv().await.unwrap()).unwrap();
        let reply = json!({"id": sent["id"], "error": {"code": -32000, "message": "Not allowed"}});
        dispatch_incoming(&reply.to_string(), &client.pending, &client.events).unwrap();

        assert_eq!(
            call.await.unwrap(),
            Err(CdpError::Protocol {
                code: -32000,
                message: "Not allowed".into()
            })
        );
    }

    #[tokio::test]
    async fn test_events_are_broadcast_with_session() {
        let (client, _outgoing) = CdpClient::detached();
        let mut events = client.subscribe();
        let raw = json!({
            "method": "Network.responseReceived",
            "params": {"requestId": "r1"},
            "sessionId": "S9"
        });
        dispatch_incoming(&raw.to_string(), &client.pending, &client.events).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "Network.responseReceived");
        assert_eq!(event.session_id.as_deref(), Some("S9"));
        assert_eq!(event.str_param("requestId"), Some("r1"));
    }

    #[tokio::test]
    async fn test_closed_client_fails_fast() {
        let (client, _outgoing) = CdpClient::detached();
        client.closed.cancel();
        assert_eq!(
            client.call("Page.enable", json!({}), None).await,
            Err(CdpError::Disconnected)
        );
    }

    #[test]
    fn test_preview_cuts_on_char_boundary() {
        let text = format!("{{\"id\":\"{}é tail\"}}", "x".repeat(192));
        assert!(!text.is_char_boundary(200));
        let cut = preview(&text, 200);
        assert_eq!(cut.chars().count(), 200);
        assert!(cut.ends_with('é'));
        assert_eq!(preview("short", 200), "short");
    }

    #[tokio::test]
    async fn test_io_task_panic_still_closes_connection() {
        let (client, mut outgoing) = CdpClient::detached();
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("DOM.enable", json!({}), None).await });
        outgoing.recv().await.unwrap();

        let guard = CloseOnDrop {
            pending: client.pending.clone(),
            closed: client.closed.clone(),
        };
        let io = tokio::spawn(async move {
            let _close = guard;
            panic!("io task failed");
        });
        assert!(io.await.is_err());

        assert!(client.is_closed());
        assert_eq!(call.await.unwrap(), Err(CdpError::Disconnected));
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        let (client, _outgoing) = CdpClient::detached();
        assert!(dispatch_incoming("not json", &client.pending, &client.events).is_err());
    }
}
