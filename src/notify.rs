//! Toast notifications rendered in the top-level page.

use serde_json::json;
use tracing::{error, info, warn};

use crate::cdp::CdpClient;
use crate::messages::{Severity, ShowNotification};

const TOAST_CONTAINER_ID: &str = "r6-market-helper-notifications";

/// Toast renderer, evaluated with the notification JSON as its only argument.
const TOAST_FUNCTION: &str = r#"function (note, containerId) {
  const doc = this.ownerDocument || this;
  const root = doc.body || doc.documentElement;
  if (!root) return false;
  let container = doc.getElementById(containerId);
  if (!container) {
    container = doc.createElement('div');
    container.id = containerId;
    container.style.cssText = 'position: fixed; top: 20px; right: 20px; z-index: 2147483647; pointer-events: none; font-family: "Ubisoft Sans", Arial, sans-serif;';
    root.appendChild(container);
  }
  const colors = { info: '#3498db', success: '#27ae60', warning: '#f39c12', error: '#e74c3c' };
  const icons = { info: 'ℹ️', success: '✅', warning: '⚠️', error: '❌' };
  const toast = doc.createElement('div');
  toast.style.cssText = 'background: rgba(0, 0, 0, 0.9); color: white; padding: 12px 16px; border-radius: 6px; margin-bottom: 10px; max-width: 300px; font-size: 13px; line-height: 1.4; pointer-events: auto; border-left: 4px solid ' + (colors[note.severity] || colors.info) + '; transition: opacity 0.3s ease-out;';
  const icon = doc.createElement('span');
  icon.textContent = (icons[note.severity] || icons.info) + ' ';
  const text = doc.createElement('span');
  text.textContent = note.message;
  toast.appendChild(icon);
  toast.appendChild(text);
  const hide = () => {
    toast.style.opacity = '0';
    setTimeout(() => toast.remove(), 300);
  };
  toast.addEventListener('click', hide);
  container.appendChild(toast);
  setTimeout(hide, note.durationMs);
  return true;
}"#;

/// Log a notification and render it in the page behind `session`.
pub async fn show(cdp: &CdpClient, session: &str, note: &ShowNotification) {
    match note.severity {
        Severity::Error => error!("[NOTIFY] {}", note.message),
        Severity::Warning => warn!("[NOTIFY] {}", note.message),
        _ => info!("[NOTIFY] {}", note.message),
    }

    let document = match cdp
        .call("Runtime.evaluate", json!({ "expression": "document" }), Some(session))
        .await
    {
        Ok(result) => result["result"]["objectId"].as_str().map(str::to_string),
        Err(e) => {
            warn!("[NOTIFY] Could not reach page: {}", e);
            return;
        }
    };
    let Some(object_id) = document else {
        warn!("[NOTIFY] Page has no document yet");
        return;
    };

    let params = json!({
        "objectId": object_id,
        "functionDeclaration": TOAST_FUNCTION,
        "arguments": [{ "value": note }, { "value": TOAST_CONTAINER_ID }],
        "returnByValue": true,
    });
    if let Err(e) = cdp.call("Runtime.callFunctionOn", params, Some(session)).await {
        warn!("[NOTIFY] Failed to render notification: {}", e);
    }
}
