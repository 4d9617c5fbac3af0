//! Bookkeeping of attached tabs, their sessions and their frame agents.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cdp::{SessionId, TargetId};
use crate::messages::{FrameMessage, PageMessage};
use crate::patch::is_target_frame;

pub type SharedRegistry = Arc<RwLock<TabRegistry>>;

/// How a frame agent is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRoute {
    /// The frame has its own session (top document or out-of-process iframe)
    Direct,
    /// The frame is only reachable through the page's session
    Relayed,
}

#[derive(Debug, Clone)]
pub struct FrameHandle {
    pub frame_id: String,
    pub session_id: SessionId,
    pub url: String,
    pub route: FrameRoute,
    pub tx: mpsc::Sender<FrameMessage>,
    pub cancel: CancellationToken,
}

impl FrameHandle {
    pub fn is_target(&self) -> bool {
        is_target_frame(&self.url)
    }
}

#[derive(Debug)]
pub struct TabHandle {
    pub tab_id: TargetId,
    pub session_id: SessionId,
    pub url: String,
    pub page_tx: mpsc::Sender<PageMessage>,
    pub frames: FxHashMap<String, FrameHandle>,
    /// Parent of every timer and agent belonging to the tab
    pub cancel: CancellationToken,
}

/// Which tab (and frame, for out-of-process frames) a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOwner {
    pub tab_id: TargetId,
    /// `None` for the page session itself
    pub frame_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct TabRegistry {
    tabs: FxHashMap<TargetId, TabHandle>,
    sessions: FxHashMap<SessionId, SessionOwner>,
    attaching: FxHashSet<TargetId>,
}

impl TabRegistry {
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Reserve a tab for attaching. False when it is attached or being attached.
    pub fn begin_attach(&mut self, tab_id: &str) -> bool {
        if self.tabs.contains_key(tab_id) {
            return false;
        }
        self.attaching.insert(tab_id.to_string())
    }

    pub fn abort_attach(&mut self, tab_id: &str) {
        self.attaching.remove(tab_id);
    }

    /// Still reserved; false once the tab was detached mid-attach.
    pub fn is_attaching(&self, tab_id: &str) -> bool {
        self.attaching.contains(tab_id)
    }

    pub fn insert_tab(&mut self, tab: TabHandle) {
        self.attaching.remove(&tab.tab_id);
        self.sessions.insert(
            tab.session_id.clone(),
            SessionOwner {
                tab_id: tab.tab_id.clone(),
                frame_id: None,
            },
        );
        self.tabs.insert(tab.tab_id.clone(), tab);
    }

    /// Forget a tab and every session of its frames.
    pub fn remove_tab(&mut self, tab_id: &str) -> Option<TabHandle> {
        self.attaching.remove(tab_id);
        let tab = self.tabs.remove(tab_id)?;
        self.sessions.retain(|_, owner| owner.tab_id != tab_id);
        Some(tab)
    }

    pub fn tab(&self, tab_id: &str) -> Option<&TabHandle> {
        self.tabs.get(tab_id)
    }

    pub fn tab_mut(&mut self, tab_id: &str) -> Option<&mut TabHandle> {
        self.tabs.get_mut(tab_id)
    }

    pub fn tabs(&self) -> impl Iterator<Item = &TabHandle> {
        self.tabs.values()
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_attached(&self, tab_id: &str) -> bool {
        self.tabs.contains_key(tab_id)
    }

    pub fn owner_of(&self, session_id: &str) -> Option<&SessionOwner> {
        self.sessions.get(session_id)
    }

    pub fn add_frame(&mut self, tab_id: &str, frame: FrameHandle) -> bool {
        let Some(tab) = self.tabs.get_mut(tab_id) else {
            return false;
        };
        if frame.route == FrameRoute::Direct && frame.session_id != tab.session_id {
            self.sessions.insert(
                frame.session_id.clone(),
                SessionOwner {
                    tab_id: tab_id.to_string(),
                    frame_id: Some(frame.frame_id.clone()),
                },
            );
        }
        if let Some(previous) = tab.frames.insert(frame.frame_id.clone(), frame) {
            previous.cancel.cancel();
        }
        true
    }

    pub fn remove_frame(&mut self, tab_id: &str, frame_id: &str) -> Option<FrameHandle> {
        let frame = self.tabs.get_mut(tab_id)?.frames.remove(frame_id)?;
        frame.cancel.cancel();
        if self.sessions.get(&frame.session_id).and_then(|o| o.frame_id.as_deref()) == Some(frame_id) {
            self.sessions.remove(&frame.session_id);
        }
        Some(frame)
    }

    pub fn frame(&self, tab_id: &str, frame_id: &str) -> Option<&FrameHandle> {
        self.tabs.get(tab_id)?.frames.get(frame_id)
    }

    pub fn set_frame_url(&mut self, tab_id: &str, frame_id: &str, url: &str) -> Option<&FrameHandle> {
        let frame = self.tabs.get_mut(tab_id)?.frames.get_mut(frame_id)?;
        frame.url = url.to_string();
        Some(frame)
    }

    /// True once any frame of the tab is the embedded marketplace.
    pub fn has_target_frame(&self, tab_id: &str) -> bool {
        self.tabs
            .get(tab_id)
            .map(|tab| tab.frames.values().any(FrameHandle::is_target))
            .unwrap_or(false)
    }

    /// Inboxes of frames that accept direct injection.
    pub fn direct_frames(&self, tab_id: &str) -> Vec<FrameHandle> {
        self.frames_where(tab_id, |f| f.route == FrameRoute::Direct)
    }

    pub fn relayed_frames(&self, tab_id: &str) -> Vec<FrameHandle> {
        self.frames_where(tab_id, |f| f.route == FrameRoute::Relayed)
    }

    /// Frame agents whose DOM events arrive on `session_id`.
    pub fn frames_on_session(&self, session_id: &str) -> Vec<FrameHandle> {
        let Some(owner) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        self.frames_where(&owner.tab_id, |f| f.session_id == session_id)
    }

    /// Every frame inbox across all tabs.
    pub fn all_frames(&self) -> Vec<FrameHandle> {
        self.tabs
            .values()
            .flat_map(|tab| tab.frames.values().cloned())
            .collect()
    }

    fn frames_where<F>(&self, tab_id: &str, keep: F) -> Vec<FrameHandle>
    where
        F: Fn(&FrameHandle) -> bool,
    {
        self.tabs
            .get(tab_id)
            .map(|tab| tab.frames.values().filter(|f| keep(f)).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: &str, session: &str) -> TabHandle {
        let (page_tx, _rx) = mpsc::channel(1);
        TabHandle {
            tab_id: id.into(),
            session_id: session.into(),
            url: "https://www.ubisoft.com/marketplace".into(),
            page_tx,
            frames: FxHashMap::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn frame(id: &str, session: &str, url: &str, route: FrameRoute) -> FrameHandle {
        let (tx, _rx) = mpsc::channel(1);
        FrameHandle {
            frame_id: id.into(),
            session_id: session.into(),
            url: url.into(),
            route,
            tx,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_attach_is_reserved_once() {
        let mut registry = TabRegistry::default();
        assert!(registry.begin_attach("T1"));
        assert!(!registry.begin_attach("T1"));
        assert!(registry.is_attaching("T1"));
        registry.insert_tab(tab("T1", "S1"));
        assert!(!registry.is_attaching("T1"));
        assert!(!registry.begin_attach("T1"));
        assert!(registry.remove_tab("T1").is_some());
        assert!(registry.remove_tab("T1").is_none());
        assert!(registry.begin_attach("T1"));
    }

    #[test]
    fn test_frame_sessions_route_to_their_tab() {
        let mut registry = TabRegistry::default();
        registry.insert_tab(tab("T1", "S1"));
        registry.add_frame("T1", frame("top", "S1", "https://www.ubisoft.com/", FrameRoute::Direct));
        registry.add_frame(
            "T1",
            frame("F1", "S2", "https://overlay.cdn.ubisoft.com/?microApp=marketplace", FrameRoute::Direct),
        );

        assert!(registry.has_target_frame("T1"));
        assert_eq!(registry.owner_of("S2").unwrap().frame_id.as_deref(), Some("F1"));
        assert_eq!(registry.owner_of("S1").unwrap().frame_id, None);
        assert_eq!(registry.frames_on_session("S1").len(), 1);
        assert_eq!(registry.direct_frames("T1").len(), 2);

        let removed = registry.remove_frame("T1", "F1").unwrap();
        assert!(removed.cancel.is_cancelled());
        assert!(registry.owner_of("S2").is_none());
        assert!(!registry.has_target_frame("T1"));
    }

    #[test]
    fn test_remove_tab_drops_frame_sessions() {
        let mut registry = TabRegistry::default();
        registry.insert_tab(tab("T1", "S1"));
        registry.add_frame("T1", frame("F1", "S2", "about:blank", FrameRoute::Direct));
        registry.add_frame("T1", frame("F2", "S1", "about:blank", FrameRoute::Relayed));
        registry.remove_tab("T1");
        assert!(registry.owner_of("S1").is_none());
        assert!(registry.owner_of("S2").is_none());
        assert!(registry.all_frames().is_empty());
    }
}
