//! Relay stage: push the whole cache into every directly reachable frame of a tab.

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cache::SharedCache;
use crate::config::{ms, RELAY_RETRY_DELAY_MS};
use crate::favorites::FavoritesHandle;
use crate::messages::{FrameMessage, PageMessage, RenderPayload, ShowNotification};
use crate::registry::SharedRegistry;
use crate::types::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Price display is switched off
    Disabled,
    /// The tab detached before delivery
    TabGone,
    Delivered {
        frames: usize,
        /// Target frames whose agent could not be reached
        failed: usize,
    },
}

#[derive(Clone)]
pub struct Relay {
    registry: SharedRegistry,
    cache: SharedCache,
    favorites: FavoritesHandle,
}

impl Relay {
    pub fn new(registry: SharedRegistry, cache: SharedCache, favorites: FavoritesHandle) -> Self {
        Self {
            registry,
            cache,
            favorites,
        }
    }

    /// Send a render request to every direct frame of `tab_id`.
    ///
    /// When the marketplace frame is not registered yet the relay waits once
    /// for `RELAY_RETRY_DELAY_MS` and then delivers to whatever is there.
    pub async fn relay(&self, tab_id: &str, settings: Settings) -> RelayOutcome {
        if !settings.enabled {
            debug!("[RELAY] Disabled, skipping {}", tab_id);
            return RelayOutcome::Disabled;
        }

        let (tab_cancel, has_target) = {
            let registry = self.registry.read().await;
            let Some(tab) = registry.tab(tab_id) else {
                return RelayOutcome::TabGone;
            };
            (tab.cancel.clone(), registry.has_target_frame(tab_id))
        };
        if !has_target {
            debug!("[RELAY] No marketplace frame in {} yet, retrying once", tab_id);
            tokio::select! {
                _ = tab_cancel.cancelled() => return RelayOutcome::TabGone,
                _ = sleep(ms(RELAY_RETRY_DELAY_MS)) => {}
            }
        }

        let snapshot = self.cache.read().await.snapshot();
        let favorites = self.favorites.set().await;
        let (frames, page_tx) = {
            let registry = self.registry.read().await;
            let Some(tab) = registry.tab(tab_id) else {
                return RelayOutcome::TabGone;
            };
            (registry.direct_frames(tab_id), tab.page_tx.clone())
        };

        let payload = RenderPayload {
            snapshot,
            settings,
            favorites,
        };
        let mut failed = 0;
        for frame in &frames {
            if frame.tx.send(FrameMessage::Render(payload.clone())).await.is_err() && frame.is_target() {
                warn!("[RELAY] Marketplace frame {} is unreachable", frame.frame_id);
                failed += 1;
            }
        }
        if failed > 0 {
            let note = ShowNotification::error("R6 Market Helper: could not reach the marketplace frame");
            if page_tx.try_send(PageMessage::Notify(note)).is_err() {
                debug!("[RELAY] Page inbox of {} unavailable, notification dropped", tab_id);
            }
        }

        info!(
            "[RELAY] 📤 Sent {} prices to {} frames of {}",
            payload.snapshot.prices.len(),
            frames.len(),
            tab_id
        );
        RelayOutcome::Delivered {
            frames: frames.len(),
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MarketCache;
    use crate::registry::{FrameHandle, FrameRoute, TabHandle, TabRegistry};
    use crate::storage::open_store;
    use rustc_hash::FxHashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, RwLock};
    use tokio_util::sync::CancellationToken;

    const TARGET_URL: &str = "https://overlay.cdn.ubisoft.com/app?microApp=marketplace";

    fn frame(id: &str, url: &str, route: FrameRoute) -> (FrameHandle, mpsc::Receiver<FrameMessage>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = FrameHandle {
            frame_id: id.into(),
            session_id: "S1".into(),
            url: url.into(),
            route,
            tx,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    async fn setup(frames: Vec<FrameHandle>) -> (Relay, SharedRegistry, mpsc::Receiver<PageMessage>, CancellationToken) {
        let registry = TabRegistry::shared();
        let (page_tx, page_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        {
            let mut r = registry.write().await;
            r.insert_tab(TabHandle {
                tab_id: "T1".into(),
                session_id: "S1".into(),
                url: "https://www.ubisoft.com/marketplace".into(),
                page_tx,
                frames: FxHashMap::default(),
                cancel: cancel.clone(),
            });
            for f in frames {
                r.add_frame("T1", f);
            }
        }
        let store = open_store(":memory:").unwrap();
        let relay = Relay::new(
            registry.clone(),
            Arc::new(RwLock::new(MarketCache::new())),
            FavoritesHandle::spawn(store),
        );
        (relay, registry, page_rx, cancel)
    }

    #[tokio::test]
    async fn test_disabled_settings_skip_relay() {
        let (relay, _registry, _page_rx, _cancel) = setup(vec![]).await;
        let settings = Settings {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(relay.relay("T1", settings).await, RelayOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_render_goes_to_direct_frames_only() {
        let (top, mut top_rx) = frame("T1", "https://www.ubisoft.com/marketplace", FrameRoute::Direct);
        let (target, mut target_rx) = frame("F1", TARGET_URL, FrameRoute::Direct);
        let (relayed, mut relayed_rx) = frame("F2", TARGET_URL, FrameRoute::Relayed);
        let (relay, _registry, _page_rx, _cancel) = setup(vec![top, target, relayed]).await;

        let outcome = relay.relay("T1", Settings::default()).await;
        assert_eq!(outcome, RelayOutcome::Delivered { frames: 2, failed: 0 });
        assert!(matches!(top_rx.try_recv(), Ok(FrameMessage::Render(_))));
        assert!(matches!(target_rx.try_recv(), Ok(FrameMessage::Render(_))));
        assert!(relayed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_target_frame_notifies() {
        let (target, target_rx) = frame("F1", TARGET_URL, FrameRoute::Direct);
        drop(target_rx);
        let (relay, _registry, mut page_rx, _cancel) = setup(vec![target]).await;

        let outcome = relay.relay("T1", Settings::default()).await;
        assert_eq!(outcome, RelayOutcome::Delivered { frames: 1, failed: 1 });
        assert!(matches!(page_rx.try_recv(), Ok(PageMessage::Notify(_))));
    }

    #[tokio::test]
    async fn test_failure_notice_to_closed_page_is_dropped() {
        let (target, target_rx) = frame("F1", TARGET_URL, FrameRoute::Direct);
        drop(target_rx);
        let (relay, _registry, page_rx, _cancel) = setup(vec![target]).await;
        drop(page_rx);

        let outcome = relay.relay("T1", Settings::default()).await;
        assert_eq!(outcome, RelayOutcome::Delivered { frames: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_retry_wait_ends_with_the_tab() {
        let (top, _top_rx) = frame("T1", "https://www.ubisoft.com/marketplace", FrameRoute::Direct);
        let (relay, _registry, _page_rx, cancel) = setup(vec![top]).await;

        let canceller = tokio::spawn(async move {
            sleep(ms(50)).await;
            cancel.cancel();
        });
        assert_eq!(relay.relay("T1", Settings::default()).await, RelayOutcome::TabGone);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_reaches_frame_registered_during_wait() {
        let (top, mut top_rx) = frame("T1", "https://www.ubisoft.com/marketplace", FrameRoute::Direct);
        let (relay, registry, _page_rx, _cancel) = setup(vec![top]).await;

        let pending = tokio::spawn({
            let relay = relay.clone();
            async move { relay.relay("T1", Settings::default()).await }
        });
        sleep(ms(RELAY_RETRY_DELAY_MS / 4)).await;
        let (target, mut target_rx) = frame("F1", TARGET_URL, FrameRoute::Direct);
        assert!(registry.write().await.add_frame("T1", target));

        assert_eq!(
            pending.await.unwrap(),
            RelayOutcome::Delivered { frames: 2, failed: 0 }
        );
        assert!(matches!(target_rx.try_recv(), Ok(FrameMessage::Render(_))));
        assert!(matches!(top_rx.try_recv(), Ok(FrameMessage::Render(_))));
    }

    #[tokio::test]
    async fn test_unknown_tab() {
        let (relay, _registry, _page_rx, _cancel) = setup(vec![]).await;
        assert_eq!(relay.relay("nope", Settings::default()).await, RelayOutcome::TabGone);
    }
}
