//! Storage scopes and well-known keys.

use std::fmt;

use crate::config::{ANALYTICS_EVENT_CAP, MARKETPLACE_RECORD_CAP};

/// Storage area a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Small user settings, last-write-wins
    Sync,
    /// Device-local data: favorites, logs, history
    Local,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Sync => "sync",
            Scope::Local => "local",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bounded list key and its FIFO cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListKey {
    pub scope: Scope,
    pub key: &'static str,
    pub cap: usize,
}

pub const SETTINGS_KEY: &str = "settings";
pub const FAVORITES_KEY: &str = "favorites";

pub const ANALYTICS_EVENTS: ListKey = ListKey {
    scope: Scope::Local,
    key: "analytics_events",
    cap: ANALYTICS_EVENT_CAP,
};

pub const MARKETPLACE_RECORDS: ListKey = ListKey {
    scope: Scope::Local,
    key: "marketplace_records",
    cap: MARKETPLACE_RECORD_CAP,
};
