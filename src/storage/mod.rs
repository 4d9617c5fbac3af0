//! SQLite persistence for settings, favorites and bounded local logs.
//!
//! Two scopes mirror the browser storage areas the data came from: `Sync`
//! for the settings record and `Local` for everything else.

pub mod schema;
pub mod types;
pub mod writer;

pub use types::{ListKey, Scope, ANALYTICS_EVENTS, FAVORITES_KEY, MARKETPLACE_RECORDS, SETTINGS_KEY};
pub use writer::{open_store, StoreHandle};
