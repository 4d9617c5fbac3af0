//! R6 Market Helper
//!
//! Price overlays for the Rainbow Six Siege marketplace. A daemon drives a
//! Chromium instance over the DevTools protocol, reads the marketplace's own
//! GraphQL responses, caches item prices and patches the item cards inside
//! the embedded marketplace frame.

pub mod analytics;
pub mod background;
pub mod cache;
pub mod cdp;
pub mod config;
pub mod dom;
pub mod export;
pub mod favorites;
pub mod frame;
pub mod interceptor;
pub mod messages;
pub mod notify;
pub mod patch;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod storage;
pub mod tab;
pub mod types;
