//! Notification Filters
//!
//! Filters sit between the protocol layer and application code and decide
//! which inbound notifications are worth dispatching.
//!
//! - `debounce`: per-key time window that drops bouncing pin changes

pub mod debounce;

pub use debounce::{DebounceConfig, DebounceFilter, DEFAULT_DEBOUNCE_INTERVAL};
