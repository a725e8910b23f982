//! Debounce Filter
//!
//! Mechanical inputs (switches, relays, reed sensors) bounce: a single
//! press reaches the host as a burst of pin-change notifications. The
//! filter passes the first notification for a key and suppresses the rest
//! until `interval` has elapsed since the last one it passed.
//!
//! Suppressed notifications do not move the window, so a continuous burst
//! still lets one event through per interval.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default suppression window.
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(220);

/// Configuration for a [`DebounceFilter`].
#[derive(Debug, Clone, PartialEq)]
pub struct DebounceConfig {
    /// When false every notification is dispatched
    pub enabled: bool,

    /// Minimum time between two dispatched notifications for one key
    pub interval: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_DEBOUNCE_INTERVAL,
        }
    }
}

/// Per-key last-dispatch timestamps.
#[derive(Debug)]
pub struct DebounceFilter<K> {
    config: DebounceConfig,
    last_dispatch: HashMap<K, Instant>,
}

impl<K: Eq + Hash> Default for DebounceFilter<K> {
    fn default() -> Self {
        Self::new(DebounceConfig::default())
    }
}

impl<K: Eq + Hash> DebounceFilter<K> {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            last_dispatch: HashMap::new(),
        }
    }

    /// Decides whether a notification for `key` observed at `now` passes.
    ///
    /// Records `now` for the key when it does.
    pub fn should_dispatch(&mut self, key: K, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        if let Some(&last) = self.last_dispatch.get(&key) {
            if now.saturating_duration_since(last) < self.config.interval {
                return false;
            }
        }

        self.last_dispatch.insert(key, now);
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Turns filtering on or off. Disabling forgets every key, so a
    /// re-enabled filter starts with empty windows.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.last_dispatch.clear();
        }
        self.config.enabled = enabled;
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.config.interval = interval;
    }

    /// Number of distinct keys seen so far.
    pub fn tracked_keys(&self) -> usize {
        self.last_dispatch.len()
    }
}
