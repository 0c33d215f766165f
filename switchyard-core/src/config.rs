//! Cache configuration.
//!
//! Controls eviction and stabilization of the reactive cache. Durations are
//! given in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

const DEFAULT_IDLE_MS: u64 = 5 * 60 * 1000;

/// What happens to entries nobody reads any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep every entry for the lifetime of the cache. Hydrated entries
    /// depend on this.
    #[default]
    Retain,
    /// Evict entries that were not touched for `idle_ms` and have no
    /// observers, when [`evict_idle`](crate::cache::ReactiveCache::evict_idle)
    /// runs.
    Idle {
        #[serde(default = "default_idle_ms")]
        idle_ms: u64,
    },
}

fn default_idle_ms() -> u64 {
    DEFAULT_IDLE_MS
}

impl EvictionPolicy {
    /// The idle threshold, if entries may be evicted at all.
    pub fn idle_after(&self) -> Option<Duration> {
        match self {
            Self::Retain => None,
            Self::Idle { idle_ms } => Some(Duration::from_millis(*idle_ms)),
        }
    }
}

/// When dirty nodes are recomputed after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizeMode {
    /// One coalesced pass after the current turn.
    #[default]
    Deferred,
    /// A pass right after every write.
    Immediate,
}

/// Reactive cache configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub eviction: EvictionPolicy,
    pub stabilize: StabilizeMode,
}

impl CacheConfig {
    /// Parse a configuration document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
