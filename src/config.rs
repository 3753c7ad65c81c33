//! Layered cache configuration.
//!
//! A plain struct with a `Default` impl and small `with_*` setters, rather
//! than a config-file parser: the cache has exactly two callers of interest,
//! an embedding application that builds a `CacheConfig` in code, and
//! `from_env` for the handful of deployments that prefer environment
//! overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::DEFAULT_MAX_SIZE;
use crate::eviction::EvictionPolicy;

/// Bytes budget for the in-memory-only backend variant (§4.12), distinct
/// from [`DEFAULT_MAX_SIZE`] which governs the on-disk default.
pub const DEFAULT_MEMORY_ONLY_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Selects [`eviction::Eviction`](crate::eviction::Eviction)'s algorithm.
/// A `serde`-friendly mirror of [`EvictionPolicy`], which intentionally
/// carries no derives of its own since only this config layer needs to
/// (de)serialize a choice between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicyKind {
    Lru,
    ReuseAware,
}

impl From<EvictionPolicyKind> for EvictionPolicy {
    fn from(kind: EvictionPolicyKind) -> EvictionPolicy {
        match kind {
            EvictionPolicyKind::Lru => EvictionPolicy::PureLru,
            EvictionPolicyKind::ReuseAware => EvictionPolicy::ReuseAware,
        }
    }
}

/// Everything needed to open a cache: where it lives (or that it doesn't),
/// how big it's allowed to grow, and which eviction algorithm to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub data_dir: PathBuf,
    pub max_size: u64,
    pub eviction: EvictionPolicyKind,
    pub force_reset: bool,
    pub memory_only: bool,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            data_dir: PathBuf::from("./cache"),
            max_size: DEFAULT_MAX_SIZE,
            eviction: EvictionPolicyKind::ReuseAware,
            force_reset: false,
            memory_only: false,
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: u64) -> CacheConfig {
        self.max_size = max_size;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> CacheConfig {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionPolicyKind) -> CacheConfig {
        self.eviction = eviction;
        self
    }

    pub fn memory_only(mut self) -> CacheConfig {
        self.memory_only = true;
        self.max_size = DEFAULT_MEMORY_ONLY_MAX_SIZE;
        self
    }

    /// Applies `DISK_CACHE_DIR`, `DISK_CACHE_MAX_SIZE`, and
    /// `DISK_CACHE_MEMORY_ONLY` overrides on top of [`CacheConfig::default`],
    /// the same override-on-top-of-defaults shape this codebase's other
    /// `Config::from_env` constructors use. Malformed overrides are ignored
    /// rather than treated as fatal, since a broken environment variable
    /// should not prevent the cache from opening with sane defaults.
    pub fn from_env() -> CacheConfig {
        let mut config = CacheConfig::default();
        if let Ok(dir) = std::env::var("DISK_CACHE_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(max_size) = std::env::var("DISK_CACHE_MAX_SIZE") {
            if let Ok(parsed) = max_size.parse() {
                config.max_size = parsed;
            }
        }
        if let Ok(memory_only) = std::env::var("DISK_CACHE_MEMORY_ONLY") {
            config.memory_only = memory_only == "1" || memory_only.eq_ignore_ascii_case("true");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_on_disk_sizing() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert!(!config.memory_only);
    }

    #[test]
    fn memory_only_switches_to_the_smaller_default_budget() {
        let config = CacheConfig::default().memory_only();
        assert!(config.memory_only);
        assert_eq!(config.max_size, DEFAULT_MEMORY_ONLY_MAX_SIZE);
    }

    #[test]
    fn builder_overrides_apply_in_order() {
        let config = CacheConfig::default().with_max_size(42).with_data_dir("/tmp/x");
        assert_eq!(config.max_size, 42);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
    }
}
