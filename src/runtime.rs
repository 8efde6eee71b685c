// Copyright 2020 Joyent, Inc.

//! Runtime configuration gates.
//!
//! Several balancing and ejection decisions are controlled by keys that an
//! operator can move at runtime without a restart. The manager only consumes
//! the two lookups below; the backing store (disk snapshot, admin endpoint,
//! whatever the embedding proxy provides) is the implementer's business.

use std::collections::HashMap;

use rand::Rng;

/// Runtime lookup contract consumed by the cluster manager.
pub trait RuntimeLoader: Send + Sync + 'static {
    /// Roll a feature gate expressed as a percentage. `default_percent` is
    /// used when the key has no override. 0 is always off, 100 always on.
    fn feature_enabled(&self, key: &str, default_percent: u64) -> bool;

    /// Fetch an integer value, falling back to `default` when the key has no
    /// override.
    fn get_integer(&self, key: &str, default: u64) -> u64;
}

/// A fixed-table runtime. The zero-value table answers every lookup with the
/// caller's default, which is the behavior a proxy with no runtime overrides
/// gets.
#[derive(Clone, Debug, Default)]
pub struct StaticRuntime {
    features: HashMap<String, u64>,
    integers: HashMap<String, u64>,
}

impl StaticRuntime {
    pub fn new() -> Self {
        StaticRuntime::default()
    }

    pub fn with_feature_percent(mut self, key: &str, percent: u64) -> Self {
        self.features.insert(key.to_string(), percent);
        self
    }

    pub fn with_integer(mut self, key: &str, value: u64) -> Self {
        self.integers.insert(key.to_string(), value);
        self
    }
}

impl RuntimeLoader for StaticRuntime {
    fn feature_enabled(&self, key: &str, default_percent: u64) -> bool {
        let percent = self.features.get(key).copied().unwrap_or(default_percent);
        if percent >= 100 {
            true
        } else if percent == 0 {
            false
        } else {
            rand::thread_rng().gen_range(0, 100) < percent
        }
    }

    fn get_integer(&self, key: &str, default: u64) -> u64 {
        self.integers.get(key).copied().unwrap_or(default)
    }
}
