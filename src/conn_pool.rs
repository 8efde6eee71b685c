// Copyright 2020 Joyent, Inc.

//! HTTP connection pool contracts and the per-worker pool registry.
//!
//! Pool implementations live in the embedding proxy; this module owns their
//! lifecycle. Pools are keyed by `(host identity, priority)`, so two
//! generations of the same address never share a pool, and a removed host's
//! pools are drained rather than dropped: each live pool is asked to stop
//! admitting new streams, and only when every pool has reported drained are
//! they handed to the worker dispatcher's deferred-delete queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use slog::{debug, Logger};

use crate::dispatcher::Dispatcher;
use crate::host::Host;

/// Priority class for a pooled connection. Independent pools are kept per
/// priority so high-priority traffic is not queued behind default traffic.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourcePriority {
    Default,
    High,
}

pub const NUM_PRIORITIES: usize = 2;

impl ResourcePriority {
    pub fn index(self) -> usize {
        match self {
            ResourcePriority::Default => 0,
            ResourcePriority::High => 1,
        }
    }
}

/// Protocol selected for a new pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolKind {
    Http1,
    Http2,
}

/// Callback fired by a pool once draining has completed.
pub type DrainedCb = Box<dyn FnOnce() + Send>;

/// A pooled set of HTTP connections to a single host at one priority.
pub trait ConnPool: Send + Sync + 'static {
    /// Register a callback to be invoked when the pool has no remaining
    /// in-flight streams. May fire immediately if the pool is already idle.
    fn add_drained_callback(&self, cb: DrainedCb);

    /// Stop admitting new streams and finish the ones in flight.
    fn drain_connections(&self);
}

/// Allocates pool instances. `kind` has already been decided from the
/// cluster's feature bits and the runtime protocol gate.
pub trait ConnPoolFactory: Send + Sync + 'static {
    fn allocate(
        &self,
        kind: PoolKind,
        host: &Arc<Host>,
        priority: ResourcePriority,
    ) -> Arc<dyn ConnPool>;
}

/// Per-host pool slots, one per priority, plus the drain countdown used
/// during removal.
pub struct ConnPoolsContainer {
    pools: [Option<Arc<dyn ConnPool>>; NUM_PRIORITIES],
    drains_remaining: u32,
}

impl ConnPoolsContainer {
    fn new() -> Self {
        ConnPoolsContainer {
            pools: [None, None],
            drains_remaining: 0,
        }
    }
}

/// The worker-local mapping from host identity to its pools. The map is only
/// touched from its worker's thread; the mutex exists so drained callbacks,
/// which re-enter from pool code during an event, can reach it too.
#[derive(Clone)]
pub struct ConnPoolRegistry {
    containers: Arc<Mutex<HashMap<Arc<Host>, ConnPoolsContainer>>>,
}

impl ConnPoolRegistry {
    pub fn new() -> Self {
        ConnPoolRegistry {
            containers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Find or create the pool for `(host, priority)`.
    pub fn pool_for(
        &self,
        host: &Arc<Host>,
        priority: ResourcePriority,
        kind: PoolKind,
        factory: &dyn ConnPoolFactory,
    ) -> Arc<dyn ConnPool> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .entry(host.clone())
            .or_insert_with(ConnPoolsContainer::new);
        let slot = &mut container.pools[priority.index()];
        if slot.is_none() {
            *slot = Some(factory.allocate(kind, host, priority));
        }
        slot.as_ref().unwrap().clone()
    }

    /// Whether any pools are currently held for the host.
    pub fn has_pools_for(&self, host: &Arc<Host>) -> bool {
        self.containers.lock().unwrap().contains_key(host)
    }

    pub fn host_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Begin draining every pool held for a removed host. Once all of them
    /// report drained the pools move to the dispatcher's deferred-delete
    /// queue and the host entry disappears.
    pub fn drain_host_pools(&self, host: &Arc<Host>, dispatcher: &Dispatcher, log: &Logger) {
        let live_pools: Vec<Arc<dyn ConnPool>> = {
            let mut containers = self.containers.lock().unwrap();
            let container = match containers.get_mut(host) {
                Some(container) => container,
                None => return,
            };

            let live: Vec<Arc<dyn ConnPool>> =
                container.pools.iter().flatten().cloned().collect();
            if live.is_empty() {
                containers.remove(host);
                return;
            }
            container.drains_remaining = live.len() as u32;
            live
        };

        debug!(
            log,
            "draining {} pool(s) for removed host {}",
            live_pools.len(),
            host.address()
        );

        for pool in live_pools {
            let registry = self.clone();
            let host = host.clone();
            let dispatcher = dispatcher.clone();
            pool.add_drained_callback(Box::new(move || {
                registry.finish_drain(&host, &dispatcher);
            }));
            pool.drain_connections();
        }
    }

    fn finish_drain(&self, host: &Arc<Host>, dispatcher: &Dispatcher) {
        let mut containers = self.containers.lock().unwrap();
        let container = match containers.get_mut(host) {
            Some(container) => container,
            None => return,
        };
        assert!(container.drains_remaining > 0);
        container.drains_remaining -= 1;
        if container.drains_remaining == 0 {
            // The pools may be referenced by the stack frame that reported
            // the drain, so deletion is deferred to the dispatcher.
            if let Some(container) = containers.remove(host) {
                for pool in container.pools.iter().flatten() {
                    dispatcher.deferred_delete(Box::new(pool.clone()));
                }
            }
        }
    }

    /// Drop every container. Used at worker shutdown, where in-flight
    /// streams are already gone.
    pub fn clear(&self) {
        self.containers.lock().unwrap().clear();
    }
}

impl Default for ConnPoolRegistry {
    fn default() -> Self {
        ConnPoolRegistry::new()
    }
}
