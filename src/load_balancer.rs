// Copyright 2020 Joyent, Inc.

//! Host selection policies.
//!
//! A balancer picks one host per call from the worker's host-set snapshot.
//! All three policies share the same candidate-set logic: healthy hosts,
//! narrowed to the local zone when zone-aware balancing is admissible, with
//! a panic fallback to the full host list when nothing is healthy (sending
//! traffic at unhealthy backends beats failing every request when the whole
//! cluster is flapping a health checker).
//!
//! Selection is deterministic for a given seed: the only entropy source is
//! the balancer's own RNG.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::LoadBalancerType;
use crate::host::{Host, HostSet};
use crate::runtime::RuntimeLoader;
use crate::stats::ClusterStats;

// Runtime keys gating zone-aware balancing.
const ZONE_ROUTING_ENABLED_KEY: &str = "upstream.zone_routing.enabled";
const ZONE_HEALTHY_PERCENT_KEY: &str = "upstream.zone_routing.healthy_percent_threshold";
const DEFAULT_ZONE_HEALTHY_PERCENT: u64 = 80;

pub struct LoadBalancer {
    kind: LoadBalancerType,
    local_zone: String,
    stats: ClusterStats,
    runtime: Arc<dyn RuntimeLoader>,
    rng: StdRng,
    rr_index: usize,
}

impl LoadBalancer {
    pub fn new(
        kind: LoadBalancerType,
        local_zone: &str,
        stats: ClusterStats,
        runtime: Arc<dyn RuntimeLoader>,
        seed: u64,
    ) -> Self {
        LoadBalancer {
            kind,
            local_zone: local_zone.to_string(),
            stats,
            runtime,
            rng: StdRng::seed_from_u64(seed),
            rr_index: 0,
        }
    }

    /// Select one host from the snapshot, or `None` when the cluster has no
    /// hosts at all. `local_host_set` is the worker's view of the local
    /// cluster, when one is configured, and drives zone-aware narrowing.
    pub fn choose_host(
        &mut self,
        host_set: &HostSet,
        local_host_set: Option<&HostSet>,
    ) -> Option<Arc<Host>> {
        let use_local_zone = self.should_balance_locally(host_set, local_host_set);
        let hosts = self.hosts_to_use(host_set, use_local_zone);
        if hosts.is_empty() {
            return None;
        }

        match self.kind {
            LoadBalancerType::RoundRobin => {
                let host = hosts[self.rr_index % hosts.len()].clone();
                self.rr_index = self.rr_index.wrapping_add(1);
                Some(host)
            }
            LoadBalancerType::LeastRequest => {
                if hosts.len() == 1 {
                    return Some(hosts[0].clone());
                }
                // Power of two choices: sample two and keep the one with
                // fewer outstanding requests.
                let first = &hosts[self.rng.gen_range(0, hosts.len())];
                let second = &hosts[self.rng.gen_range(0, hosts.len())];
                if first.active_requests() <= second.active_requests() {
                    Some(first.clone())
                } else {
                    Some(second.clone())
                }
            }
            LoadBalancerType::Random => {
                Some(hosts[self.rng.gen_range(0, hosts.len())].clone())
            }
        }
    }

    fn hosts_to_use<'a>(&mut self, host_set: &'a HostSet, use_local_zone: bool) -> &'a [Arc<Host>] {
        if host_set.healthy_hosts().is_empty() {
            if !host_set.hosts().is_empty() {
                self.stats.lb_healthy_panic.inc();
            }
            return host_set.hosts();
        }

        if use_local_zone {
            if let Some(zone_hosts) = host_set.healthy_hosts_per_zone().get(&self.local_zone) {
                if !zone_hosts.is_empty() {
                    return zone_hosts;
                }
            }
        }

        host_set.healthy_hosts()
    }

    /// Zone-aware balancing is admissible when a local host set exists, the
    /// runtime gate is open, every upstream zone has at least one healthy
    /// host (an empty zone would be starved by narrowing, so the feature
    /// shuts off entirely), and enough of the local cluster's healthy hosts
    /// sit in the local zone.
    fn should_balance_locally(
        &self,
        host_set: &HostSet,
        local_host_set: Option<&HostSet>,
    ) -> bool {
        let local = match local_host_set {
            Some(local) => local,
            None => return false,
        };
        if self.local_zone.is_empty() || host_set.healthy_hosts().is_empty() {
            return false;
        }
        if !self.runtime.feature_enabled(ZONE_ROUTING_ENABLED_KEY, 100) {
            return false;
        }

        let upstream_zones = host_set.healthy_hosts_per_zone();
        if upstream_zones.is_empty() || upstream_zones.values().any(|zone| zone.is_empty()) {
            return false;
        }

        let local_healthy = local.healthy_hosts().len();
        if local_healthy == 0 {
            return false;
        }
        let local_zone_healthy = local
            .healthy_hosts_per_zone()
            .get(&self.local_zone)
            .map(|zone| zone.len())
            .unwrap_or(0);

        let threshold = self
            .runtime
            .get_integer(ZONE_HEALTHY_PERCENT_KEY, DEFAULT_ZONE_HEALTHY_PERCENT);
        (local_zone_healthy * 100 / local_healthy) as u64 >= threshold
    }
}
