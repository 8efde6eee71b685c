// Copyright 2020 Joyent, Inc.

//! Statistics primitives shared by every component of the manager.
//!
//! Counters and gauges are registered in a [`StatsStore`](struct.StatsStore.html)
//! by fully-qualified name (`cluster.<name>.<stat>`) so an embedding proxy can
//! scrape the whole store. The handles returned are cheap atomic clones and
//! are safe to increment from any thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A monotonically increasing counter.
#[derive(Clone, Debug)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move in both directions.
#[derive(Clone, Debug)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A name-indexed registry of counters and gauges.
///
/// Registering the same name twice returns a handle to the same underlying
/// atomic, so components may re-derive their stats from the store without
/// coordinating.
#[derive(Clone, Debug, Default)]
pub struct StatsStore {
    metrics: Arc<Mutex<HashMap<String, Arc<AtomicU64>>>>,
}

impl StatsStore {
    pub fn new() -> Self {
        StatsStore::default()
    }

    pub fn counter(&self, name: &str) -> Counter {
        Counter(self.metric(name))
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        Gauge(self.metric(name))
    }

    /// Snapshot the current value of a metric, if it has been registered.
    pub fn value(&self, name: &str) -> Option<u64> {
        let metrics = self.metrics.lock().unwrap();
        metrics.get(name).map(|m| m.load(Ordering::Relaxed))
    }

    fn metric(&self, name: &str) -> Arc<AtomicU64> {
        let mut metrics = self.metrics.lock().unwrap();
        metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}

/// The per-cluster stats bundle. One instance is generated per cluster at
/// load time and shared by the primary cluster, its balancers, and its
/// health checker.
#[derive(Clone, Debug)]
pub struct ClusterStats {
    pub upstream_cx_none_healthy: Counter,
    pub lb_healthy_panic: Counter,
    pub membership_change: Counter,
    pub membership_total: Gauge,
    pub membership_healthy: Gauge,
    pub update_attempt: Counter,
    pub update_success: Counter,
    pub update_failure: Counter,
    pub health_check_attempt: Counter,
    pub health_check_success: Counter,
    pub health_check_failure: Counter,
}

impl ClusterStats {
    pub fn new(cluster_name: &str, store: &StatsStore) -> Self {
        let name = |stat: &str| format!("cluster.{}.{}", cluster_name, stat);
        ClusterStats {
            upstream_cx_none_healthy: store.counter(&name("upstream_cx_none_healthy")),
            lb_healthy_panic: store.counter(&name("lb_healthy_panic")),
            membership_change: store.counter(&name("membership_change")),
            membership_total: store.gauge(&name("membership_total")),
            membership_healthy: store.gauge(&name("membership_healthy")),
            update_attempt: store.counter(&name("update_attempt")),
            update_success: store.counter(&name("update_success")),
            update_failure: store.counter(&name("update_failure")),
            health_check_attempt: store.counter(&name("health_check.attempt")),
            health_check_success: store.counter(&name("health_check.success")),
            health_check_failure: store.counter(&name("health_check.failure")),
        }
    }
}

/// Outlier detection stats, generated under
/// `cluster.<name>.outlier_detection.`.
#[derive(Clone, Debug)]
pub struct DetectionStats {
    pub ejections_total: Counter,
    pub ejections_active: Gauge,
    pub ejections_overflow: Counter,
    pub ejections_consecutive_5xx: Counter,
}

impl DetectionStats {
    pub fn new(cluster_name: &str, store: &StatsStore) -> Self {
        let name = |stat: &str| format!("cluster.{}.outlier_detection.{}", cluster_name, stat);
        DetectionStats {
            ejections_total: store.counter(&name("ejections_total")),
            ejections_active: store.gauge(&name("ejections_active")),
            ejections_overflow: store.counter(&name("ejections_overflow")),
            ejections_consecutive_5xx: store.counter(&name("ejections_consecutive_5xx")),
        }
    }
}
