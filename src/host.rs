// Copyright 2020 Joyent, Inc.

//! Hosts and host-set snapshots.
//!
//! A [`Host`](struct.Host.html) is one backend endpoint within a cluster. Its
//! identity is an opaque id, never its address: when discovery removes an
//! address and later returns it, the readded backend is a brand new `Host`
//! object. Connection pool maps are keyed by host identity, which is what
//! makes drain-on-removal safe even when an address comes straight back.
//!
//! A [`HostSet`](struct.HostSet.html) is the published view of a cluster's
//! membership: the ordered host list plus its healthy and per-zone
//! projections, each behind an `Arc`. Publication replaces all four
//! references; the vectors themselves are never mutated after they are
//! shared, so a worker can hand slices to its balancer without copying.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use derive_more::{Display, From, Into};

use crate::cluster::ClusterInfo;
use crate::outlier::{DetectorHostSink, NullDetectorHostSink};

/// Opaque host identity. Monotonically assigned at construction and never
/// reused within a process.
#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq)]
pub struct HostId(u64);

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

impl HostId {
    fn next() -> Self {
        HostId(NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One backend endpoint within a cluster.
pub struct Host {
    id: HostId,
    cluster: Arc<ClusterInfo>,
    // Interiorly mutable so a logical-DNS host can re-target on
    // re-resolution without changing identity.
    address: Mutex<SocketAddr>,
    zone: String,
    healthy: AtomicBool,
    ejected: AtomicBool,
    active_requests: AtomicU64,
    outlier_sink: Mutex<Arc<dyn DetectorHostSink>>,
}

impl Host {
    pub fn new(cluster: Arc<ClusterInfo>, address: SocketAddr, zone: &str) -> Arc<Host> {
        Arc::new(Host {
            id: HostId::next(),
            cluster,
            address: Mutex::new(address),
            zone: zone.to_string(),
            healthy: AtomicBool::new(true),
            ejected: AtomicBool::new(false),
            active_requests: AtomicU64::new(0),
            outlier_sink: Mutex::new(Arc::new(NullDetectorHostSink)),
        })
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn cluster(&self) -> &Arc<ClusterInfo> {
        &self.cluster
    }

    pub fn address(&self) -> SocketAddr {
        *self.address.lock().unwrap()
    }

    pub fn set_address(&self, address: SocketAddr) {
        *self.address.lock().unwrap() = address;
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn ejected(&self) -> bool {
        self.ejected.load(Ordering::SeqCst)
    }

    pub fn set_ejected(&self, ejected: bool) {
        self.ejected.store(ejected, Ordering::SeqCst);
    }

    /// A host receives traffic iff it is healthy and not ejected.
    pub fn effective_healthy(&self) -> bool {
        self.healthy() && !self.ejected()
    }

    /// Outstanding request count, maintained by the pools that borrow this
    /// host and consumed by least-request balancing.
    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn requests_inc(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_dec(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn outlier_sink(&self) -> Arc<dyn DetectorHostSink> {
        self.outlier_sink.lock().unwrap().clone()
    }

    pub fn set_outlier_sink(&self, sink: Arc<dyn DetectorHostSink>) {
        *self.outlier_sink.lock().unwrap() = sink;
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Host) -> bool {
        self.id == other.id
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Host")
            .field("id", &self.id)
            .field("cluster", &self.cluster.name())
            .field("address", &self.address())
            .field("zone", &self.zone)
            .field("healthy", &self.healthy())
            .field("ejected", &self.ejected())
            .finish()
    }
}

/// An ordered, shared, immutable host list.
pub type HostVec = Arc<Vec<Arc<Host>>>;
/// Zone name to ordered host list.
pub type HostsPerZone = Arc<HashMap<String, Vec<Arc<Host>>>>;

/// The four published references of a host set, cloned out for cross-thread
/// fan-out. Receivers treat the contents as read-only.
#[derive(Clone)]
pub struct MembershipSnapshot {
    pub hosts: HostVec,
    pub healthy_hosts: HostVec,
    pub hosts_per_zone: HostsPerZone,
    pub healthy_hosts_per_zone: HostsPerZone,
}

/// Member-update subscriber. Receives the new snapshot plus the explicit
/// added and removed host lists for the event.
pub type MemberUpdateCb =
    Arc<dyn Fn(&MembershipSnapshot, &[Arc<Host>], &[Arc<Host>]) + Send + Sync>;

/// The current membership snapshot of one cluster, with its healthy subset
/// and per-zone partitions, plus the member-update subscriber list.
pub struct HostSet {
    hosts: HostVec,
    healthy_hosts: HostVec,
    hosts_per_zone: HostsPerZone,
    healthy_hosts_per_zone: HostsPerZone,
    callbacks: Vec<MemberUpdateCb>,
}

impl HostSet {
    pub fn new() -> Self {
        HostSet {
            hosts: Arc::new(Vec::new()),
            healthy_hosts: Arc::new(Vec::new()),
            hosts_per_zone: Arc::new(HashMap::new()),
            healthy_hosts_per_zone: Arc::new(HashMap::new()),
            callbacks: Vec::new(),
        }
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn hosts_arc(&self) -> HostVec {
        self.hosts.clone()
    }

    pub fn healthy_hosts(&self) -> &[Arc<Host>] {
        &self.healthy_hosts
    }

    pub fn hosts_per_zone(&self) -> &HashMap<String, Vec<Arc<Host>>> {
        &self.hosts_per_zone
    }

    pub fn healthy_hosts_per_zone(&self) -> &HashMap<String, Vec<Arc<Host>>> {
        &self.healthy_hosts_per_zone
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            hosts: self.hosts.clone(),
            healthy_hosts: self.healthy_hosts.clone(),
            hosts_per_zone: self.hosts_per_zone.clone(),
            healthy_hosts_per_zone: self.healthy_hosts_per_zone.clone(),
        }
    }

    pub fn add_member_update_cb(&mut self, cb: MemberUpdateCb) {
        self.callbacks.push(cb);
    }

    /// Replace all four references and notify subscribers, in registration
    /// order, with the explicit delta for this event.
    pub fn update_hosts(
        &mut self,
        hosts: HostVec,
        healthy_hosts: HostVec,
        hosts_per_zone: HostsPerZone,
        healthy_hosts_per_zone: HostsPerZone,
        hosts_added: &[Arc<Host>],
        hosts_removed: &[Arc<Host>],
    ) {
        self.hosts = hosts;
        self.healthy_hosts = healthy_hosts;
        self.hosts_per_zone = hosts_per_zone;
        self.healthy_hosts_per_zone = healthy_hosts_per_zone;

        let snapshot = self.snapshot();
        for cb in &self.callbacks {
            cb(&snapshot, hosts_added, hosts_removed);
        }
    }
}

impl Default for HostSet {
    fn default() -> Self {
        HostSet::new()
    }
}

/// A host set behind a mutex, shared between a worker's cluster entries. The
/// local cluster's set is read by every other entry's balancer on the same
/// worker, which is why the worker-side sets are shared at all.
#[derive(Clone)]
pub struct SharedHostSet(Arc<Mutex<HostSet>>);

impl SharedHostSet {
    pub fn new() -> Self {
        SharedHostSet(Arc::new(Mutex::new(HostSet::new())))
    }

    pub fn lock(&self) -> MutexGuard<HostSet> {
        self.0.lock().unwrap()
    }
}

impl Default for SharedHostSet {
    fn default() -> Self {
        SharedHostSet::new()
    }
}

/// Compute the healthy and per-zone projections of an ordered host list.
/// Zones that currently have no healthy hosts keep their key with an empty
/// vector so zone-aware balancing can observe them.
pub fn partition(hosts: &[Arc<Host>]) -> (HostVec, HostsPerZone, HostsPerZone) {
    let healthy: Vec<Arc<Host>> = hosts
        .iter()
        .filter(|h| h.effective_healthy())
        .cloned()
        .collect();

    let mut per_zone: HashMap<String, Vec<Arc<Host>>> = HashMap::new();
    for host in hosts {
        per_zone
            .entry(host.zone().to_string())
            .or_insert_with(Vec::new)
            .push(host.clone());
    }

    let mut healthy_per_zone: HashMap<String, Vec<Arc<Host>>> = HashMap::new();
    for (zone, zone_hosts) in &per_zone {
        healthy_per_zone.insert(
            zone.clone(),
            zone_hosts
                .iter()
                .filter(|h| h.effective_healthy())
                .cloned()
                .collect(),
        );
    }

    (
        Arc::new(healthy),
        Arc::new(per_zone),
        Arc::new(healthy_per_zone),
    )
}
