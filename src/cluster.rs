// Copyright 2020 Joyent, Inc.

//! Primary clusters and their discovery variants.
//!
//! A primary cluster is the single writer for one cluster's membership. It
//! owns the authoritative host set, reaches *initialized* exactly once, and
//! keeps emitting `(added, removed)` deltas to its subscribers until
//! teardown. Member-update subscribers run under the cluster's state lock,
//! in registration order, so the deltas each worker receives arrive in the
//! order the primary observed them.
//!
//! Discovery is a closed set of variants selected by the `type` key:
//!
//! * `static` materializes its hosts from configuration and is initialized
//!   immediately.
//! * `strict_dns` re-resolves every configured hostname on a refresh timer
//!   and treats the union of the answers as the membership. Addresses that
//!   drop out of an answer are removed.
//! * `logical_dns` resolves one hostname and presents a single logical host
//!   that re-targets its address on each answer. Connections to the old
//!   address are left alone.
//! * `sds` polls a service-discovery endpoint, reached through its bootstrap
//!   cluster, and adopts the returned host list. Polling is deferred until
//!   the manager reports every non-SDS cluster initialized, since the
//!   bootstrap cluster may itself need DNS.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use serde_derive::Deserialize;
use slog::{debug, info, o, warn, Logger};

use crate::config::{
    self, ClusterConfig, ClusterType, LoadBalancerType,
};
use crate::connection::AsyncClient;
use crate::error::Error;
use crate::health_checker::HealthChecker;
use crate::host::{
    partition, Host, HostSet, HostVec, MemberUpdateCb, MembershipSnapshot,
};
use crate::outlier::OutlierDetector;
use crate::resolver::DnsResolver;
use crate::stats::ClusterStats;

const DEFAULT_DNS_REFRESH_RATE_MS: u64 = 5000;

/// Immutable per-cluster descriptor shared with every worker.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    features: u64,
    lb_type: LoadBalancerType,
    stats: ClusterStats,
}

impl ClusterInfo {
    pub const FEATURE_HTTP2: u64 = 0x1;

    pub fn new(name: &str, features: u64, lb_type: LoadBalancerType, stats: ClusterStats) -> Self {
        ClusterInfo {
            name: name.to_string(),
            features,
            lb_type,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn has_feature(&self, feature: u64) -> bool {
        self.features & feature != 0
    }

    pub fn lb_type(&self) -> LoadBalancerType {
        self.lb_type
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }
}

struct ClusterState {
    host_set: HostSet,
    initialized: bool,
    initialized_cb: Option<Box<dyn FnOnce() + Send>>,
}

/// Handle on a primary cluster's mutable state. Clones share the same
/// underlying state; the mutex serializes the control-plane writers (initial
/// load, refresh timers, resolver callbacks, health transitions).
#[derive(Clone)]
pub struct SharedClusterState {
    info: Arc<ClusterInfo>,
    inner: Arc<Mutex<ClusterState>>,
}

impl SharedClusterState {
    pub fn new(info: Arc<ClusterInfo>) -> Self {
        SharedClusterState {
            info,
            inner: Arc::new(Mutex::new(ClusterState {
                host_set: HostSet::new(),
                initialized: false,
                initialized_cb: None,
            })),
        }
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn hosts(&self) -> HostVec {
        self.inner.lock().unwrap().host_set.hosts_arc()
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        self.inner.lock().unwrap().host_set.snapshot()
    }

    pub fn add_member_update_cb(&self, cb: MemberUpdateCb) {
        self.inner.lock().unwrap().host_set.add_member_update_cb(cb);
    }

    /// Publish a new membership. Subscribers run before this returns, under
    /// the state lock, so concurrent publications cannot reorder their
    /// fan-out.
    pub fn set_hosts(
        &self,
        hosts: Vec<Arc<Host>>,
        added: &[Arc<Host>],
        removed: &[Arc<Host>],
    ) {
        let (healthy, per_zone, healthy_per_zone) = partition(&hosts);
        let stats = self.info.stats();
        if !added.is_empty() || !removed.is_empty() {
            stats.membership_change.inc();
        }
        stats.membership_total.set(hosts.len() as u64);
        stats.membership_healthy.set(healthy.len() as u64);

        let mut state = self.inner.lock().unwrap();
        state.host_set.update_hosts(
            Arc::new(hosts),
            healthy,
            per_zone,
            healthy_per_zone,
            added,
            removed,
        );
    }

    /// Recompute the healthy projections after a host flag changed. Emits a
    /// member update with an empty delta.
    pub fn refresh_healthy(&self) {
        let mut state = self.inner.lock().unwrap();
        let hosts = state.host_set.hosts_arc();
        let (healthy, per_zone, healthy_per_zone) = partition(&hosts);
        self.info
            .stats()
            .membership_healthy
            .set(healthy.len() as u64);
        state
            .host_set
            .update_hosts(hosts, healthy, per_zone, healthy_per_zone, &[], &[]);
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().unwrap().initialized
    }

    /// Transition to initialized. Idempotent; the registered callback runs
    /// at most once, outside the state lock.
    pub fn mark_initialized(&self) {
        let cb = {
            let mut state = self.inner.lock().unwrap();
            if state.initialized {
                return;
            }
            state.initialized = true;
            state.initialized_cb.take()
        };
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Register the one-shot initialized callback. Fires immediately if the
    /// cluster already initialized.
    pub fn set_initialized_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        let mut state = self.inner.lock().unwrap();
        if state.initialized {
            drop(state);
            cb();
        } else {
            state.initialized_cb = Some(cb);
        }
    }
}

/// SDS channel parameters handed to an sds-type cluster at load: an async
/// client bound to the bootstrap cluster and the polling period.
pub struct SdsChannelParams {
    pub client: Box<dyn AsyncClient>,
    pub refresh_delay_ms: u64,
}

enum Discovery {
    Static,
    StrictDns(StrictDnsDiscovery),
    LogicalDns(LogicalDnsDiscovery),
    Sds(SdsDiscovery),
}

/// The control-plane owner of one cluster.
pub struct PrimaryCluster {
    info: Arc<ClusterInfo>,
    state: SharedClusterState,
    discovery: Discovery,
    health_checker: Option<HealthChecker>,
    outlier_detector: Option<OutlierDetector>,
    log: Logger,
}

impl PrimaryCluster {
    pub fn new(
        cfg: &ClusterConfig,
        cluster_type: ClusterType,
        stats: ClusterStats,
        dns_resolver: &Arc<dyn DnsResolver>,
        sds: Option<SdsChannelParams>,
        log: &Logger,
    ) -> Result<PrimaryCluster, Error> {
        let lb_type = LoadBalancerType::from_config_str(&cfg.lb_type)?;
        let features = cfg
            .features
            .iter()
            .fold(0u64, |acc, feature| match feature.as_str() {
                "http2" => acc | ClusterInfo::FEATURE_HTTP2,
                _ => acc,
            });
        let info = Arc::new(ClusterInfo::new(&cfg.name, features, lb_type, stats));
        let log = log.new(o!("cluster" => cfg.name.clone()));
        let state = SharedClusterState::new(info.clone());

        let discovery = match cluster_type {
            ClusterType::Static => {
                let mut hosts = Vec::with_capacity(cfg.hosts.len());
                for host_cfg in &cfg.hosts {
                    let address = config::parse_socket_addr(&cfg.name, &host_cfg.address)?;
                    hosts.push(Host::new(info.clone(), address, &host_cfg.zone));
                }
                let added = hosts.clone();
                state.set_hosts(hosts, &added, &[]);
                Discovery::Static
            }
            ClusterType::StrictDns => Discovery::StrictDns(StrictDnsDiscovery::new(
                cfg,
                state.clone(),
                dns_resolver.clone(),
                &log,
            )?),
            ClusterType::LogicalDns => Discovery::LogicalDns(LogicalDnsDiscovery::new(
                cfg,
                state.clone(),
                dns_resolver.clone(),
                &log,
            )?),
            ClusterType::Sds => {
                let sds = sds.ok_or(Error::SdsConfigMissing)?;
                Discovery::Sds(SdsDiscovery::new(state.clone(), sds, &log))
            }
        };

        Ok(PrimaryCluster {
            info,
            state,
            discovery,
            health_checker: None,
            outlier_detector: None,
            log,
        })
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn state(&self) -> &SharedClusterState {
        &self.state
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn set_health_checker(&mut self, health_checker: HealthChecker) {
        self.health_checker = Some(health_checker);
    }

    pub fn set_outlier_detector(&mut self, detector: OutlierDetector) {
        self.outlier_detector = Some(detector);
    }

    /// The polling handle for sds clusters, used by the manager to kick off
    /// polling once the non-SDS clusters have settled.
    pub fn sds_poller(&self) -> Option<Arc<SdsPoller>> {
        match &self.discovery {
            Discovery::Sds(sds) => Some(sds.poller.clone()),
            _ => None,
        }
    }

    /// Begin discovery and health checking. Static clusters initialize here;
    /// DNS clusters kick their first resolution and arm their refresh timer;
    /// sds clusters stay idle until `SdsPoller::initialize`.
    pub fn start(&self) {
        match &self.discovery {
            Discovery::Static => self.state.mark_initialized(),
            Discovery::StrictDns(discovery) => discovery.start(),
            Discovery::LogicalDns(discovery) => discovery.start(),
            Discovery::Sds(_) => {}
        }
        if let Some(health_checker) = &self.health_checker {
            health_checker.start();
        }
    }

    /// Cancel every outstanding timer owned by this cluster. Called before
    /// teardown so no detector or discovery callback fires into a cluster
    /// that is going away.
    pub fn stop(&self) {
        match &self.discovery {
            Discovery::Static => {}
            Discovery::StrictDns(discovery) => discovery.stop(),
            Discovery::LogicalDns(discovery) => discovery.stop(),
            Discovery::Sds(sds) => sds.poller.stop(),
        }
        if let Some(health_checker) = &self.health_checker {
            health_checker.stop();
        }
        if let Some(detector) = &self.outlier_detector {
            detector.stop();
        }
    }
}

struct ResolveTarget {
    hostname: String,
    port: u16,
    zone: String,
    hosts: Vec<Arc<Host>>,
    resolved_once: bool,
}

struct StrictDnsTargets {
    targets: Vec<ResolveTarget>,
    pending_initial: usize,
}

struct StrictDnsShared {
    state: SharedClusterState,
    resolver: Arc<dyn DnsResolver>,
    targets: Mutex<StrictDnsTargets>,
    log: Logger,
}

struct StrictDnsDiscovery {
    shared: Arc<StrictDnsShared>,
    refresh_ms: u64,
    timer: timer::Timer,
    guard: Mutex<Option<timer::Guard>>,
}

impl StrictDnsDiscovery {
    fn new(
        cfg: &ClusterConfig,
        state: SharedClusterState,
        resolver: Arc<dyn DnsResolver>,
        log: &Logger,
    ) -> Result<StrictDnsDiscovery, Error> {
        let mut targets = Vec::with_capacity(cfg.hosts.len());
        for host_cfg in &cfg.hosts {
            let (hostname, port) = config::parse_host_port(&cfg.name, &host_cfg.address)?;
            targets.push(ResolveTarget {
                hostname,
                port,
                zone: host_cfg.zone.clone(),
                hosts: Vec::new(),
                resolved_once: false,
            });
        }
        let pending_initial = targets.len();

        Ok(StrictDnsDiscovery {
            shared: Arc::new(StrictDnsShared {
                state,
                resolver,
                targets: Mutex::new(StrictDnsTargets {
                    targets,
                    pending_initial,
                }),
                log: log.clone(),
            }),
            refresh_ms: cfg.dns_refresh_rate_ms.unwrap_or(DEFAULT_DNS_REFRESH_RATE_MS),
            timer: timer::Timer::new(),
            guard: Mutex::new(None),
        })
    }

    fn start(&self) {
        if self.shared.targets.lock().unwrap().targets.is_empty() {
            // Nothing to resolve; the empty host set is the membership.
            self.shared.state.mark_initialized();
            return;
        }
        let shared = self.shared.clone();
        let guard = self.timer.schedule_repeating(
            chrono::Duration::milliseconds(self.refresh_ms as i64),
            move || StrictDnsShared::refresh_all(&shared),
        );
        *self.guard.lock().unwrap() = Some(guard);
        StrictDnsShared::refresh_all(&self.shared);
    }

    fn stop(&self) {
        *self.guard.lock().unwrap() = None;
    }
}

impl StrictDnsShared {
    fn refresh_all(shared: &Arc<StrictDnsShared>) {
        let hostnames: Vec<(usize, String)> = {
            let targets = shared.targets.lock().unwrap();
            targets
                .targets
                .iter()
                .enumerate()
                .map(|(index, target)| (index, target.hostname.clone()))
                .collect()
        };

        for (index, hostname) in hostnames {
            shared.state.info().stats().update_attempt.inc();
            let resolver = shared.resolver.clone();
            let cb_shared = shared.clone();
            resolver.resolve(
                &hostname,
                Box::new(move |result| {
                    StrictDnsShared::handle_resolve(&cb_shared, index, result)
                }),
            );
        }
    }

    fn handle_resolve(
        shared: &Arc<StrictDnsShared>,
        index: usize,
        result: Result<Vec<IpAddr>, Error>,
    ) {
        let stats = shared.state.info().stats();
        let addresses = match result {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(shared.log, "dns refresh failed: {}", e);
                stats.update_failure.inc();
                return;
            }
        };

        // Dedupe while preserving answer order.
        let mut seen = HashSet::new();
        let unique: Vec<IpAddr> = addresses
            .into_iter()
            .filter(|address| seen.insert(*address))
            .collect();

        let mut guard = shared.targets.lock().unwrap();
        let targets_state = &mut *guard;
        let target = &mut targets_state.targets[index];

        let current: HashSet<IpAddr> = target.hosts.iter().map(|h| h.address().ip()).collect();
        let desired: HashSet<IpAddr> = unique.iter().copied().collect();

        let mut removed: Vec<Arc<Host>> = Vec::new();
        let mut retained: Vec<Arc<Host>> = Vec::new();
        for host in &target.hosts {
            if desired.contains(&host.address().ip()) {
                retained.push(host.clone());
            } else {
                removed.push(host.clone());
            }
        }

        let mut added: Vec<Arc<Host>> = Vec::new();
        for address in &unique {
            if !current.contains(address) {
                let host = Host::new(
                    shared.state.info().clone(),
                    SocketAddr::new(*address, target.port),
                    &target.zone,
                );
                added.push(host.clone());
                retained.push(host);
            }
        }
        target.hosts = retained;

        let first_completion = !target.resolved_once;
        if first_completion {
            target.resolved_once = true;
            targets_state.pending_initial -= 1;
        }
        let all_resolved = targets_state.pending_initial == 0;
        let changed = !added.is_empty() || !removed.is_empty();

        stats.update_success.inc();
        if changed {
            debug!(
                shared.log,
                "dns membership change: {} added, {} removed",
                added.len(),
                removed.len()
            );
            let union: Vec<Arc<Host>> = targets_state
                .targets
                .iter()
                .flat_map(|target| target.hosts.iter().cloned())
                .collect();
            // Publish while still holding the targets lock so concurrent
            // resolutions cannot publish their unions out of order.
            shared.state.set_hosts(union, &added, &removed);
        }
        drop(guard);

        if first_completion && all_resolved {
            shared.state.mark_initialized();
        }
    }
}

struct LogicalDnsShared {
    state: SharedClusterState,
    resolver: Arc<dyn DnsResolver>,
    hostname: String,
    port: u16,
    zone: String,
    current: Mutex<Option<Arc<Host>>>,
    log: Logger,
}

struct LogicalDnsDiscovery {
    shared: Arc<LogicalDnsShared>,
    refresh_ms: u64,
    timer: timer::Timer,
    guard: Mutex<Option<timer::Guard>>,
}

impl LogicalDnsDiscovery {
    fn new(
        cfg: &ClusterConfig,
        state: SharedClusterState,
        resolver: Arc<dyn DnsResolver>,
        log: &Logger,
    ) -> Result<LogicalDnsDiscovery, Error> {
        if cfg.hosts.len() != 1 {
            return Err(Error::InvalidClusterConfig {
                cluster: cfg.name.clone(),
                msg: "logical_dns requires exactly one host".to_string(),
            });
        }
        let (hostname, port) = config::parse_host_port(&cfg.name, &cfg.hosts[0].address)?;

        Ok(LogicalDnsDiscovery {
            shared: Arc::new(LogicalDnsShared {
                state,
                resolver,
                hostname,
                port,
                zone: cfg.hosts[0].zone.clone(),
                current: Mutex::new(None),
                log: log.clone(),
            }),
            refresh_ms: cfg.dns_refresh_rate_ms.unwrap_or(DEFAULT_DNS_REFRESH_RATE_MS),
            timer: timer::Timer::new(),
            guard: Mutex::new(None),
        })
    }

    fn start(&self) {
        let shared = self.shared.clone();
        let guard = self.timer.schedule_repeating(
            chrono::Duration::milliseconds(self.refresh_ms as i64),
            move || LogicalDnsShared::refresh(&shared),
        );
        *self.guard.lock().unwrap() = Some(guard);
        LogicalDnsShared::refresh(&self.shared);
    }

    fn stop(&self) {
        *self.guard.lock().unwrap() = None;
    }
}

impl LogicalDnsShared {
    fn refresh(shared: &Arc<LogicalDnsShared>) {
        shared.state.info().stats().update_attempt.inc();
        let cb_shared = shared.clone();
        shared.resolver.resolve(
            &shared.hostname,
            Box::new(move |result| LogicalDnsShared::handle_resolve(&cb_shared, result)),
        );
    }

    fn handle_resolve(shared: &Arc<LogicalDnsShared>, result: Result<Vec<IpAddr>, Error>) {
        let stats = shared.state.info().stats();
        let addresses = match result {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(shared.log, "dns refresh failed: {}", e);
                stats.update_failure.inc();
                return;
            }
        };
        stats.update_success.inc();

        {
            let mut current = shared.current.lock().unwrap();
            if let Some(address) = addresses.first() {
                let address = SocketAddr::new(*address, shared.port);
                match &*current {
                    Some(host) => {
                        // The logical host keeps its identity; only the
                        // target address moves. Existing connections are
                        // not touched.
                        if host.address() != address {
                            info!(
                                shared.log,
                                "logical host re-targeted from {} to {}",
                                host.address(),
                                address
                            );
                            host.set_address(address);
                        }
                    }
                    None => {
                        let host =
                            Host::new(shared.state.info().clone(), address, &shared.zone);
                        *current = Some(host.clone());
                        shared.state.set_hosts(vec![host.clone()], &[host], &[]);
                    }
                }
            }
        }

        shared.state.mark_initialized();
    }
}

#[derive(Debug, Default, Deserialize)]
struct SdsRegistrationTags {
    az: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SdsRegistrationHost {
    ip_address: String,
    port: u16,
    #[serde(default)]
    tags: SdsRegistrationTags,
}

#[derive(Debug, Deserialize)]
struct SdsRegistrationResponse {
    #[serde(default)]
    hosts: Vec<SdsRegistrationHost>,
}

struct SdsDiscovery {
    poller: Arc<SdsPoller>,
}

impl SdsDiscovery {
    fn new(state: SharedClusterState, sds: SdsChannelParams, log: &Logger) -> SdsDiscovery {
        SdsDiscovery {
            poller: Arc::new(SdsPoller {
                state,
                client: Mutex::new(sds.client),
                known: Mutex::new(Vec::new()),
                refresh_delay_ms: sds.refresh_delay_ms,
                timer: Mutex::new(timer::Timer::new()),
                guard: Mutex::new(None),
                log: log.clone(),
            }),
        }
    }
}

/// Polls the discovery endpoint for one sds cluster. Held by the manager's
/// initialization bookkeeping so polling can start only after the bootstrap
/// cluster is resolvable.
pub struct SdsPoller {
    state: SharedClusterState,
    client: Mutex<Box<dyn AsyncClient>>,
    known: Mutex<Vec<Arc<Host>>>,
    refresh_delay_ms: u64,
    timer: Mutex<timer::Timer>,
    guard: Mutex<Option<timer::Guard>>,
    log: Logger,
}

impl SdsPoller {
    /// Begin polling: one fetch now, then one per refresh period.
    pub fn initialize(self: Arc<Self>) {
        info!(self.log, "starting sds polling");
        let poller = self.clone();
        let guard = self.timer.lock().unwrap().schedule_repeating(
            chrono::Duration::milliseconds(self.refresh_delay_ms as i64),
            move || SdsPoller::fetch(&poller),
        );
        *self.guard.lock().unwrap() = Some(guard);
        SdsPoller::fetch(&self);
    }

    pub fn stop(&self) {
        *self.guard.lock().unwrap() = None;
    }

    fn fetch(poller: &Arc<SdsPoller>) {
        poller.state.info().stats().update_attempt.inc();
        let path = format!("/v1/registration/{}", poller.state.info().name());
        let cb_poller = poller.clone();
        poller.client.lock().unwrap().request(
            &path,
            Box::new(move |result| cb_poller.handle_response(result)),
        );
    }

    fn handle_response(&self, result: Result<Vec<u8>, Error>) {
        let stats = self.state.info().stats();
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                warn!(self.log, "sds refresh failed: {}", e);
                stats.update_failure.inc();
                return;
            }
        };

        let response: SdsRegistrationResponse = match serde_json::from_slice(&body) {
            Ok(response) => response,
            Err(e) => {
                warn!(self.log, "sds response parse failure: {}", e);
                stats.update_failure.inc();
                return;
            }
        };

        let mut desired: Vec<(SocketAddr, String)> = Vec::with_capacity(response.hosts.len());
        let mut seen = HashSet::new();
        for entry in &response.hosts {
            let ip: IpAddr = match entry.ip_address.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!(self.log, "sds returned bad address '{}'", entry.ip_address);
                    continue;
                }
            };
            let address = SocketAddr::new(ip, entry.port);
            if seen.insert(address) {
                desired.push((
                    address,
                    entry.tags.az.clone().unwrap_or_default(),
                ));
            }
        }

        let mut known = self.known.lock().unwrap();
        let desired_addrs: HashSet<SocketAddr> =
            desired.iter().map(|(address, _)| *address).collect();
        let current_addrs: HashSet<SocketAddr> =
            known.iter().map(|host| host.address()).collect();

        let mut removed: Vec<Arc<Host>> = Vec::new();
        let mut retained: Vec<Arc<Host>> = Vec::new();
        for host in known.iter() {
            if desired_addrs.contains(&host.address()) {
                retained.push(host.clone());
            } else {
                removed.push(host.clone());
            }
        }

        let mut added: Vec<Arc<Host>> = Vec::new();
        for (address, zone) in &desired {
            if !current_addrs.contains(address) {
                let host = Host::new(self.state.info().clone(), *address, zone);
                added.push(host.clone());
                retained.push(host);
            }
        }

        stats.update_success.inc();
        if !added.is_empty() || !removed.is_empty() {
            debug!(
                self.log,
                "sds membership change: {} added, {} removed",
                added.len(),
                removed.len()
            );
            *known = retained.clone();
            // Publish under the known-hosts lock so overlapping polls
            // cannot reorder their results.
            self.state.set_hosts(retained, &added, &removed);
        }
        drop(known);

        self.state.mark_initialized();
    }
}
