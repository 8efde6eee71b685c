// Copyright 2020 Joyent, Inc.

//! The cluster manager and its per-worker views.
//!
//! [`ClusterManager`](struct.ClusterManager.html) is the control-plane
//! owner: it loads every configured cluster, spawns the worker threads, and
//! fans membership out to them. Each worker owns a
//! [`ThreadLocalClusterManager`](struct.ThreadLocalClusterManager.html),
//! which is where data-plane code selects hosts and obtains pooled HTTP
//! connections or raw TCP connections. A worker's view is mutated only by
//! closures posted onto its own queue; the closures capture immutable
//! snapshot references, so no lock is ever shared between the control plane
//! and a worker's request path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use slog::{o, warn, Drain, Logger};

use crate::cluster::{
    ClusterInfo, PrimaryCluster, SdsChannelParams, SdsPoller,
};
use crate::config::{ClusterConfig, ClusterManagerConfig, ClusterType};
use crate::conn_pool::{ConnPool, ConnPoolFactory, ConnPoolRegistry, PoolKind, ResourcePriority};
use crate::connection::{AsyncClient, AsyncClientFactory, Connection, ConnectionFactory};
use crate::dispatcher::{Dispatcher, Worker, WorkerHandle};
use crate::error::Error;
use crate::health_checker::{HealthCheckProber, HealthChecker};
use crate::host::{Host, MembershipSnapshot, SharedHostSet};
use crate::load_balancer::LoadBalancer;
use crate::outlier::{EventLogger, OutlierDetector};
use crate::resolver::DnsResolver;
use crate::runtime::RuntimeLoader;
use crate::stats::{ClusterStats, StatsStore};

const USE_HTTP2_KEY: &str = "upstream.use_http2";

/// Collaborators and tuning for a manager instance.
pub struct ClusterManagerOptions {
    pub num_workers: usize,
    /// Zone this proxy instance runs in; drives zone-aware balancing.
    pub local_zone: String,
    pub dns_resolver: Arc<dyn DnsResolver>,
    pub runtime: Arc<dyn RuntimeLoader>,
    pub stats: StatsStore,
    pub pool_factory: Arc<dyn ConnPoolFactory>,
    pub async_client_factory: Arc<dyn AsyncClientFactory>,
    pub create_connection: ConnectionFactory,
    pub prober: Arc<dyn HealthCheckProber>,
    /// Optional `slog` logger. Falls back to the `slog-stdlog` drain when
    /// absent.
    pub log: Option<Logger>,
    /// Seed for the per-worker balancer RNGs. Selection is fully
    /// deterministic for a fixed seed and snapshot.
    pub rng_seed: Option<u64>,
}

struct InitState {
    pending: usize,
    done: bool,
    cb: Option<Box<dyn FnOnce() + Send>>,
    sds_pollers: Vec<Arc<SdsPoller>>,
    sds_started: bool,
}

/// The control-plane owner of all clusters and workers.
pub struct ClusterManager {
    primary_clusters: HashMap<String, PrimaryCluster>,
    load_order: Vec<String>,
    workers: Vec<Worker>,
    init: Arc<Mutex<InitState>>,
    log: Logger,
}

impl ClusterManager {
    pub fn new(
        config: ClusterManagerConfig,
        opts: ClusterManagerOptions,
    ) -> Result<ClusterManager, Error> {
        let log = opts
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let event_logger = match &config.outlier_detection {
            Some(outlier_cfg) if !outlier_cfg.event_log_path.is_empty() => Some(Arc::new(
                EventLogger::new(&outlier_cfg.event_log_path, &log)?,
            )),
            _ => None,
        };

        // Every configured cluster, plus the sds bootstrap cluster when
        // present, must initialize before the global callback fires.
        let mut pending = config.clusters.len();
        if config.sds.is_some() {
            pending += 1;
        }
        let init = Arc::new(Mutex::new(InitState {
            pending,
            done: pending == 0,
            cb: None,
            sds_pollers: Vec::new(),
            sds_started: false,
        }));

        let mut manager = ClusterManager {
            primary_clusters: HashMap::new(),
            load_order: Vec::new(),
            workers: Vec::new(),
            init: init.clone(),
            log: log.clone(),
        };

        // The sds bootstrap cluster is loaded first, standalone, so that
        // sds-type clusters can be given a client against it.
        let mut sds_settings: Option<(Arc<ClusterInfo>, u64)> = None;
        if let Some(sds) = &config.sds {
            manager.load_cluster(&sds.cluster, &opts, &sds_settings, &event_logger)?;
            let bootstrap_info = manager.primary_clusters[&sds.cluster.name].info().clone();
            sds_settings = Some((bootstrap_info, sds.refresh_delay_ms));
        }

        for cluster_cfg in &config.clusters {
            manager.load_cluster(cluster_cfg, &opts, &sds_settings, &event_logger)?;
        }

        if let Some(local_name) = &config.local_cluster_name {
            if !manager.primary_clusters.contains_key(local_name) {
                return Err(Error::LocalClusterNotDefined(local_name.clone()));
            }
        }

        // Spawn the workers. Each one constructs its thread-local view on
        // its own thread; the local cluster entry is built first there so
        // other entries can reference its host set.
        let worker_infos: Vec<Arc<ClusterInfo>> = manager
            .load_order
            .iter()
            .map(|name| manager.primary_clusters[name].info().clone())
            .collect();
        let seed_base = opts
            .rng_seed
            .unwrap_or_else(|| rand::thread_rng().gen());
        for index in 0..opts.num_workers {
            let worker_init = WorkerInit {
                clusters: worker_infos.clone(),
                local_cluster_name: config.local_cluster_name.clone(),
                local_zone: opts.local_zone.clone(),
                runtime: opts.runtime.clone(),
                pool_factory: opts.pool_factory.clone(),
                async_client_factory: opts.async_client_factory.clone(),
                create_connection: opts.create_connection.clone(),
                seed: seed_base.wrapping_add((index as u64) << 32),
                log: log.new(o!("worker" => index)),
            };
            manager.workers.push(Worker::spawn(
                index,
                log.new(o!("worker" => index)),
                move |dispatcher| ThreadLocalClusterManager::new(worker_init, dispatcher),
            ));
        }

        // Fan membership out to every worker from here on.
        let handles: Vec<WorkerHandle> = manager.workers.iter().map(|w| w.handle()).collect();
        for name in &manager.load_order {
            let cluster = &manager.primary_clusters[name];
            let cb_name = name.clone();
            let cb_handles = handles.clone();
            cluster
                .state()
                .add_member_update_cb(Arc::new(move |snapshot, added, removed| {
                    post_membership_update(&cb_handles, &cb_name, snapshot, added, removed);
                }));
        }

        // Clusters that already have hosts (static ones) need an explicit
        // initial update so worker host sets are populated before first use.
        for name in &manager.load_order {
            let cluster = &manager.primary_clusters[name];
            let hosts = cluster.state().hosts();
            if hosts.is_empty() {
                continue;
            }
            let snapshot = cluster.state().snapshot();
            post_membership_update(&handles, name, &snapshot, &hosts, &[]);
        }

        for name in &manager.load_order {
            manager.primary_clusters[name].start();
        }

        Ok(manager)
    }

    fn load_cluster(
        &mut self,
        cfg: &ClusterConfig,
        opts: &ClusterManagerOptions,
        sds_settings: &Option<(Arc<ClusterInfo>, u64)>,
        event_logger: &Option<Arc<EventLogger>>,
    ) -> Result<(), Error> {
        if self.primary_clusters.contains_key(&cfg.name) {
            return Err(Error::DuplicateCluster(cfg.name.clone()));
        }
        let cluster_type = ClusterType::from_config_str(&cfg.cluster_type)?;

        let sds_params = match cluster_type {
            ClusterType::Sds => {
                let (bootstrap_info, refresh_delay_ms) = sds_settings
                    .as_ref()
                    .ok_or(Error::SdsConfigMissing)?;
                Some(SdsChannelParams {
                    client: opts.async_client_factory.create(bootstrap_info.clone()),
                    refresh_delay_ms: *refresh_delay_ms,
                })
            }
            _ => None,
        };

        let stats = ClusterStats::new(&cfg.name, &opts.stats);
        let mut cluster = PrimaryCluster::new(
            cfg,
            cluster_type,
            stats,
            &opts.dns_resolver,
            sds_params,
            &self.log,
        )?;

        if let Some(hc_cfg) = &cfg.health_check {
            cluster.set_health_checker(HealthChecker::new(
                hc_cfg,
                cluster.state().clone(),
                opts.prober.clone(),
                cluster.log(),
            )?);
        }

        if let Some(od_cfg) = &cfg.outlier_detection {
            cluster.set_outlier_detector(OutlierDetector::new(
                od_cfg,
                cluster.state().clone(),
                opts.runtime.clone(),
                &opts.stats,
                event_logger.clone(),
                cluster.log(),
            ));
        }

        if let Some(poller) = cluster.sds_poller() {
            self.init.lock().unwrap().sds_pollers.push(poller);
        }
        let init = self.init.clone();
        cluster
            .state()
            .set_initialized_cb(Box::new(move || ClusterManager::on_cluster_initialized(&init)));

        self.load_order.push(cfg.name.clone());
        self.primary_clusters.insert(cfg.name.clone(), cluster);
        Ok(())
    }

    fn on_cluster_initialized(init: &Arc<Mutex<InitState>>) {
        let (to_start, global_cb) = {
            let mut state = init.lock().unwrap();
            debug_assert!(state.pending > 0);
            state.pending -= 1;
            if state.pending == 0 {
                state.done = true;
                (Vec::new(), state.cb.take())
            } else if state.pending == state.sds_pollers.len() && !state.sds_started {
                // Everything except the sds clusters has initialized, so
                // the bootstrap cluster is resolvable. Start polling.
                state.sds_started = true;
                (state.sds_pollers.clone(), None)
            } else {
                (Vec::new(), None)
            }
        };

        for poller in to_start {
            poller.initialize();
        }
        if let Some(cb) = global_cb {
            cb();
        }
    }

    /// Descriptor for a cluster, from the primary map. Unknown names fail
    /// soft.
    pub fn get(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        self.primary_clusters
            .get(name)
            .map(|cluster| cluster.info().clone())
    }

    /// Register the global initialized callback. Runs exactly once, when
    /// every cluster, sds ones included, has published at least one host
    /// set. Fires immediately if that already happened.
    pub fn set_initialized_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        let mut state = self.init.lock().unwrap();
        if state.done {
            drop(state);
            cb();
        } else {
            state.cb = Some(cb);
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Run a closure on one worker's thread against its thread-local view.
    pub fn run_on_worker<F>(&self, index: usize, f: F)
    where
        F: FnOnce(&mut ThreadLocalClusterManager) + Send + 'static,
    {
        self.workers[index].post(Box::new(f));
    }

    /// Run a closure on every worker's thread.
    pub fn run_on_all_workers(&self, f: Arc<dyn Fn(&mut ThreadLocalClusterManager) + Send + Sync>) {
        for worker in &self.workers {
            let f = f.clone();
            worker.post(Box::new(move |manager| f(manager)));
        }
    }

    /// Graceful teardown: cancel every cluster timer, then stop and join the
    /// workers. Queued membership updates are still applied before a worker
    /// exits; its pools are dropped during its shutdown. Idempotent.
    pub fn stop(&mut self) {
        for cluster in self.primary_clusters.values() {
            cluster.stop();
        }
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn post_membership_update(
    handles: &[WorkerHandle],
    name: &str,
    snapshot: &MembershipSnapshot,
    added: &[Arc<Host>],
    removed: &[Arc<Host>],
) {
    for handle in handles {
        let name = name.to_string();
        let snapshot = snapshot.clone();
        let added = added.to_vec();
        let removed = removed.to_vec();
        handle.post(Box::new(move |manager| {
            manager.update_cluster_membership(&name, snapshot, &added, &removed);
        }));
    }
}

struct WorkerInit {
    clusters: Vec<Arc<ClusterInfo>>,
    local_cluster_name: Option<String>,
    local_zone: String,
    runtime: Arc<dyn RuntimeLoader>,
    pool_factory: Arc<dyn ConnPoolFactory>,
    async_client_factory: Arc<dyn AsyncClientFactory>,
    create_connection: ConnectionFactory,
    seed: u64,
    log: Logger,
}

struct ClusterEntry {
    info: Arc<ClusterInfo>,
    host_set: SharedHostSet,
    local_host_set: Option<SharedHostSet>,
    lb: LoadBalancer,
    async_client: Box<dyn AsyncClient>,
}

/// One worker's view of the world: a cluster entry per primary cluster,
/// each with its own balancer and async client handle, plus the worker's
/// connection pool registry.
pub struct ThreadLocalClusterManager {
    clusters: HashMap<String, ClusterEntry>,
    conn_pools: ConnPoolRegistry,
    dispatcher: Dispatcher,
    runtime: Arc<dyn RuntimeLoader>,
    pool_factory: Arc<dyn ConnPoolFactory>,
    create_connection: ConnectionFactory,
    log: Logger,
}

impl ThreadLocalClusterManager {
    fn new(init: WorkerInit, dispatcher: Dispatcher) -> ThreadLocalClusterManager {
        let mut manager = ThreadLocalClusterManager {
            clusters: HashMap::new(),
            conn_pools: ConnPoolRegistry::new(),
            dispatcher,
            runtime: init.runtime.clone(),
            pool_factory: init.pool_factory.clone(),
            create_connection: init.create_connection.clone(),
            log: init.log.clone(),
        };

        // Local cluster first, so every other entry's balancer can observe
        // its host set.
        let mut ordered: Vec<Arc<ClusterInfo>> = Vec::with_capacity(init.clusters.len());
        if let Some(local_name) = &init.local_cluster_name {
            for info in &init.clusters {
                if info.name() == local_name {
                    ordered.push(info.clone());
                }
            }
        }
        for info in &init.clusters {
            if Some(info.name()) != init.local_cluster_name.as_deref() {
                ordered.push(info.clone());
            }
        }

        let mut local_host_set: Option<SharedHostSet> = None;
        let mut seed = init.seed;
        for info in ordered {
            let is_local = Some(info.name()) == init.local_cluster_name.as_deref();
            let host_set = SharedHostSet::new();
            if is_local {
                local_host_set = Some(host_set.clone());
            }
            let lb = LoadBalancer::new(
                info.lb_type(),
                &init.local_zone,
                info.stats().clone(),
                init.runtime.clone(),
                seed,
            );
            seed = seed.wrapping_add(1);
            let entry = ClusterEntry {
                info: info.clone(),
                host_set,
                local_host_set: if is_local {
                    None
                } else {
                    local_host_set.clone()
                },
                lb,
                async_client: init.async_client_factory.create(info.clone()),
            };
            manager.clusters.insert(info.name().to_string(), entry);
        }

        // Purge pools for hosts that leave a cluster. Host identity keys
        // make this safe even when the same address comes straight back: a
        // readded address is a different host object.
        for entry in manager.clusters.values() {
            let registry = manager.conn_pools.clone();
            let drain_dispatcher = manager.dispatcher.clone();
            let drain_log = manager.log.clone();
            entry
                .host_set
                .lock()
                .add_member_update_cb(Arc::new(move |_snapshot, _added, removed| {
                    for host in removed {
                        registry.drain_host_pools(host, &drain_dispatcher, &drain_log);
                    }
                }));
        }

        manager
    }

    /// Apply a membership snapshot posted by the control plane.
    pub fn update_cluster_membership(
        &mut self,
        name: &str,
        snapshot: MembershipSnapshot,
        added: &[Arc<Host>],
        removed: &[Arc<Host>],
    ) {
        match self.clusters.get(name) {
            Some(entry) => entry.host_set.lock().update_hosts(
                snapshot.hosts,
                snapshot.healthy_hosts,
                snapshot.hosts_per_zone,
                snapshot.healthy_hosts_per_zone,
                added,
                removed,
            ),
            None => warn!(self.log, "membership update for unknown cluster '{}'", name),
        }
    }

    /// Descriptor for a cluster, from this worker's view. Unknown names
    /// fail soft.
    pub fn get(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        self.clusters.get(name).map(|entry| entry.info.clone())
    }

    /// Select a host and return its pooled HTTP connection instance for the
    /// priority, creating the pool on first use. `Ok(None)` means no host
    /// is available; an unknown cluster is an error, since routing tables
    /// must stay consistent with cluster configuration.
    pub fn http_conn_pool(
        &mut self,
        name: &str,
        priority: ResourcePriority,
    ) -> Result<Option<Arc<dyn ConnPool>>, Error> {
        let entry = self
            .clusters
            .get_mut(name)
            .ok_or_else(|| Error::UnknownCluster(name.to_string()))?;

        let host = {
            let host_set = entry.host_set.lock();
            let local = entry.local_host_set.as_ref().map(|set| set.lock());
            entry.lb.choose_host(&host_set, local.as_deref())
        };
        let host = match host {
            Some(host) => host,
            None => {
                entry.info.stats().upstream_cx_none_healthy.inc();
                return Ok(None);
            }
        };

        let kind = if entry.info.has_feature(ClusterInfo::FEATURE_HTTP2)
            && self.runtime.feature_enabled(USE_HTTP2_KEY, 100)
        {
            PoolKind::Http2
        } else {
            PoolKind::Http1
        };
        Ok(Some(self.conn_pools.pool_for(
            &host,
            priority,
            kind,
            self.pool_factory.as_ref(),
        )))
    }

    /// Select a host and create a raw connection to it. With no healthy
    /// host the pair is empty and `upstream_cx_none_healthy` is
    /// incremented; unlike pool selection there is no panic fallback for a
    /// raw connection.
    pub fn tcp_conn(
        &mut self,
        name: &str,
    ) -> Result<(Option<Box<dyn Connection>>, Option<Arc<Host>>), Error> {
        let entry = self
            .clusters
            .get_mut(name)
            .ok_or_else(|| Error::UnknownCluster(name.to_string()))?;

        let host = {
            let host_set = entry.host_set.lock();
            if host_set.healthy_hosts().is_empty() {
                None
            } else {
                let local = entry.local_host_set.as_ref().map(|set| set.lock());
                entry.lb.choose_host(&host_set, local.as_deref())
            }
        };
        match host {
            Some(host) => {
                let connection = (self.create_connection)(&host);
                Ok((Some(connection), Some(host)))
            }
            None => {
                entry.info.stats().upstream_cx_none_healthy.inc();
                Ok((None, None))
            }
        }
    }

    /// The async HTTP client handle for a cluster. Unknown clusters are an
    /// error, as for `http_conn_pool`.
    pub fn http_async_client(&mut self, name: &str) -> Result<&mut dyn AsyncClient, Error> {
        let entry = self
            .clusters
            .get_mut(name)
            .ok_or_else(|| Error::UnknownCluster(name.to_string()))?;
        Ok(entry.async_client.as_mut())
    }

    /// The worker's pool registry. Exposed for drain observation.
    pub fn conn_pools(&self) -> &ConnPoolRegistry {
        &self.conn_pools
    }

    /// This worker's current snapshot for a cluster.
    pub fn membership(&self, name: &str) -> Option<MembershipSnapshot> {
        self.clusters
            .get(name)
            .map(|entry| entry.host_set.lock().snapshot())
    }

    /// Drop every entry and pool. Run by the worker loop on exit.
    pub fn shutdown(&mut self) {
        self.conn_pools.clear();
        self.clusters.clear();
    }
}
