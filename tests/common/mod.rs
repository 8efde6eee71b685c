// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use muster::cluster::ClusterInfo;
use muster::cluster_manager::{ClusterManager, ClusterManagerOptions, ThreadLocalClusterManager};
use muster::conn_pool::{ConnPool, ConnPoolFactory, DrainedCb, PoolKind, ResourcePriority};
use muster::connection::{AsyncClient, AsyncClientFactory, Connection, ResponseCb};
use muster::error::Error;
use muster::health_checker::{HealthCheckProber, ProbeCb, ProbeSpec};
use muster::host::Host;
use muster::resolver::{DnsResolver, ResolveCb};
use muster::runtime::StaticRuntime;
use muster::stats::StatsStore;

#[derive(Debug)]
pub struct DummyConnection {
    pub connected: bool,
}

impl DummyConnection {
    pub fn new() -> Self {
        DummyConnection { connected: false }
    }
}

impl Connection for DummyConnection {
    fn connect(&mut self) -> Result<(), Error> {
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.connected = false;
        Ok(())
    }
}

/// A pool that records its identity and completes a drain as soon as it is
/// asked to, as a real pool with no in-flight streams would.
pub struct FakePool {
    pub address: SocketAddr,
    pub priority: ResourcePriority,
    pub kind: PoolKind,
    drained: AtomicBool,
    callbacks: Mutex<Vec<DrainedCb>>,
}

impl FakePool {
    pub fn drain_called(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }
}

impl ConnPool for FakePool {
    fn add_drained_callback(&self, cb: DrainedCb) {
        self.callbacks.lock().unwrap().push(cb);
    }

    fn drain_connections(&self) {
        self.drained.store(true, Ordering::SeqCst);
        let callbacks: Vec<DrainedCb> = self.callbacks.lock().unwrap().drain(..).collect();
        for cb in callbacks {
            cb();
        }
    }
}

#[derive(Default)]
pub struct FakePoolFactory {
    pub allocated: Mutex<Vec<(SocketAddr, ResourcePriority, PoolKind)>>,
    pub pools: Mutex<Vec<Arc<FakePool>>>,
}

impl FakePoolFactory {
    pub fn new() -> Self {
        FakePoolFactory::default()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocated.lock().unwrap().len()
    }

    pub fn pool_for_address(&self, address: SocketAddr) -> Option<Arc<FakePool>> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .find(|pool| pool.address == address)
            .cloned()
    }
}

impl ConnPoolFactory for FakePoolFactory {
    fn allocate(
        &self,
        kind: PoolKind,
        host: &Arc<Host>,
        priority: ResourcePriority,
    ) -> Arc<dyn ConnPool> {
        let pool = Arc::new(FakePool {
            address: host.address(),
            priority,
            kind,
            drained: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        });
        self.allocated
            .lock()
            .unwrap()
            .push((host.address(), priority, kind));
        self.pools.lock().unwrap().push(pool.clone());
        pool
    }
}

/// Scripted resolver: each hostname gets a list of responses consumed one
/// per resolution, with the final entry repeating forever. `None` entries
/// simulate a resolution failure.
pub struct FakeDnsResolver {
    scripts: Mutex<HashMap<String, (Vec<Option<Vec<IpAddr>>>, usize)>>,
}

impl FakeDnsResolver {
    pub fn new() -> Self {
        FakeDnsResolver {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, hostname: &str, responses: Vec<Option<Vec<IpAddr>>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(hostname.to_string(), (responses, 0));
    }
}

impl DnsResolver for FakeDnsResolver {
    fn resolve(&self, hostname: &str, cb: ResolveCb) {
        let response = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(hostname) {
                Some((responses, index)) => {
                    let current = responses[(*index).min(responses.len() - 1)].clone();
                    *index += 1;
                    Some(current)
                }
                None => None,
            }
        };
        match response {
            Some(Some(addresses)) => cb(Ok(addresses)),
            Some(None) => cb(Err(Error::DnsFailure(format!(
                "scripted failure for {}",
                hostname
            )))),
            None => cb(Err(Error::DnsFailure(format!(
                "no script for {}",
                hostname
            )))),
        }
    }
}

/// Scripted responses for the service-discovery endpoint, shared by every
/// async client the factory hands out. Entries are consumed per request with
/// the final entry repeating; `None` simulates a request failure.
pub struct SdsScript {
    responses: Mutex<(Vec<Option<String>>, usize)>,
}

impl SdsScript {
    pub fn new() -> Self {
        SdsScript {
            responses: Mutex::new((Vec::new(), 0)),
        }
    }

    pub fn script(&self, responses: Vec<Option<String>>) {
        *self.responses.lock().unwrap() = (responses, 0);
    }

    fn next(&self) -> Option<String> {
        let mut state = self.responses.lock().unwrap();
        let (responses, index) = &mut *state;
        if responses.is_empty() {
            return None;
        }
        let current = responses[(*index).min(responses.len() - 1)].clone();
        *index += 1;
        current
    }
}

/// Build a v1 registration response body.
pub fn sds_body(hosts: &[(&str, u16, &str)]) -> String {
    let entries: Vec<String> = hosts
        .iter()
        .map(|(ip, port, az)| {
            format!(
                r#"{{"ip_address": "{}", "port": {}, "tags": {{"az": "{}"}}}}"#,
                ip, port, az
            )
        })
        .collect();
    format!(r#"{{"hosts": [{}]}}"#, entries.join(", "))
}

pub struct FakeAsyncClient {
    script: Arc<SdsScript>,
}

impl AsyncClient for FakeAsyncClient {
    fn request(&mut self, _path: &str, cb: ResponseCb) {
        match self.script.next() {
            Some(body) => cb(Ok(body.into_bytes())),
            None => cb(Err(Error::RequestFailure(String::from(
                "scripted failure",
            )))),
        }
    }
}

pub struct FakeAsyncClientFactory {
    pub script: Arc<SdsScript>,
}

impl FakeAsyncClientFactory {
    pub fn new(script: Arc<SdsScript>) -> Self {
        FakeAsyncClientFactory { script }
    }
}

impl AsyncClientFactory for FakeAsyncClientFactory {
    fn create(&self, _cluster: Arc<ClusterInfo>) -> Box<dyn AsyncClient> {
        Box::new(FakeAsyncClient {
            script: self.script.clone(),
        })
    }
}

/// Probe outcomes per address; unknown addresses pass. Callbacks fire
/// synchronously.
pub struct FakeProber {
    results: Mutex<HashMap<SocketAddr, bool>>,
}

impl FakeProber {
    pub fn new() -> Self {
        FakeProber {
            results: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_result(&self, address: SocketAddr, passes: bool) {
        self.results.lock().unwrap().insert(address, passes);
    }
}

impl HealthCheckProber for FakeProber {
    fn probe(&self, host: &Arc<Host>, _spec: &ProbeSpec, _timeout: Duration, cb: ProbeCb) {
        let passes = self
            .results
            .lock()
            .unwrap()
            .get(&host.address())
            .copied()
            .unwrap_or(true);
        cb(passes);
    }
}

/// Everything a manager needs, with handles kept for assertions.
pub struct TestContext {
    pub resolver: Arc<FakeDnsResolver>,
    pub pool_factory: Arc<FakePoolFactory>,
    pub prober: Arc<FakeProber>,
    pub sds: Arc<SdsScript>,
    pub stats: StatsStore,
}

impl TestContext {
    pub fn new() -> Self {
        TestContext {
            resolver: Arc::new(FakeDnsResolver::new()),
            pool_factory: Arc::new(FakePoolFactory::new()),
            prober: Arc::new(FakeProber::new()),
            sds: Arc::new(SdsScript::new()),
            stats: StatsStore::new(),
        }
    }

    pub fn options(
        &self,
        num_workers: usize,
        local_zone: &str,
        runtime: StaticRuntime,
    ) -> ClusterManagerOptions {
        ClusterManagerOptions {
            num_workers,
            local_zone: local_zone.to_string(),
            dns_resolver: self.resolver.clone(),
            runtime: Arc::new(runtime),
            stats: self.stats.clone(),
            pool_factory: self.pool_factory.clone(),
            async_client_factory: Arc::new(FakeAsyncClientFactory::new(self.sds.clone())),
            create_connection: Arc::new(|_host: &Host| {
                Box::new(DummyConnection::new()) as Box<dyn Connection>
            }),
            prober: self.prober.clone(),
            log: None,
            rng_seed: Some(7),
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.stats.value(name).unwrap_or(0)
    }
}

/// Run a closure on a worker and wait for its result.
pub fn on_worker<T, F>(manager: &ClusterManager, index: usize, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&mut ThreadLocalClusterManager) -> T + Send + 'static,
{
    let (tx, rx) = channel();
    manager.run_on_worker(index, move |view| {
        let _ = tx.send(f(view));
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("worker did not respond")
}

/// The addresses a worker currently holds for a cluster.
pub fn worker_addresses(manager: &ClusterManager, index: usize, cluster: &str) -> Vec<SocketAddr> {
    on_worker(manager, index, {
        let cluster = cluster.to_string();
        move |view| {
            view.membership(&cluster)
                .map(|snapshot| snapshot.hosts.iter().map(|host| host.address()).collect())
                .unwrap_or_default()
        }
    })
}

/// The healthy addresses a worker currently holds for a cluster.
pub fn worker_healthy_addresses(
    manager: &ClusterManager,
    index: usize,
    cluster: &str,
) -> Vec<SocketAddr> {
    on_worker(manager, index, {
        let cluster = cluster.to_string();
        move |view| {
            view.membership(&cluster)
                .map(|snapshot| {
                    snapshot
                        .healthy_hosts
                        .iter()
                        .map(|host| host.address())
                        .collect()
                })
                .unwrap_or_default()
        }
    })
}

/// Spin until the condition holds or the deadline passes. Returns the final
/// evaluation.
pub fn poll_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn addr(literal: &str) -> SocketAddr {
    literal.parse().unwrap()
}

pub fn ip(literal: &str) -> IpAddr {
    literal.parse().unwrap()
}
