// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::sync::Arc;

use muster::cluster::ClusterInfo;
use muster::config::LoadBalancerType;
use muster::host::{partition, Host, HostSet};
use muster::load_balancer::LoadBalancer;
use muster::runtime::StaticRuntime;
use muster::stats::{ClusterStats, StatsStore};

fn cluster_info(name: &str, store: &StatsStore) -> Arc<ClusterInfo> {
    Arc::new(ClusterInfo::new(
        name,
        0,
        LoadBalancerType::RoundRobin,
        ClusterStats::new(name, store),
    ))
}

fn host(cluster: &Arc<ClusterInfo>, address: &str, zone: &str) -> Arc<Host> {
    Host::new(cluster.clone(), address.parse().unwrap(), zone)
}

fn host_set(hosts: Vec<Arc<Host>>) -> HostSet {
    let mut set = HostSet::new();
    let (healthy, per_zone, healthy_per_zone) = partition(&hosts);
    set.update_hosts(
        Arc::new(hosts),
        healthy,
        per_zone,
        healthy_per_zone,
        &[],
        &[],
    );
    set
}

fn balancer(kind: LoadBalancerType, local_zone: &str, store: &StatsStore, seed: u64) -> LoadBalancer {
    LoadBalancer::new(
        kind,
        local_zone,
        ClusterStats::new("up", store),
        Arc::new(StaticRuntime::new()),
        seed,
    )
}

#[test]
fn partition_projections_are_consistent() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let h1 = host(&info, "10.0.0.1:80", "a");
    let h2 = host(&info, "10.0.0.2:80", "b");
    let h3 = host(&info, "10.0.0.3:80", "a");
    h2.set_healthy(false);

    let hosts = vec![h1.clone(), h2.clone(), h3.clone()];
    let (healthy, per_zone, healthy_per_zone) = partition(&hosts);

    // Healthy is a subsequence of hosts.
    assert_eq!(healthy.len(), 2);
    assert!(healthy.iter().all(|h| hosts.iter().any(|o| o == h)));

    // Concatenating the per-zone lists yields a permutation of hosts.
    let mut flattened: Vec<_> = per_zone.values().flatten().map(|h| h.id()).collect();
    flattened.sort();
    let mut all: Vec<_> = hosts.iter().map(|h| h.id()).collect();
    all.sort();
    assert_eq!(flattened, all);

    // Per-zone healthy lists are subsets, and a fully-unhealthy zone keeps
    // its key with an empty list.
    assert_eq!(healthy_per_zone["a"].len(), 2);
    assert!(healthy_per_zone["b"].is_empty());
}

#[test]
fn round_robin_cycles_through_healthy_hosts() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let hosts = vec![
        host(&info, "10.0.0.1:80", ""),
        host(&info, "10.0.0.2:80", ""),
        host(&info, "10.0.0.3:80", ""),
    ];
    let set = host_set(hosts.clone());

    let mut lb = balancer(LoadBalancerType::RoundRobin, "", &store, 1);
    for expected in &[0usize, 1, 2, 0, 1] {
        let chosen = lb.choose_host(&set, None).unwrap();
        assert_eq!(chosen.id(), hosts[*expected].id());
    }
}

#[test]
fn round_robin_skips_unhealthy_hosts() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let h1 = host(&info, "10.0.0.1:80", "");
    let h2 = host(&info, "10.0.0.2:80", "");
    let h3 = host(&info, "10.0.0.3:80", "");
    h2.set_healthy(false);
    let set = host_set(vec![h1.clone(), h2, h3.clone()]);

    let mut lb = balancer(LoadBalancerType::RoundRobin, "", &store, 1);
    let ids: Vec<_> = (0..4)
        .map(|_| lb.choose_host(&set, None).unwrap().id())
        .collect();
    assert_eq!(ids, vec![h1.id(), h3.id(), h1.id(), h3.id()]);
    assert_eq!(store.value("cluster.up.lb_healthy_panic"), Some(0));
}

#[test]
fn panic_mode_uses_all_hosts_when_none_are_healthy() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let h1 = host(&info, "10.0.0.1:80", "");
    let h2 = host(&info, "10.0.0.2:80", "");
    h1.set_healthy(false);
    h2.set_healthy(false);
    let set = host_set(vec![h1.clone(), h2.clone()]);

    let mut lb = balancer(LoadBalancerType::RoundRobin, "", &store, 1);
    let first = lb.choose_host(&set, None).unwrap();
    let second = lb.choose_host(&set, None).unwrap();
    assert_eq!(first.id(), h1.id());
    assert_eq!(second.id(), h2.id());
    assert_eq!(store.value("cluster.up.lb_healthy_panic"), Some(2));
}

#[test]
fn empty_cluster_selects_nothing() {
    let store = StatsStore::new();
    let set = host_set(Vec::new());
    let mut lb = balancer(LoadBalancerType::RoundRobin, "", &store, 1);
    assert!(lb.choose_host(&set, None).is_none());
    // No panic either: there was nothing to panic onto.
    assert_eq!(store.value("cluster.up.lb_healthy_panic"), Some(0));
}

#[test]
fn least_request_prefers_the_less_loaded_host() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let busy = host(&info, "10.0.0.1:80", "");
    let idle = host(&info, "10.0.0.2:80", "");
    for _ in 0..5 {
        busy.requests_inc();
    }
    let set = host_set(vec![busy.clone(), idle.clone()]);

    let mut lb = balancer(LoadBalancerType::LeastRequest, "", &store, 42);
    let mut idle_count = 0;
    for _ in 0..100 {
        if lb.choose_host(&set, None).unwrap().id() == idle.id() {
            idle_count += 1;
        }
    }
    // Two random picks hit the busy host twice a quarter of the time, so
    // the idle host must dominate.
    assert!(idle_count > 50, "idle host chosen {} times", idle_count);
}

#[test]
fn least_request_degrades_to_single_pick() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let h1 = host(&info, "10.0.0.1:80", "");
    let h2 = host(&info, "10.0.0.2:80", "");
    h2.set_healthy(false);
    let set = host_set(vec![h1.clone(), h2]);

    let mut lb = balancer(LoadBalancerType::LeastRequest, "", &store, 42);
    for _ in 0..10 {
        assert_eq!(lb.choose_host(&set, None).unwrap().id(), h1.id());
    }
}

#[test]
fn random_covers_the_healthy_set() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let h1 = host(&info, "10.0.0.1:80", "");
    let h2 = host(&info, "10.0.0.2:80", "");
    let set = host_set(vec![h1, h2]);

    let mut lb = balancer(LoadBalancerType::Random, "", &store, 42);
    let chosen: HashSet<_> = (0..100)
        .map(|_| lb.choose_host(&set, None).unwrap().id())
        .collect();
    assert_eq!(chosen.len(), 2);
}

#[test]
fn selection_is_deterministic_for_a_seed() {
    let store = StatsStore::new();
    let info = cluster_info("up", &store);
    let hosts = vec![
        host(&info, "10.0.0.1:80", ""),
        host(&info, "10.0.0.2:80", ""),
        host(&info, "10.0.0.3:80", ""),
    ];
    let set = host_set(hosts);

    let mut first = balancer(LoadBalancerType::Random, "", &store, 1234);
    let mut second = balancer(LoadBalancerType::Random, "", &store, 1234);
    for _ in 0..50 {
        assert_eq!(
            first.choose_host(&set, None).unwrap().id(),
            second.choose_host(&set, None).unwrap().id()
        );
    }
}

#[test]
fn zone_aware_selection_prefers_the_local_zone() {
    let store = StatsStore::new();
    let upstream = cluster_info("up", &store);
    let local_info = cluster_info("local", &store);

    let in_zone = host(&upstream, "10.0.0.1:80", "a");
    let out_of_zone = host(&upstream, "10.0.0.2:80", "b");
    let upstream_set = host_set(vec![in_zone.clone(), out_of_zone]);

    // Four of five local hosts are in zone a: 80% meets the default
    // threshold exactly.
    let mut local_hosts = vec![
        host(&local_info, "10.1.0.1:80", "a"),
        host(&local_info, "10.1.0.2:80", "a"),
        host(&local_info, "10.1.0.3:80", "a"),
        host(&local_info, "10.1.0.4:80", "a"),
        host(&local_info, "10.1.0.5:80", "b"),
    ];
    let local_set = host_set(local_hosts.clone());

    let mut lb = balancer(LoadBalancerType::RoundRobin, "a", &store, 1);
    for _ in 0..6 {
        assert_eq!(
            lb.choose_host(&upstream_set, Some(&local_set)).unwrap().id(),
            in_zone.id()
        );
    }

    // Drop below the threshold: 60% in zone, so selection goes global.
    local_hosts[2].set_healthy(false);
    local_hosts[3] = host(&local_info, "10.1.0.4:80", "b");
    let local_set = host_set(local_hosts);
    let mut lb = balancer(LoadBalancerType::RoundRobin, "a", &store, 1);
    let ids: HashSet<_> = (0..4)
        .map(|_| lb.choose_host(&upstream_set, Some(&local_set)).unwrap().id())
        .collect();
    assert_eq!(ids.len(), 2);
}

#[test]
fn zone_awareness_is_disabled_by_an_empty_upstream_zone() {
    let store = StatsStore::new();
    let upstream = cluster_info("up", &store);
    let local_info = cluster_info("local", &store);

    let h_a = host(&upstream, "10.0.0.1:80", "a");
    let h_b = host(&upstream, "10.0.0.2:80", "b");
    let h_c = host(&upstream, "10.0.0.3:80", "c");
    h_c.set_healthy(false);
    let upstream_set = host_set(vec![h_a, h_b, h_c]);

    // Every local host sits in zone a, which would otherwise force local
    // balancing; the empty upstream zone c disables the feature entirely.
    let local_set = host_set(vec![
        host(&local_info, "10.1.0.1:80", "a"),
        host(&local_info, "10.1.0.2:80", "a"),
    ]);

    let mut lb = balancer(LoadBalancerType::RoundRobin, "a", &store, 1);
    let ids: HashSet<_> = (0..4)
        .map(|_| lb.choose_host(&upstream_set, Some(&local_set)).unwrap().id())
        .collect();
    assert_eq!(ids.len(), 2);
}
