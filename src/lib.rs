// Copyright 2020 Joyent, Inc.

//! Upstream cluster management for a thread-per-core proxy
//!
//! Muster is the control-plane component that owns a proxy's upstream
//! *clusters* (named pools of backend hosts), keeps their membership and
//! health current, and gives each worker thread a local view from which
//! data-plane code obtains a connection to a balanced host. It is built for
//! proxies that run one cooperative event loop per core: workers never share
//! mutable state, and everything a worker knows about a cluster arrived as
//! an immutable snapshot posted onto its own queue.
//!
//! ## Clusters
//!
//! A cluster's membership comes from one of four discovery types selected in
//! configuration: `static` (hosts listed in the config), `strict_dns`
//! (every address behind one or more hostnames, re-resolved on a timer),
//! `logical_dns` (a single logical host that re-targets its address on each
//! resolution), and `sds` (a service-discovery subscription polled through a
//! bootstrap cluster). Each cluster reports *initialized* exactly once; a
//! manager-wide callback fires when every cluster has done so, which is the
//! signal that proxying can begin. Because the sds endpoint is itself a
//! cluster that may need DNS, sds clusters hold their first poll until all
//! of the other clusters have initialized.
//!
//! ## Membership fan-out
//!
//! The primary copy of each cluster lives on the control plane and is the
//! single writer. When discovery, a health check transition, or an outlier
//! ejection changes membership, the primary publishes a snapshot (the host
//! list plus its healthy and per-zone projections) and posts it with the
//! explicit added/removed delta to every worker. Workers replace their view
//! wholesale; they never lock or read primary state.
//!
//! ## Balancing and connection pools
//!
//! Each worker holds one balancer per cluster (`round_robin`,
//! `least_request`, or `random`, all optionally zone-aware) and a registry
//! of HTTP connection pools keyed by host identity and priority. Host
//! identity is an opaque object id, not an address: when a host is removed
//! its pools are drained (new streams stop, in-flight streams finish, then
//! the pools are deleted on the worker's deferred queue), and if the same
//! address is re-added later it is a new host with new pools. Raw TCP
//! connections bypass the pools but use the same host selection.
//!
//! ## Health
//!
//! An optional active health checker probes every host over HTTP or TCP and
//! flips hosts out of the healthy set after a run of failures. An optional
//! outlier detector watches response codes reported by the data plane and
//! temporarily ejects hosts that return consecutive 5xx responses, logging
//! each ejection as a JSON line when an event log is configured. Both feed
//! the same healthy-set refresh path as discovery, so workers see one
//! consistent view.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use muster::cluster_manager::{ClusterManager, ClusterManagerOptions};
//! use muster::config::ClusterManagerConfig;
//! use muster::conn_pool::ResourcePriority;
//! use muster::stats::StatsStore;
//!
//! let config = ClusterManagerConfig::from_json_str(
//!     r#"{
//!         "clusters": [
//!             {
//!                 "name": "service_a",
//!                 "type": "strict_dns",
//!                 "lb_type": "round_robin",
//!                 "hosts": [{"address": "service-a.internal:8080"}]
//!             }
//!         ]
//!     }"#,
//! )?;
//!
//! let opts = ClusterManagerOptions {
//!     num_workers: 4,
//!     local_zone: String::from("us-east-1a"),
//!     dns_resolver: my_resolver,
//!     runtime: my_runtime,
//!     stats: StatsStore::new(),
//!     pool_factory: my_pool_factory,
//!     async_client_factory: my_client_factory,
//!     create_connection: my_connector,
//!     prober: my_prober,
//!     log: Some(log),
//!     rng_seed: None,
//! };
//!
//! let manager = ClusterManager::new(config, opts)?;
//! manager.set_initialized_cb(Box::new(|| println!("clusters ready")));
//!
//! // On a worker, once initialized:
//! manager.run_on_worker(0, |view| {
//!     let pool = view.http_conn_pool("service_a", ResourcePriority::Default);
//!     // hand the pool to the codec ...
//! });
//! ```

pub mod cluster;
pub mod cluster_manager;
pub mod config;
pub mod conn_pool;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod health_checker;
pub mod host;
pub mod load_balancer;
pub mod outlier;
pub mod resolver;
pub mod runtime;
pub mod stats;
