// Copyright 2020 Joyent, Inc.

//! JSON configuration for the cluster manager.
//!
//! The `type` and `lb_type` discriminators are carried as strings through
//! deserialization and converted by the validation helpers below so that a
//! bad value fails with a message naming the offender rather than a generic
//! parse error.

use std::net::SocketAddr;

use serde_derive::Deserialize;

use crate::error::Error;

/// Top-level configuration consumed by
/// [`ClusterManager::new`](../cluster_manager/struct.ClusterManager.html#method.new).
#[derive(Debug, Deserialize)]
pub struct ClusterManagerConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    pub sds: Option<SdsConfig>,
    pub local_cluster_name: Option<String>,
    pub outlier_detection: Option<OutlierLogConfig>,
}

impl ClusterManagerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Manager-wide outlier detection settings. Per-cluster enablement lives on
/// the cluster entry; this only carries the shared event log destination.
#[derive(Debug, Deserialize)]
pub struct OutlierLogConfig {
    #[serde(default)]
    pub event_log_path: String,
}

/// The service-discovery subscription: a bootstrap cluster definition for
/// the discovery endpoint itself plus the polling period.
#[derive(Debug, Deserialize)]
pub struct SdsConfig {
    pub cluster: ClusterConfig,
    pub refresh_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub cluster_type: String,
    pub lb_type: String,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub features: Vec<String>,
    pub dns_refresh_rate_ms: Option<u64>,
    pub health_check: Option<HealthCheckConfig>,
    pub outlier_detection: Option<OutlierDetectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct HostConfig {
    /// `ip:port` for static clusters, `hostname:port` for DNS clusters.
    pub address: String,
    #[serde(default)]
    pub zone: String,
}

#[derive(Debug, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(rename = "type")]
    pub check_type: String,
    pub timeout_ms: u64,
    pub interval_ms: u64,
    #[serde(default)]
    pub interval_jitter_ms: u64,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
    /// Probe path for HTTP checks.
    #[serde(default)]
    pub path: String,
    /// Optional payload to write for TCP checks.
    #[serde(default)]
    pub send: String,
    /// Expected echo for TCP checks; empty means connect-only.
    #[serde(default)]
    pub receive: String,
}

fn default_threshold() -> u32 {
    2
}

/// Per-cluster outlier detection. All fields are defaults that the matching
/// runtime keys may override.
#[derive(Debug, Default, Deserialize)]
pub struct OutlierDetectionConfig {
    pub consecutive_5xx: Option<u64>,
    pub base_ejection_time_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub max_ejection_percent: Option<u64>,
}

/// Closed set of cluster discovery types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClusterType {
    Static,
    StrictDns,
    LogicalDns,
    Sds,
}

impl ClusterType {
    pub fn from_config_str(value: &str) -> Result<Self, Error> {
        match value {
            "static" => Ok(ClusterType::Static),
            "strict_dns" => Ok(ClusterType::StrictDns),
            "logical_dns" => Ok(ClusterType::LogicalDns),
            "sds" => Ok(ClusterType::Sds),
            other => Err(Error::UnknownClusterType(other.to_string())),
        }
    }
}

/// Closed set of balancing policies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadBalancerType {
    RoundRobin,
    LeastRequest,
    Random,
}

impl LoadBalancerType {
    pub fn from_config_str(value: &str) -> Result<Self, Error> {
        match value {
            "round_robin" => Ok(LoadBalancerType::RoundRobin),
            "least_request" => Ok(LoadBalancerType::LeastRequest),
            "random" => Ok(LoadBalancerType::Random),
            other => Err(Error::UnknownLbType(other.to_string())),
        }
    }
}

/// Parse an `ip:port` literal for a static cluster host.
pub fn parse_socket_addr(cluster: &str, address: &str) -> Result<SocketAddr, Error> {
    address.parse().map_err(|_| Error::InvalidHostAddress {
        cluster: cluster.to_string(),
        address: address.to_string(),
    })
}

/// Split a `hostname:port` entry for a DNS cluster host.
pub fn parse_host_port(cluster: &str, address: &str) -> Result<(String, u16), Error> {
    let bad = || Error::InvalidHostAddress {
        cluster: cluster.to_string(),
        address: address.to_string(),
    };
    let idx = address.rfind(':').ok_or_else(bad)?;
    let (host, port) = address.split_at(idx);
    let port = port[1..].parse::<u16>().map_err(|_| bad())?;
    if host.is_empty() {
        return Err(bad());
    }
    Ok((host.to_string(), port))
}
