// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// Errors surfaced by the cluster manager.
///
/// The configuration variants are fatal at construction time and carry the
/// offending name so operators can find the bad entry. `UnknownCluster` is
/// the only error a data-plane caller can see; every other runtime failure
/// (resolver errors, failed probes, failed discovery polls) is absorbed by
/// the owning cluster and converted into stats.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config parse failure: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("cluster: unknown cluster type '{0}'")]
    UnknownClusterType(String),
    #[error("cluster: unknown lb type '{0}'")]
    UnknownLbType(String),
    #[error("cluster: unknown health check type '{0}'")]
    UnknownHealthCheckType(String),
    #[error("route: duplicate cluster '{0}'")]
    DuplicateCluster(String),
    #[error("local cluster '{0}' must be defined")]
    LocalClusterNotDefined(String),
    #[error("cannot create an sds cluster without an sds config")]
    SdsConfigMissing,
    #[error("cluster '{cluster}': invalid host address '{address}'")]
    InvalidHostAddress { cluster: String, address: String },
    #[error("cluster '{cluster}': {msg}")]
    InvalidClusterConfig { cluster: String, msg: String },
    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),
    #[error("dns resolution failure: {0}")]
    DnsFailure(String),
    #[error("http request failure: {0}")]
    RequestFailure(String),
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
