// Copyright 2020 Joyent, Inc.

//! Connection and async-client contracts.
//!
//! The manager never opens sockets itself. Raw TCP connections come from a
//! caller-supplied factory, and per-cluster HTTP traffic flows through an
//! async client handle the embedding proxy implements. Both seams exist so
//! the manager can be exercised end to end with in-memory fakes.

use std::sync::Arc;

use crate::cluster::ClusterInfo;
use crate::error::Error;
use crate::host::Host;

/// A logical connection to one backend. Not necessarily a bare TCP socket;
/// anything that can be established and torn down qualifies.
pub trait Connection: Send + 'static {
    /// Attempt to establish the connection to the host it was created for.
    fn connect(&mut self) -> Result<(), Error>;
    /// Close the connection.
    fn close(&mut self) -> Result<(), Error>;
}

/// Factory producing an unestablished [`Connection`](trait.Connection.html)
/// for a host. Invoked by `tcp_conn` after host selection.
pub type ConnectionFactory = Arc<dyn Fn(&Host) -> Box<dyn Connection> + Send + Sync>;

/// Callback invoked with a response body or a terminal request failure.
pub type ResponseCb = Box<dyn FnOnce(Result<Vec<u8>, Error>) + Send>;

/// An asynchronous HTTP client bound to one cluster. Requests are balanced
/// over the cluster by the implementation; the manager only routes callers
/// to the right handle.
pub trait AsyncClient: Send + 'static {
    fn request(&mut self, path: &str, cb: ResponseCb);
}

/// Factory for per-cluster async client handles. Each worker creates one
/// handle per cluster entry; the service-discovery poller creates one more
/// against its bootstrap cluster.
pub trait AsyncClientFactory: Send + Sync + 'static {
    fn create(&self, cluster: Arc<ClusterInfo>) -> Box<dyn AsyncClient>;
}
