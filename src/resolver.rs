// Copyright 2020 Joyent, Inc.

use std::net::IpAddr;

use crate::error::Error;

/// Callback invoked with the outcome of an asynchronous resolution. A failed
/// resolution is delivered as an `Err`; the owning cluster records it in its
/// stats and leaves membership untouched.
pub type ResolveCb = Box<dyn FnOnce(Result<Vec<IpAddr>, Error>) + Send>;

/// Asynchronous DNS resolution contract.
///
/// Implementations must not block the caller: `resolve` queues the lookup
/// and returns, and the callback fires on whatever thread the resolver runs
/// its I/O on. Timeouts and retries are the resolver's business; the cluster
/// manager only ever sees a completed result.
pub trait DnsResolver: Send + Sync + 'static {
    fn resolve(&self, hostname: &str, cb: ResolveCb);
}
