// Copyright 2020 Joyent, Inc.

//! Active health checking.
//!
//! The checker owns scheduling and hysteresis; the probe I/O itself is the
//! prober collaborator's business, which keeps this module free of sockets
//! and makes it straightforward to drive from tests. Every host in the
//! cluster gets a probe session. Consecutive failures past the unhealthy
//! threshold flip the host unhealthy; consecutive successes past the healthy
//! threshold flip it back. A confirmed flip triggers a healthy-set refresh
//! on the cluster, which fans out to the workers as a member update with an
//! empty delta.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use slog::{info, Logger};

use crate::cluster::SharedClusterState;
use crate::config::HealthCheckConfig;
use crate::error::Error;
use crate::host::{Host, HostId};

/// What a probe should do, per the configured check type.
pub enum ProbeSpec {
    /// Request the path and expect a 2xx within the timeout.
    Http { path: String },
    /// Connect, optionally write `send`, and expect `receive` echoed back.
    /// Empty payloads mean connect-only.
    Tcp { send: Vec<u8>, receive: Vec<u8> },
}

/// Callback reporting probe outcome: `true` for a passing probe.
pub type ProbeCb = Box<dyn FnOnce(bool) + Send>;

/// Probe transport contract. Implementations must not block the caller and
/// must deliver exactly one callback per probe, timing out internally.
pub trait HealthCheckProber: Send + Sync + 'static {
    fn probe(&self, host: &Arc<Host>, spec: &ProbeSpec, timeout: Duration, cb: ProbeCb);
}

struct Session {
    host: Arc<Host>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    in_flight: bool,
}

impl Session {
    fn new(host: Arc<Host>) -> Self {
        Session {
            host,
            consecutive_failures: 0,
            consecutive_successes: 0,
            in_flight: false,
        }
    }
}

struct HealthCheckerInner {
    state: SharedClusterState,
    prober: Arc<dyn HealthCheckProber>,
    spec: ProbeSpec,
    timeout: Duration,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    sessions: Mutex<HashMap<HostId, Session>>,
    log: Logger,
}

/// Active health checker for one cluster.
pub struct HealthChecker {
    inner: Arc<HealthCheckerInner>,
    interval_ms: u64,
    interval_jitter_ms: u64,
    timer: timer::Timer,
    guard: Mutex<Option<timer::Guard>>,
}

impl HealthChecker {
    pub fn new(
        cfg: &HealthCheckConfig,
        state: SharedClusterState,
        prober: Arc<dyn HealthCheckProber>,
        log: &Logger,
    ) -> Result<HealthChecker, Error> {
        let spec = match cfg.check_type.as_str() {
            "http" => ProbeSpec::Http {
                path: cfg.path.clone(),
            },
            "tcp" => ProbeSpec::Tcp {
                send: cfg.send.clone().into_bytes(),
                receive: cfg.receive.clone().into_bytes(),
            },
            other => return Err(Error::UnknownHealthCheckType(other.to_string())),
        };

        let inner = Arc::new(HealthCheckerInner {
            state,
            prober,
            spec,
            timeout: Duration::from_millis(cfg.timeout_ms),
            unhealthy_threshold: cfg.unhealthy_threshold,
            healthy_threshold: cfg.healthy_threshold,
            sessions: Mutex::new(HashMap::new()),
            log: log.clone(),
        });

        // Track membership so new hosts get sessions and removed hosts are
        // forgotten, in-flight probes included.
        let weak: Weak<HealthCheckerInner> = Arc::downgrade(&inner);
        inner
            .state
            .add_member_update_cb(Arc::new(move |_snapshot, added, removed| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_membership(added, removed);
                }
            }));

        Ok(HealthChecker {
            inner,
            interval_ms: cfg.interval_ms,
            interval_jitter_ms: cfg.interval_jitter_ms,
            timer: timer::Timer::new(),
            guard: Mutex::new(None),
        })
    }

    /// Seed sessions from current membership, arm the probe timer, and run
    /// the first round. The jitter offset desynchronizes the cadence of
    /// checkers that started together.
    pub fn start(&self) {
        let hosts = self.inner.state.hosts();
        self.inner.on_membership(&hosts, &[]);

        let jitter_ms = if self.interval_jitter_ms > 0 {
            rand::thread_rng().gen_range(0, self.interval_jitter_ms + 1)
        } else {
            0
        };
        let inner = self.inner.clone();
        let guard = self.timer.schedule_repeating(
            chrono::Duration::milliseconds((self.interval_ms + jitter_ms) as i64),
            move || HealthCheckerInner::on_interval(&inner),
        );
        *self.guard.lock().unwrap() = Some(guard);

        HealthCheckerInner::on_interval(&self.inner);
    }

    pub fn stop(&self) {
        *self.guard.lock().unwrap() = None;
    }
}

impl HealthCheckerInner {
    fn on_membership(&self, added: &[Arc<Host>], removed: &[Arc<Host>]) {
        let mut sessions = self.sessions.lock().unwrap();
        for host in added {
            sessions
                .entry(host.id())
                .or_insert_with(|| Session::new(host.clone()));
        }
        for host in removed {
            sessions.remove(&host.id());
        }
    }

    fn on_interval(inner: &Arc<HealthCheckerInner>) {
        let due: Vec<Arc<Host>> = {
            let mut sessions = inner.sessions.lock().unwrap();
            sessions
                .values_mut()
                .filter(|session| !session.in_flight)
                .map(|session| {
                    session.in_flight = true;
                    session.host.clone()
                })
                .collect()
        };

        for host in due {
            inner.state.info().stats().health_check_attempt.inc();
            let cb_inner = inner.clone();
            let cb_host = host.clone();
            inner.prober.probe(
                &host,
                &inner.spec,
                inner.timeout,
                Box::new(move |passed| cb_inner.on_probe_complete(&cb_host, passed)),
            );
        }
    }

    fn on_probe_complete(&self, host: &Arc<Host>, passed: bool) {
        let stats = self.state.info().stats();
        let transitioned = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = match sessions.get_mut(&host.id()) {
                Some(session) => session,
                // Removed while the probe was in flight.
                None => return,
            };
            session.in_flight = false;

            if passed {
                stats.health_check_success.inc();
                session.consecutive_successes += 1;
                session.consecutive_failures = 0;
                if !host.healthy() && session.consecutive_successes >= self.healthy_threshold {
                    host.set_healthy(true);
                    session.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            } else {
                stats.health_check_failure.inc();
                session.consecutive_failures += 1;
                session.consecutive_successes = 0;
                if host.healthy() && session.consecutive_failures >= self.unhealthy_threshold {
                    host.set_healthy(false);
                    session.consecutive_failures = 0;
                    true
                } else {
                    false
                }
            }
        };

        if transitioned {
            info!(
                self.log,
                "host {} now {}",
                host.address(),
                if host.healthy() { "healthy" } else { "unhealthy" }
            );
            self.state.refresh_healthy();
        }
    }
}
