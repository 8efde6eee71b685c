// Copyright 2020 Joyent, Inc.

//! Passive outlier detection.
//!
//! Every host carries a sink through which the data plane reports upstream
//! response codes and timings. Clusters without detection configured leave
//! the null sink in place, so the reporting call sites stay free of
//! conditionals. With detection enabled, a run of consecutive 5xx responses
//! ejects the host: it leaves the effective-healthy set, an event is
//! appended to the ejection log, and an interval timer returns it to service
//! once its hold-off expires. Hold-off grows with each ejection of the same
//! host, so a persistently bad backend spends progressively less time in
//! rotation.
//!
//! Ejection is bounded: when the share of already-ejected hosts in the
//! cluster reaches the configured maximum percentage, further ejections are
//! counted as overflow and skipped, keeping a misbehaving dependency from
//! emptying the whole cluster.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use slog::{info, warn, Logger};

use crate::cluster::SharedClusterState;
use crate::config::OutlierDetectionConfig;
use crate::error::Error;
use crate::host::{Host, HostId};
use crate::runtime::RuntimeLoader;
use crate::stats::{DetectionStats, StatsStore};

// Runtime keys, with the config entry (or the constant below) as default.
const CONSECUTIVE_5XX_KEY: &str = "outlier_detection.consecutive_5xx";
const ENFORCING_KEY: &str = "outlier_detection.enforcing";
const BASE_EJECTION_TIME_KEY: &str = "outlier_detection.base_ejection_time_ms";
const INTERVAL_KEY: &str = "outlier_detection.interval_ms";
const MAX_EJECTION_PERCENT_KEY: &str = "outlier_detection.max_ejection_percent";

const DEFAULT_CONSECUTIVE_5XX: u64 = 5;
const DEFAULT_BASE_EJECTION_TIME_MS: u64 = 30_000;
const DEFAULT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_MAX_EJECTION_PERCENT: u64 = 10;

/// Per-host sink for upstream observations.
pub trait DetectorHostSink: Send + Sync + 'static {
    fn num_ejections(&self) -> u32;
    fn put_http_response_code(&self, code: u64);
    fn put_response_time(&self, rt: Duration);
}

/// Sink for hosts whose cluster has detection disabled.
pub struct NullDetectorHostSink;

impl DetectorHostSink for NullDetectorHostSink {
    fn num_ejections(&self) -> u32 {
        0
    }

    fn put_http_response_code(&self, _code: u64) {}

    fn put_response_time(&self, _rt: Duration) {}
}

/// Appends ejection lifecycle events as JSON lines. Shared by every detector
/// in the manager. Write failures are logged and otherwise ignored; losing
/// an event record must not affect ejection itself.
pub struct EventLogger {
    file: Mutex<File>,
    log: Logger,
}

impl EventLogger {
    pub fn new(path: &str, log: &Logger) -> Result<EventLogger, Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(EventLogger {
            file: Mutex::new(file),
            log: log.clone(),
        })
    }

    fn log_eject(&self, cluster: &str, address: SocketAddr, num_ejections: u32) {
        self.write(serde_json::json!({
            "time": Utc::now().to_rfc3339(),
            "cluster": cluster,
            "upstream_url": address.to_string(),
            "action": "eject",
            "type": "5xx",
            "num_ejections": num_ejections,
        }));
    }

    fn log_uneject(&self, cluster: &str, address: SocketAddr) {
        self.write(serde_json::json!({
            "time": Utc::now().to_rfc3339(),
            "cluster": cluster,
            "upstream_url": address.to_string(),
            "action": "uneject",
        }));
    }

    fn write(&self, record: serde_json::Value) {
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{}", record) {
            warn!(self.log, "failed to append ejection event: {}", e);
        }
    }
}

struct HostSink {
    detector: Weak<DetectorInner>,
    // Weak so a removed host is not kept alive by its sink.
    host: Weak<Host>,
    consecutive_5xx: AtomicU32,
    num_ejections: AtomicU32,
    ejected_at: Mutex<Option<DateTime<Utc>>>,
}

impl DetectorHostSink for HostSink {
    fn num_ejections(&self) -> u32 {
        self.num_ejections.load(Ordering::Relaxed)
    }

    fn put_http_response_code(&self, code: u64) {
        if code < 500 {
            self.consecutive_5xx.store(0, Ordering::Relaxed);
            return;
        }
        let count = self.consecutive_5xx.fetch_add(1, Ordering::Relaxed) + 1;

        let detector = match self.detector.upgrade() {
            Some(detector) => detector,
            None => return,
        };
        let host = match self.host.upgrade() {
            Some(host) => host,
            None => return,
        };
        if u64::from(count) >= detector.consecutive_5xx_threshold() {
            self.consecutive_5xx.store(0, Ordering::Relaxed);
            DetectorInner::on_consecutive_5xx(&detector, &host);
        }
    }

    fn put_response_time(&self, _rt: Duration) {}
}

struct DetectorInner {
    state: SharedClusterState,
    runtime: Arc<dyn RuntimeLoader>,
    stats: DetectionStats,
    consecutive_5xx_default: u64,
    base_ejection_time_default: u64,
    max_ejection_percent_default: u64,
    sinks: Mutex<HashMap<HostId, Arc<HostSink>>>,
    event_logger: Option<Arc<EventLogger>>,
    log: Logger,
}

/// Outlier detector for one cluster. Owns its interval timer; dropping or
/// stopping the detector cancels any outstanding un-ejection work before
/// the sink map goes away.
pub struct OutlierDetector {
    inner: Arc<DetectorInner>,
    timer: timer::Timer,
    guard: Mutex<Option<timer::Guard>>,
}

impl OutlierDetector {
    pub fn new(
        cfg: &OutlierDetectionConfig,
        state: SharedClusterState,
        runtime: Arc<dyn RuntimeLoader>,
        stats_store: &StatsStore,
        event_logger: Option<Arc<EventLogger>>,
        log: &Logger,
    ) -> OutlierDetector {
        let stats = DetectionStats::new(state.info().name(), stats_store);
        let interval_ms = runtime.get_integer(
            INTERVAL_KEY,
            cfg.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS),
        );

        let inner = Arc::new(DetectorInner {
            state,
            runtime,
            stats,
            consecutive_5xx_default: cfg.consecutive_5xx.unwrap_or(DEFAULT_CONSECUTIVE_5XX),
            base_ejection_time_default: cfg
                .base_ejection_time_ms
                .unwrap_or(DEFAULT_BASE_EJECTION_TIME_MS),
            max_ejection_percent_default: cfg
                .max_ejection_percent
                .unwrap_or(DEFAULT_MAX_EJECTION_PERCENT),
            sinks: Mutex::new(HashMap::new()),
            event_logger,
            log: log.clone(),
        });

        // Sinks for hosts already present, then track membership.
        let initial = inner.state.hosts();
        DetectorInner::on_membership(&inner, &initial, &[]);
        let weak: Weak<DetectorInner> = Arc::downgrade(&inner);
        inner
            .state
            .add_member_update_cb(Arc::new(move |_snapshot, added, removed| {
                if let Some(inner) = weak.upgrade() {
                    DetectorInner::on_membership(&inner, added, removed);
                }
            }));

        let detector = OutlierDetector {
            inner: inner.clone(),
            timer: timer::Timer::new(),
            guard: Mutex::new(None),
        };
        let timer_inner = inner;
        let guard = detector.timer.schedule_repeating(
            chrono::Duration::milliseconds(interval_ms as i64),
            move || DetectorInner::on_interval(&timer_inner),
        );
        *detector.guard.lock().unwrap() = Some(guard);
        detector
    }

    /// Cancel the interval timer. No un-ejections run after this returns.
    pub fn stop(&self) {
        *self.guard.lock().unwrap() = None;
    }
}

impl DetectorInner {
    fn consecutive_5xx_threshold(&self) -> u64 {
        self.runtime
            .get_integer(CONSECUTIVE_5XX_KEY, self.consecutive_5xx_default)
    }

    fn on_membership(inner: &Arc<DetectorInner>, added: &[Arc<Host>], removed: &[Arc<Host>]) {
        let mut sinks = inner.sinks.lock().unwrap();
        for host in added {
            let sink = Arc::new(HostSink {
                detector: Arc::downgrade(inner),
                host: Arc::downgrade(host),
                consecutive_5xx: AtomicU32::new(0),
                num_ejections: AtomicU32::new(0),
                ejected_at: Mutex::new(None),
            });
            host.set_outlier_sink(sink.clone());
            sinks.insert(host.id(), sink);
        }
        for host in removed {
            sinks.remove(&host.id());
        }
    }

    fn on_consecutive_5xx(inner: &Arc<DetectorInner>, host: &Arc<Host>) {
        if host.ejected() {
            return;
        }
        if !inner.runtime.feature_enabled(ENFORCING_KEY, 100) {
            return;
        }

        // Cap the share of the cluster that may be out at once.
        let hosts = inner.state.hosts();
        let total = hosts.len();
        let already_ejected = hosts.iter().filter(|h| h.ejected()).count();
        let max_percent = inner.runtime.get_integer(
            MAX_EJECTION_PERCENT_KEY,
            inner.max_ejection_percent_default,
        );
        if total == 0 || (already_ejected * 100 / total) as u64 >= max_percent {
            inner.stats.ejections_overflow.inc();
            return;
        }

        let sink = match inner.sinks.lock().unwrap().get(&host.id()).cloned() {
            Some(sink) => sink,
            None => return,
        };
        sink.num_ejections.fetch_add(1, Ordering::Relaxed);
        *sink.ejected_at.lock().unwrap() = Some(Utc::now());
        host.set_ejected(true);

        inner.stats.ejections_total.inc();
        inner.stats.ejections_consecutive_5xx.inc();
        inner.stats.ejections_active.inc();
        warn!(
            inner.log,
            "ejecting host {} after consecutive 5xx",
            host.address()
        );
        if let Some(logger) = &inner.event_logger {
            logger.log_eject(
                inner.state.info().name(),
                host.address(),
                sink.num_ejections(),
            );
        }

        inner.state.refresh_healthy();
    }

    fn on_interval(inner: &Arc<DetectorInner>) {
        let now = Utc::now();
        let base_ms = inner.runtime.get_integer(
            BASE_EJECTION_TIME_KEY,
            inner.base_ejection_time_default,
        );

        let mut unejected: Vec<Arc<Host>> = Vec::new();
        {
            let sinks = inner.sinks.lock().unwrap();
            for sink in sinks.values() {
                let host = match sink.host.upgrade() {
                    Some(host) => host,
                    None => continue,
                };
                if !host.ejected() {
                    continue;
                }
                let ejected_at = match *sink.ejected_at.lock().unwrap() {
                    Some(time) => time,
                    None => continue,
                };
                let hold = chrono::Duration::milliseconds(
                    (base_ms * u64::from(sink.num_ejections())) as i64,
                );
                if now.signed_duration_since(ejected_at) >= hold {
                    host.set_ejected(false);
                    sink.consecutive_5xx.store(0, Ordering::Relaxed);
                    unejected.push(host);
                }
            }
        }

        if !unejected.is_empty() {
            for host in &unejected {
                inner.stats.ejections_active.dec();
                info!(inner.log, "unejecting host {}", host.address());
                if let Some(logger) = &inner.event_logger {
                    logger.log_uneject(inner.state.info().name(), host.address());
                }
            }
            inner.state.refresh_healthy();
        }
    }
}
