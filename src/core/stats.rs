use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use http::Method;

use crate::error::ErrorKind;
use crate::util::lock_unpoisoned;

/// Identity attached to every stats event.
#[derive(Clone, Debug)]
pub struct StatsLabels {
    pub request_id: u64,
    pub method: Method,
    pub domain: String,
    pub endpoint: String,
    pub tags: Vec<String>,
}

/// The closed set of lifecycle events the core emits. Each fires at most
/// once per logical lifecycle point of a request.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StatsEvent {
    RequestStart {
        labels: StatsLabels,
    },
    RequestSuccess {
        labels: StatsLabels,
        status: u16,
        attempts: usize,
        elapsed_ms: u64,
    },
    RequestFail {
        labels: StatsLabels,
        kind: ErrorKind,
        status: Option<u16>,
        attempts: usize,
        elapsed_ms: u64,
    },
    RequestRetry {
        labels: StatsLabels,
        attempt: usize,
        delay_ms: u64,
    },
    DedupHit {
        labels: StatsLabels,
        from_cache: bool,
    },
    DedupMiss {
        labels: StatsLabels,
    },
    DebounceCancel {
        labels: StatsLabels,
    },
    DebounceDispatch {
        labels: StatsLabels,
        held_ms: u64,
    },
    RateLimitWait {
        labels: StatsLabels,
        bucket: String,
        wait_ms: u64,
    },
    RateLimitAdmit {
        labels: StatsLabels,
        bucket: String,
    },
    HedgeLaunch {
        labels: StatsLabels,
        hedge_index: usize,
        delay_ms: u64,
    },
    HedgeWin {
        labels: StatsLabels,
        hedge_index: usize,
        elapsed_ms: u64,
    },
    HedgeCancel {
        labels: StatsLabels,
        hedge_index: usize,
    },
}

impl StatsEvent {
    pub fn labels(&self) -> &StatsLabels {
        match self {
            Self::RequestStart { labels }
            | Self::RequestSuccess { labels, .. }
            | Self::RequestFail { labels, .. }
            | Self::RequestRetry { labels, .. }
            | Self::DedupHit { labels, .. }
            | Self::DedupMiss { labels }
            | Self::DebounceCancel { labels }
            | Self::DebounceDispatch { labels, .. }
            | Self::RateLimitWait { labels, .. }
            | Self::RateLimitAdmit { labels, .. }
            | Self::HedgeLaunch { labels, .. }
            | Self::HedgeWin { labels, .. }
            | Self::HedgeCancel { labels, .. } => labels,
        }
    }
}

/// Consumer of stats events. Implementations must not block; emission is
/// synchronous best-effort fan-out.
pub trait StatsSink: Send + Sync {
    fn on_event(&self, event: &StatsEvent);
}

#[derive(Clone)]
pub(crate) struct StatsBus {
    sinks: Arc<[Arc<dyn StatsSink>]>,
}

impl StatsBus {
    pub(crate) fn new(sinks: Vec<Arc<dyn StatsSink>>) -> Self {
        Self {
            sinks: sinks.into(),
        }
    }

    pub(crate) fn emit(&self, event: StatsEvent) {
        for sink in self.sinks.iter() {
            sink.on_event(&event);
        }
    }
}

/// Point-in-time copy of the built-in counters.
#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub dedup_hits: u64,
    pub dedup_misses: u64,
    pub debounce_cancelled: u64,
    pub debounce_dispatched: u64,
    pub rate_limit_waits: u64,
    pub rate_limit_wait_ms_total: u64,
    pub hedges_launched: u64,
    pub hedges_won: u64,
    pub hedges_cancelled: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Built-in sink backing `Client::metrics_snapshot`.
#[derive(Debug, Default)]
pub(crate) struct MetricsCollector {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    dedup_hits: AtomicU64,
    dedup_misses: AtomicU64,
    debounce_cancelled: AtomicU64,
    debounce_dispatched: AtomicU64,
    rate_limit_waits: AtomicU64,
    rate_limit_wait_ms_total: AtomicU64,
    hedges_launched: AtomicU64,
    hedges_won: AtomicU64,
    hedges_cancelled: AtomicU64,
    in_flight: AtomicU64,
    latency_samples: AtomicU64,
    latency_total_ms: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    collector: Option<Arc<MetricsCollector>>,
}

impl MetricsCollector {
    pub(crate) fn enter_in_flight(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            collector: Some(Arc::clone(self)),
        }
    }

    fn record_latency(&self, elapsed_ms: u64) {
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let mut error_counts = lock_unpoisoned(&self.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let latency_samples = self.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };
        MetricsSnapshot {
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            dedup_misses: self.dedup_misses.load(Ordering::Relaxed),
            debounce_cancelled: self.debounce_cancelled.load(Ordering::Relaxed),
            debounce_dispatched: self.debounce_dispatched.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            rate_limit_wait_ms_total: self.rate_limit_wait_ms_total.load(Ordering::Relaxed),
            hedges_launched: self.hedges_launched.load(Ordering::Relaxed),
            hedges_won: self.hedges_won.load(Ordering::Relaxed),
            hedges_cancelled: self.hedges_cancelled.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.error_counts).clone(),
        }
    }
}

impl StatsSink for MetricsCollector {
    fn on_event(&self, event: &StatsEvent) {
        match event {
            StatsEvent::RequestStart { .. } => {
                self.requests_started.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::RequestSuccess {
                status, elapsed_ms, ..
            } => {
                self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(*status);
                self.record_latency(*elapsed_ms);
            }
            StatsEvent::RequestFail {
                kind,
                status,
                elapsed_ms,
                ..
            } => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                if let Some(status) = status {
                    self.add_status_count(*status);
                    self.add_error_count(format!("{}:{status}", kind.as_str()));
                } else {
                    self.add_error_count(kind.as_str().to_owned());
                }
                self.record_latency(*elapsed_ms);
            }
            StatsEvent::RequestRetry { .. } => {
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::DedupHit { .. } => {
                self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::DedupMiss { .. } => {
                self.dedup_misses.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::DebounceCancel { .. } => {
                self.debounce_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::DebounceDispatch { .. } => {
                self.debounce_dispatched.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::RateLimitWait { wait_ms, .. } => {
                self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
                self.rate_limit_wait_ms_total
                    .fetch_add(*wait_ms, Ordering::Relaxed);
            }
            StatsEvent::RateLimitAdmit { .. } => {}
            StatsEvent::HedgeLaunch { .. } => {
                self.hedges_launched.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::HedgeWin { .. } => {
                self.hedges_won.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::HedgeCancel { .. } => {
                self.hedges_cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(collector) = &self.collector {
            collector.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
