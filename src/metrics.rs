use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, ErrorKind};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub transport_failures: u64,
    pub remote_rejections: u64,
    pub cache_reconfigurations: u64,
    pub in_flight: u64,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ExecutorMetrics {
    inner: Arc<ExecutorMetricsInner>,
}

#[derive(Debug, Default)]
struct ExecutorMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    transport_failures: AtomicU64,
    remote_rejections: AtomicU64,
    cache_reconfigurations: AtomicU64,
    in_flight: AtomicU64,
}

pub(crate) struct InFlightGuard {
    metrics: ExecutorMetrics,
}

impl ExecutorMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_reconfiguration(&self) {
        self.inner
            .cache_reconfigurations
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed attempt by kind.
    pub(crate) fn record_attempt_error(&self, error: &Error) {
        let counter = match error.kind() {
            ErrorKind::RemoteRejected => &self.inner.remote_rejections,
            ErrorKind::TransportFailed => &self.inner.transport_failures,
            ErrorKind::TimedOut => &self.inner.timeouts,
            ErrorKind::Cancelled => &self.inner.cancellations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed<T>(&self, result: &Result<T, Error>) {
        let counter = match result {
            Ok(_) => &self.inner.requests_succeeded,
            Err(_) => &self.inner.requests_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            cancellations: inner.cancellations.load(Ordering::Relaxed),
            transport_failures: inner.transport_failures.load(Ordering::Relaxed),
            remote_rejections: inner.remote_rejections.load(Ordering::Relaxed),
            cache_reconfigurations: inner.cache_reconfigurations.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
