//! Worker health/metrics snapshot, exposed by a host process's own health
//! endpoint (the core never binds one itself).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minutes an error keeps a worker `degraded` after it last occurred.
const ERROR_DEGRADED_WINDOW_MINUTES: i64 = 5;

/// Coarse health classification a host process can map to an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health/metrics view of a running [`crate::worker::WorkerService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub worker_id: String,
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
    pub events_processed: u64,
    pub events_succeeded: u64,
    pub events_failed: u64,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub active_event_count: usize,
    pub memory_usage_bytes: Option<u64>,
}

/// Shared, atomically-updated counters a worker service mutates as it
/// processes events; [`Self::snapshot`] reads a consistent-enough view
/// without locking the hot path.
pub struct HealthState {
    worker_id: String,
    started_at: Instant,
    events_processed: AtomicU64,
    events_succeeded: AtomicU64,
    events_failed: AtomicU64,
    active_event_count: AtomicUsize,
    concurrency_limit: usize,
    running: AtomicBool,
    last_error: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl HealthState {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self::with_concurrency_limit(worker_id, usize::MAX)
    }

    pub fn with_concurrency_limit(worker_id: impl Into<String>, concurrency_limit: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            started_at: Instant::now(),
            events_processed: AtomicU64::new(0),
            events_succeeded: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            active_event_count: AtomicUsize::new(0),
            concurrency_limit,
            running: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// Flips the worker into the running state; `snapshot` can now report
    /// `healthy`/`degraded` instead of `unhealthy`.
    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Flips the worker out of the running state; `snapshot` reports
    /// `unhealthy` until [`Self::mark_running`] is called again.
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn task_started(&self) {
        self.active_event_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.events_succeeded.fetch_add(1, Ordering::Relaxed);
        self.active_event_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.events_failed.fetch_add(1, Ordering::Relaxed);
        self.active_event_count.fetch_sub(1, Ordering::Relaxed);
        *self.last_error.write().unwrap() = Some((error.into(), Utc::now()));
    }

    /// Unhealthy whenever the worker isn't running; degraded when an error
    /// occurred within the last [`ERROR_DEGRADED_WINDOW_MINUTES`] minutes or
    /// the active event count has reached the worker's concurrency limit;
    /// healthy otherwise.
    pub fn snapshot(&self) -> HealthSnapshot {
        let processed = self.events_processed.load(Ordering::Relaxed);
        let failed = self.events_failed.load(Ordering::Relaxed);
        let active = self.active_event_count.load(Ordering::Relaxed);
        let (last_error, last_error_time) = match self.last_error.read().unwrap().clone() {
            Some((msg, at)) => (Some(msg), Some(at)),
            None => (None, None),
        };

        let recent_error = last_error_time
            .map(|at| Utc::now() - at < chrono::Duration::minutes(ERROR_DEGRADED_WINDOW_MINUTES))
            .unwrap_or(false);
        let at_concurrency_limit = active >= self.concurrency_limit;

        let status = if !self.running.load(Ordering::SeqCst) {
            HealthStatus::Unhealthy
        } else if recent_error || at_concurrency_limit {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSnapshot {
            status,
            worker_id: self.worker_id.clone(),
            uptime: self.started_at.elapsed(),
            events_processed: processed,
            events_succeeded: self.events_succeeded.load(Ordering::Relaxed),
            events_failed: failed,
            last_error,
            last_error_time,
            active_event_count: self.active_event_count.load(Ordering::Relaxed),
            memory_usage_bytes: None,
        }
    }
}

mod duration_secs {
    use serde::{Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_until_marked_running() {
        let state = HealthState::new("worker-1");
        assert_eq!(state.snapshot().status, HealthStatus::Unhealthy);

        state.mark_running();
        assert_eq!(state.snapshot().status, HealthStatus::Healthy);

        state.mark_stopped();
        assert_eq!(state.snapshot().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn a_recent_failure_degrades_a_running_worker() {
        let state = HealthState::new("worker-1");
        state.mark_running();
        state.task_started();
        state.record_failure("boom");
        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn hitting_the_concurrency_limit_degrades_a_running_worker() {
        let state = HealthState::with_concurrency_limit("worker-1", 2);
        state.mark_running();
        state.task_started();
        state.task_started();
        assert_eq!(state.snapshot().status, HealthStatus::Degraded);
    }

    #[test]
    fn below_the_concurrency_limit_with_no_recent_error_is_healthy() {
        let state = HealthState::with_concurrency_limit("worker-1", 2);
        state.mark_running();
        state.task_started();
        assert_eq!(state.snapshot().status, HealthStatus::Healthy);
    }
}
