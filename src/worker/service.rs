//! Worker service: claims event-processing rows, applies them through
//! the runtime, and exposes health/metrics while gracefully draining on
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::health::HealthState;
use crate::model::EventProcessingRecord;
use crate::persistence::{PersistenceStore, StoreError};
use crate::reliability::{DefaultErrorClassifier, ErrorClassifier, RetryStrategy};
use crate::runtime::{runtime_error_to_action_error, RuntimeError, WorkflowRuntime};
use crate::stream::{ConsumerHandler, StreamClient, StreamError};

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::poller::{EventPoller, PollerConfig, PollerError};

/// Worker service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub worker_group: String,
    pub max_concurrency: usize,
    pub backpressure: BackpressureConfig,
    pub poller: PollerConfig,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
    pub stream_name: String,
    pub consumer_group: String,
    /// Upper bound on `attempt_count` newly enqueued events get before a
    /// row is finalized failed for good.
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_millis")]
    pub metrics_reporting_interval: Duration,
    /// How long a claimed row may sit without progress before it's
    /// considered abandoned and eligible for another worker to retry.
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            worker_group: "default".to_string(),
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            stream_name: "workflow:events:global".to_string(),
            consumer_group: "workflow-workers".to_string(),
            max_retries: 3,
            health_check_interval: Duration::from_secs(15),
            metrics_reporting_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// `hostname-pid-randomShort`-shaped identity, distinct per process without
/// needing operator-supplied configuration.
fn default_worker_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let short = Uuid::new_v4().to_string()[..8].to_string();
    format!("{hostname}-{pid}-{short}", pid = std::process::id())
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_metrics_reporting_interval(mut self, interval: Duration) -> Self {
        self.metrics_reporting_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("worker service is already running")]
    AlreadyRunning,

    #[error("worker service is not running")]
    NotRunning,

    #[error("graceful shutdown timed out with tasks still in flight")]
    ShutdownTimeout,
}

/// Claims event-processing rows and applies each through a
/// [`WorkflowRuntime`]. Optionally also runs a stream consumer purely
/// to wake the poll loop early on fresh deliveries; claiming itself always
/// goes through `claim_processing_batch`'s `SELECT ... FOR UPDATE SKIP
/// LOCKED`, so running several of these concurrently is safe.
pub struct WorkerService {
    store: Arc<dyn PersistenceStore>,
    runtime: WorkflowRuntime,
    stream: Option<Arc<dyn StreamClient>>,
    classifier: Arc<dyn ErrorClassifier>,
    config: WorkerConfig,
    backpressure: Arc<BackpressureState>,
    health: Arc<HealthState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    metrics_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    signal_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerService {
    pub fn new(store: Arc<dyn PersistenceStore>, runtime: WorkflowRuntime, mut config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(config.backpressure.clone(), config.max_concurrency));
        let health = Arc::new(HealthState::with_concurrency_limit(config.worker_id.clone(), config.max_concurrency));
        let runtime = runtime.with_default_max_attempts(config.max_retries);
        config.poller.lock_ttl = config.idle_timeout;

        Self {
            store,
            runtime,
            stream: None,
            classifier: Arc::new(DefaultErrorClassifier),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            backpressure,
            health,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerStatus::Stopped),
            poll_handle: std::sync::Mutex::new(None),
            heartbeat_handle: std::sync::Mutex::new(None),
            metrics_handle: std::sync::Mutex::new(None),
            signal_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn with_stream(mut self, stream: Arc<dyn StreamClient>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read().unwrap()
    }

    pub fn health(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Startup sequence: stream init (if configured) + `ensure_consumer_group`,
    /// consumer registration (global dispatch wake-up), then the scanning
    /// loop, heartbeat ticker, metrics reporter, and signal handlers.
    ///
    /// Takes `self` behind an `Arc` (rather than a plain reference) because
    /// the signal-handling task it spawns needs an owned, `'static` handle
    /// back to the service to call [`Self::shutdown`] from outside the
    /// calling scope.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(self: &Arc<Self>) -> Result<(), WorkerServiceError> {
        if *self.status.read().unwrap() == WorkerStatus::Running {
            return Err(WorkerServiceError::AlreadyRunning);
        }

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "starting worker service"
        );

        if let Some(stream) = &self.stream {
            stream.initialize().await?;
            stream.ensure_consumer_group(&self.config.stream_name, &self.config.consumer_group).await?;

            let wake: ConsumerHandler = {
                let woken = Arc::new(AtomicBool::new(false));
                Arc::new(move |_msg| {
                    woken.store(true, Ordering::Relaxed);
                    Box::pin(async { Ok(()) })
                })
            };
            stream
                .register_consumer(&self.config.stream_name, &self.config.consumer_group, &self.config.worker_id, wake)
                .await?;
        }

        *self.status.write().unwrap() = WorkerStatus::Running;
        self.health.mark_running();
        self.start_poll_loop();
        self.start_heartbeat_loop();
        self.start_metrics_loop();
        self.start_signal_loop();

        Ok(())
    }

    /// Wires SIGINT/SIGTERM/SIGHUP to [`Self::shutdown`] so a process
    /// manager's stop signal drains in-flight work instead of killing it
    /// mid-event. Only one of the three fires per process.
    fn start_signal_loop(self: &Arc<Self>) {
        let worker = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGHUP handler");
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!(worker_id = %worker.config.worker_id, "received SIGINT"),
                _ = sigterm.recv() => info!(worker_id = %worker.config.worker_id, "received SIGTERM"),
                _ = sighup.recv() => info!(worker_id = %worker.config.worker_id, "received SIGHUP"),
                _ = shutdown_rx.changed() => return,
            }

            if let Err(e) = worker.shutdown().await {
                error!(worker_id = %worker.config.worker_id, error = %e, "graceful shutdown after signal failed");
            }
        });

        *self.signal_handle.lock().unwrap() = Some(handle);
    }

    /// Graceful shutdown: stop background tickers, wait on
    /// in-flight tasks up to `shutdown_timeout`, stop the stream consumer,
    /// release broker connections.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerServiceError> {
        if *self.status.read().unwrap() == WorkerStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write().unwrap() = WorkerStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.active_tasks.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(worker_id = %self.config.worker_id, "shutdown timeout reached with tasks still in flight");
                return Err(WorkerServiceError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(stream) = &self.stream {
            stream.stop_consumer().await?;
            stream.close().await?;
        }

        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.metrics_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.signal_handle.lock().unwrap().take() {
            handle.abort();
        }

        self.health.mark_stopped();
        *self.status.write().unwrap() = WorkerStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker service stopped");
        Ok(())
    }

    fn start_poll_loop(&self) {
        let store = self.store.clone();
        let runtime = self.runtime.clone();
        let backpressure = self.backpressure.clone();
        let active_tasks = self.active_tasks.clone();
        let health = self.health.clone();
        let classifier = self.classifier.clone();
        let worker_id = self.config.worker_id.clone();
        let poller_config = self.config.poller.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller = EventPoller::new(store, poller_config, shutdown_rx);

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                if !backpressure.should_accept() {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let available_slots = backpressure.available_slots();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(records) => {
                        for record in records {
                            let permit = match active_tasks.clone().try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => break,
                            };
                            backpressure.task_started();
                            health.task_started();

                            let runtime = runtime.clone();
                            let backpressure = backpressure.clone();
                            let health = health.clone();
                            let classifier = classifier.clone();
                            let worker_id = worker_id.clone();

                            tokio::spawn(async move {
                                process_one(&runtime, &classifier, &worker_id, &record, &health).await;
                                backpressure.task_completed();
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "poll error"),
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock().unwrap() = Some(handle);
    }

    fn start_heartbeat_loop(&self) {
        let interval = self.config.health_check_interval;
        let health = self.health.clone();
        let worker_id = self.config.worker_id.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = health.snapshot();
                        debug!(worker_id = %worker_id, status = ?snapshot.status, active = snapshot.active_event_count, "heartbeat");
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }

    /// Periodically logs the full health snapshot as structured metrics, at
    /// `metrics_reporting_interval` — distinct from the heartbeat's
    /// debug-level status line, which ticks faster on `health_check_interval`
    /// and is meant for liveness rather than dashboards.
    fn start_metrics_loop(&self) {
        let interval = self.config.metrics_reporting_interval;
        let health = self.health.clone();
        let worker_id = self.config.worker_id.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = health.snapshot();
                        info!(
                            worker_id = %worker_id,
                            status = ?snapshot.status,
                            processed = snapshot.events_processed,
                            succeeded = snapshot.events_succeeded,
                            failed = snapshot.events_failed,
                            active = snapshot.active_event_count,
                            uptime_secs = snapshot.uptime.as_secs(),
                            "metrics report"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("metrics loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.metrics_handle.lock().unwrap() = Some(handle);
    }
}

/// Process a single claimed row, logging its retry classification on
/// failure. The processing record's own attempt/backoff bookkeeping lives
/// in the store; this only decides how loudly to log.
async fn process_one(
    runtime: &WorkflowRuntime,
    classifier: &Arc<dyn ErrorClassifier>,
    worker_id: &str,
    record: &EventProcessingRecord,
    health: &HealthState,
) {
    match runtime.process_queued_event(&record.tenant, record.processing_id, worker_id).await {
        Ok(result) => {
            health.record_success();
            debug!(execution_id = %result.execution_id, event_id = %result.event_id, "processed");
        }
        Err(e) => {
            let action_error = runtime_error_to_action_error(&e);
            let class = classifier.classify(&action_error);
            let strategy = classifier.strategy(class);
            health.record_failure(e.to_string());
            match strategy {
                RetryStrategy::ManualIntervention => {
                    error!(event_id = %record.event_id, error = %e, "permanent failure, not retrying")
                }
                RetryStrategy::RetryWithBackoff | RetryStrategy::RetryImmediate => {
                    warn!(event_id = %record.event_id, error = %e, ?class, "failed, eligible for retry")
                }
            }
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_nonempty_worker_id() {
        let config = WorkerConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn config_builder_overrides_fields() {
        let config = WorkerConfig::new().with_worker_id("w1").with_max_concurrency(3);
        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.max_concurrency, 3);
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.health_check_interval, Duration::from_secs(15));
        assert_eq!(config.metrics_reporting_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn start_then_shutdown_flips_health_between_unhealthy_and_running() {
        use crate::action::ActionRegistry;
        use crate::persistence::InMemoryStore;

        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::default());
        let actions = Arc::new(ActionRegistry::new(store.clone()));
        let runtime = WorkflowRuntime::new(store.clone(), actions);
        let config = WorkerConfig::new().with_worker_id("w1");
        let service = Arc::new(WorkerService::new(store, runtime, config));

        assert_eq!(service.health().snapshot().status, crate::health::HealthStatus::Unhealthy);

        service.start().await.unwrap();
        assert_eq!(service.status(), WorkerStatus::Running);
        assert_eq!(service.health().snapshot().status, crate::health::HealthStatus::Healthy);

        service.shutdown().await.unwrap();
        assert_eq!(service.status(), WorkerStatus::Stopped);
        assert_eq!(service.health().snapshot().status, crate::health::HealthStatus::Unhealthy);
    }
}
