//! Event-processing-row polling with adaptive backoff.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::model::EventProcessingRecord;
use crate::persistence::{PersistenceStore, StoreError};

/// Polling configuration for the scanning loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when rows are available).
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle).
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no rows found.
    pub backoff_multiplier: f64,

    /// Maximum rows to claim per poll.
    pub batch_size: usize,

    /// TTL assumed for the per-event lock, used by the stale-`processing`
    /// promotion rule in `claim_processing_batch`.
    #[serde(with = "duration_millis")]
    pub lock_ttl: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
            lock_ttl: Duration::from_secs(60),
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Claims event-processing rows with adaptive backoff: resets to
/// `min_interval` when a poll finds rows, backs off toward `max_interval`
/// when it finds none.
pub struct EventPoller {
    store: Arc<dyn PersistenceStore>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl EventPoller {
    pub fn new(store: Arc<dyn PersistenceStore>, config: PollerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            store,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim up to `max_rows` pending/published/retry-eligible rows,
    /// ordered fresh-first then retries, updating the internal backoff.
    #[instrument(skip(self))]
    pub async fn poll(&mut self, max_rows: usize) -> Result<Vec<EventProcessingRecord>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!("poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_rows.min(self.config.batch_size);
        let batch = self
            .store
            .claim_processing_batch(batch_size, self.config.lock_ttl)
            .await
            .map_err(PollerError::Store)?;

        let mut rows = batch.fresh;
        rows.extend(batch.retries);

        if rows.is_empty() {
            self.increase_backoff();
            trace!(interval_ms = self.current_interval.as_millis(), "no rows found, backing off");
        } else {
            self.reset_backoff();
            debug!(count = rows.len(), "claimed processing rows");
        }

        Ok(rows)
    }

    /// Sleep for the current backoff interval, returning early (with
    /// `true`) if shutdown fires first.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker is shutting down")]
    Shutdown,
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
    fn default_config_matches_spec_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.lock_ttl, Duration::from_secs(60));
    }

    #[test]
    fn config_builder_overrides_fields() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(2.0)
            .with_batch_size(20);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.batch_size, 20);
    }

    #[tokio::test]
    async fn poll_backs_off_on_empty_batch_and_resets_on_hit() {
        use crate::model::{EventProcessingRecord, Tenant};
        use crate::persistence::InMemoryStore;

        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::default());
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new().with_min_interval(Duration::from_millis(10));
        let mut poller = EventPoller::new(store.clone(), config, rx);

        let empty = poller.poll(10).await.unwrap();
        assert!(empty.is_empty());
        assert!(poller.current_interval() > Duration::from_millis(10));

        let record = EventProcessingRecord::new(Tenant::new("acme"), uuid::Uuid::now_v7(), uuid::Uuid::now_v7(), 5);
        store.create_processing_record(record).await.unwrap();

        let found = poller.poll(10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(poller.current_interval(), Duration::from_millis(10));
    }
}
