//! Event Processing Record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Tenant;

/// Lifecycle status of an Event Processing Record.
///
/// Invariant: at most one processing record is in `{Processing, Retrying}`
/// at any time for a given `event_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Published,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Published => write!(f, "published"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// Per-enqueued-event processing record tracked by the worker service while
/// it carries an event from `pending` through to a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventProcessingRecord {
    pub processing_id: Uuid,
    pub tenant: Tenant,
    pub event_id: Uuid,
    pub execution_id: Uuid,
    pub status: ProcessingStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventProcessingRecord {
    pub fn new(tenant: Tenant, event_id: Uuid, execution_id: Uuid, max_attempts: u32) -> Self {
        Self {
            processing_id: Uuid::now_v7(),
            tenant,
            event_id,
            execution_id,
            status: ProcessingStatus::Pending,
            attempt_count: 0,
            max_attempts,
            worker_id: None,
            last_attempt_at: None,
            next_attempt_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Eligible for the retry scan either a `failed` row
    /// still under the attempt budget whose backoff has elapsed, or a
    /// `processing` row abandoned long enough to assume its owner died.
    pub fn eligible_for_retry(&self, now: DateTime<Utc>, lock_ttl: chrono::Duration) -> bool {
        match self.status {
            ProcessingStatus::Failed => {
                self.attempt_count < self.max_attempts
                    && self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
            }
            ProcessingStatus::Processing => self
                .last_attempt_at
                .map(|t| now - t > lock_ttl * 2)
                .unwrap_or(false),
            _ => false,
        }
    }
}
