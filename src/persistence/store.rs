//! `PersistenceStore` trait definition: the event store and event
//! processing table, plus the transaction primitive transactional
//! actions run inside.
//!
//! One trait bundles workflow/execution, event, processing, action-result,
//! and registration concerns behind banner comments rather than splitting
//! into several traits — the same shape as `WorkflowEventStore`, which
//! likewise bundles workflow + task-queue + signal + worker + DLQ concerns
//! in a single trait.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    ActionResult, EventProcessingRecord, ExecutionStatus, ProcessingStatus, Tenant,
    WorkflowAttachment, WorkflowEvent, WorkflowExecution, WorkflowRegistration,
};

/// Error type for persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    #[error("processing record not found: {0}")]
    ProcessingNotFound(Uuid),

    /// A second processing record was inserted for an `event_id` already
    /// carrying one in `{processing, retrying}`.
    #[error("duplicate processing record for event {0}")]
    DuplicateProcessing(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Isolation level requested by a transactional action (`registerTransactional`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// An open transaction handle, abstracted away from the concrete backend so
/// `action::ActionRegistry` never has to know it's talking to Postgres.
/// Commits iff the executor that borrowed it returns without error;
/// backends that expose native query access through it (e.g. Postgres) do
/// so via the [`Any`] escape hatch rather than growing the trait with
/// backend-specific methods.
#[async_trait]
pub trait TransactionHandle: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Batch of processing rows ready for a worker's scanning loop.
#[derive(Debug, Clone)]
pub struct ProcessingBatch {
    pub fresh: Vec<EventProcessingRecord>,
    pub retries: Vec<EventProcessingRecord>,
}

/// Persistence contract consumed by the runtime and worker.
///
/// Implementations must be thread-safe and support concurrent access. The
/// core ships two: [`super::postgres::PostgresStore`] for production and
/// [`super::memory::InMemoryStore`] for tests.
#[async_trait]
pub trait PersistenceStore: Send + Sync + 'static {
    // =====================================================================
    // Execution Operations
    // =====================================================================

    async fn create_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError>;

    async fn get_execution(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, StoreError>;

    /// Apply a derived state to the execution row. Called by the runtime
    /// after folding events; never called directly by a caller.
    async fn update_execution_state(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        current_state: &str,
        context_data: serde_json::Map<String, Value>,
    ) -> Result<(), StoreError>;

    async fn update_execution_status(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    // =====================================================================
    // Event Operations
    // =====================================================================

    /// Append an event. A duplicate `event_id` is treated as idempotent
    /// success: the existing row is returned rather than an error.
    async fn append_event(&self, event: WorkflowEvent) -> Result<WorkflowEvent, StoreError>;

    /// Write the event's derived `to_state`. May be called exactly once per
    /// event; a second call is a logic error in the caller, not a recoverable
    /// condition (`to_state` is write-once).
    async fn set_event_to_state(
        &self,
        tenant: &Tenant,
        event_id: Uuid,
        to_state: &str,
    ) -> Result<(), StoreError>;

    async fn get_event(&self, tenant: &Tenant, event_id: Uuid) -> Result<WorkflowEvent, StoreError>;

    /// Ordered by `(created_at, event_id)`; `up_to` bounds replay for
    /// time-travel debugging.
    async fn list_events_for_execution(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkflowEvent>, StoreError>;

    // =====================================================================
    // Event Processing Operations
    // =====================================================================

    async fn create_processing_record(
        &self,
        record: EventProcessingRecord,
    ) -> Result<EventProcessingRecord, StoreError>;

    async fn get_processing_record(
        &self,
        tenant: &Tenant,
        processing_id: Uuid,
    ) -> Result<EventProcessingRecord, StoreError>;

    /// Transition a processing record, enforcing at most one of
    /// `{processing, retrying}` per `event_id` at the storage layer.
    async fn transition_processing_record(
        &self,
        tenant: &Tenant,
        processing_id: Uuid,
        status: ProcessingStatus,
        worker_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<EventProcessingRecord, StoreError>;

    /// Claim up to `batch_size` rows in `{pending, published}` plus rows
    /// eligible for retry (`failed` under budget with elapsed backoff, or
    /// `processing` abandoned past `2 * lock_ttl`) ordered by `created_at
    /// asc`. Uses `SELECT ... FOR UPDATE SKIP LOCKED` in the Postgres
    /// backend so concurrent workers never claim the same row.
    async fn claim_processing_batch(
        &self,
        batch_size: usize,
        lock_ttl: Duration,
    ) -> Result<ProcessingBatch, StoreError>;

    /// Finalize a row as `failed` with no further retry: pins
    /// `attempt_count` to its own `max_attempts` and clears
    /// `next_attempt_at`, so `claim_processing_batch`'s retry query can
    /// never select it again. Used for errors classified non-retryable —
    /// a plain `transition_processing_record(..., Failed, ...)` still
    /// schedules a future retry attempt.
    async fn fail_permanently(
        &self,
        tenant: &Tenant,
        processing_id: Uuid,
        worker_id: Option<&str>,
        error_message: &str,
    ) -> Result<EventProcessingRecord, StoreError>;

    // =====================================================================
    // Action Result Operations
    // =====================================================================

    async fn find_action_result(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        action_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<ActionResult>, StoreError>;

    async fn insert_action_result(&self, result: ActionResult) -> Result<ActionResult, StoreError>;

    async fn complete_action_result(
        &self,
        tenant: &Tenant,
        result_id: Uuid,
        success: bool,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    // =====================================================================
    // Transaction Primitive (executeDistributedTransaction)
    // =====================================================================

    /// Open a transaction scoped to `key` (e.g. `workflow:<execution_id>`).
    /// All mutating operations for a single execution are serialized either
    /// by this primitive or by the per-event distributed lock.
    async fn begin_transaction(
        &self,
        key: &str,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn TransactionHandle>, StoreError>;

    // =====================================================================
    // Registration Operations (external loader side, default no-op)
    // =====================================================================

    /// Load a workflow registration by name. Only consulted when the
    /// runtime's in-memory registry doesn't already have a compiled
    /// definition for the requested name/version (`getDefinition`).
    async fn get_registration(
        &self,
        _tenant: &Tenant,
        _name: &str,
    ) -> Result<Option<WorkflowRegistration>, StoreError> {
        Ok(None)
    }

    /// Active workflow attachments for `(tenant, event_type)`, consulted by
    /// global dispatch.
    async fn list_attachments(
        &self,
        _tenant: &Tenant,
        _event_type: &str,
    ) -> Result<Vec<WorkflowAttachment>, StoreError> {
        Ok(vec![])
    }
}
