//! PostgreSQL implementation of [`PersistenceStore`].
//!
//! Schema is behavioral, not literal DDL: tables named
//! `workflow_executions`, `workflow_events`, `workflow_event_processing`,
//! `workflow_action_results`, `workflow_registrations`,
//! `workflow_registration_versions`, `workflow_event_attachments`, every
//! one carrying a `tenant` column. Migrations are an external collaborator
//! and are not shipped from this crate.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::model::{
    ActionResult, EventProcessingRecord, ExecutionStatus, ProcessingStatus, Tenant,
    WorkflowAttachment, WorkflowEvent, WorkflowExecution, WorkflowRegistration,
};

use super::store::{
    IsolationLevel, PersistenceStore, ProcessingBatch, StoreError, TransactionHandle,
};

/// A live Postgres transaction. Commits iff the borrowing action executor
/// returns without error; `as_any_mut` lets a transactional
/// action downcast to `sqlx::Transaction<'static, sqlx::Postgres>` to issue
/// its own queries.
pub struct PostgresTransactionHandle {
    inner: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
}

#[async_trait]
impl TransactionHandle for PostgresTransactionHandle {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self.inner.as_mut().expect("transaction already consumed")
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let txn = self.inner.take().expect("transaction already consumed");
        txn.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        let txn = self.inner.take().expect("transaction already consumed");
        txn.rollback()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `ValidationError`/constraint-violation detection for
    /// [`crate::reliability::DefaultErrorClassifier`] (open
    /// question 1): Postgres integrity-constraint violations carry SQLSTATE
    /// class `23`.
    pub fn is_constraint_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.code().map(|c| c.starts_with("23")).unwrap_or(false))
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    #[instrument(skip(self, execution))]
    async fn create_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workflow_executions \
             (execution_id, tenant, workflow_name, workflow_version, current_state, status, \
              context_data, result, error_message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(execution.execution_id)
        .bind(execution.tenant.as_str())
        .bind(&execution.workflow_name)
        .bind(&execution.workflow_version)
        .bind(&execution.current_state)
        .bind(execution.status.to_string())
        .bind(Value::Object(execution.context_data.clone()))
        .bind(execution.result.clone())
        .bind(&execution.error_message)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to create execution");
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(
            "SELECT execution_id, tenant, workflow_name, workflow_version, current_state, \
             status, context_data, result, error_message, created_at, updated_at \
             FROM workflow_executions WHERE execution_id = $1 AND tenant = $2",
        )
        .bind(execution_id)
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self, context_data))]
    async fn update_execution_state(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        current_state: &str,
        context_data: serde_json::Map<String, Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET current_state = $1, context_data = $2, \
             updated_at = now() WHERE execution_id = $3 AND tenant = $4",
        )
        .bind(current_state)
        .bind(Value::Object(context_data))
        .bind(execution_id)
        .bind(tenant.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    #[instrument(skip(self, result, error_message))]
    async fn update_execution_status(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_executions SET status = $1, result = $2, error_message = $3, \
             updated_at = now() WHERE execution_id = $4 AND tenant = $5",
        )
        .bind(status.to_string())
        .bind(result)
        .bind(error_message)
        .bind(execution_id)
        .bind(tenant.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, event))]
    async fn append_event(&self, event: WorkflowEvent) -> Result<WorkflowEvent, StoreError> {
        let existing = sqlx::query(
            "SELECT event_id, tenant, execution_id, event_name, event_type, payload, user_id, \
             from_state, to_state, created_at FROM workflow_events WHERE event_id = $1",
        )
        .bind(event.event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some(row) = existing {
            return event_from_row(&row);
        }

        sqlx::query(
            "INSERT INTO workflow_events \
             (event_id, tenant, execution_id, event_name, event_type, payload, user_id, \
              from_state, to_state, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(event.event_id)
        .bind(event.tenant.as_str())
        .bind(event.execution_id)
        .bind(&event.event_name)
        .bind(serde_json::to_value(event.event_type).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(&event.payload)
        .bind(&event.user_id)
        .bind(&event.from_state)
        .bind(&event.to_state)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(event)
    }

    #[instrument(skip(self))]
    async fn set_event_to_state(
        &self,
        tenant: &Tenant,
        event_id: Uuid,
        to_state: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_events SET to_state = $1 WHERE event_id = $2 AND tenant = $3",
        )
        .bind(to_state)
        .bind(event_id)
        .bind(tenant.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_event(&self, tenant: &Tenant, event_id: Uuid) -> Result<WorkflowEvent, StoreError> {
        let row = sqlx::query(
            "SELECT event_id, tenant, execution_id, event_name, event_type, payload, user_id, \
             from_state, to_state, created_at FROM workflow_events \
             WHERE event_id = $1 AND tenant = $2",
        )
        .bind(event_id)
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::EventNotFound(event_id))?;
        event_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_events_for_execution(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkflowEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT event_id, tenant, execution_id, event_name, event_type, payload, user_id, \
             from_state, to_state, created_at FROM workflow_events \
             WHERE execution_id = $1 AND tenant = $2 AND ($3::timestamptz IS NULL OR created_at <= $3) \
             ORDER BY created_at ASC, event_id ASC",
        )
        .bind(execution_id)
        .bind(tenant.as_str())
        .bind(up_to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self, record))]
    async fn create_processing_record(
        &self,
        record: EventProcessingRecord,
    ) -> Result<EventProcessingRecord, StoreError> {
        let existing = sqlx::query(
            "SELECT processing_id, tenant, event_id, execution_id, status, attempt_count, \
             max_attempts, worker_id, last_attempt_at, next_attempt_at, error_message, created_at \
             FROM workflow_event_processing WHERE event_id = $1",
        )
        .bind(record.event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some(row) = existing {
            return processing_from_row(&row);
        }

        sqlx::query(
            "INSERT INTO workflow_event_processing \
             (processing_id, tenant, event_id, execution_id, status, attempt_count, \
              max_attempts, worker_id, last_attempt_at, next_attempt_at, error_message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(record.processing_id)
        .bind(record.tenant.as_str())
        .bind(record.event_id)
        .bind(record.execution_id)
        .bind(record.status.to_string())
        .bind(record.attempt_count as i32)
        .bind(record.max_attempts as i32)
        .bind(&record.worker_id)
        .bind(record.last_attempt_at)
        .bind(record.next_attempt_at)
        .bind(&record.error_message)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn get_processing_record(
        &self,
        tenant: &Tenant,
        processing_id: Uuid,
    ) -> Result<EventProcessingRecord, StoreError> {
        let row = sqlx::query(
            "SELECT processing_id, tenant, event_id, execution_id, status, attempt_count, \
             max_attempts, worker_id, last_attempt_at, next_attempt_at, error_message, created_at \
             FROM workflow_event_processing WHERE processing_id = $1 AND tenant = $2",
        )
        .bind(processing_id)
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::ProcessingNotFound(processing_id))?;
        processing_from_row(&row)
    }

    #[instrument(skip(self, error_message))]
    async fn transition_processing_record(
        &self,
        tenant: &Tenant,
        processing_id: Uuid,
        status: ProcessingStatus,
        worker_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<EventProcessingRecord, StoreError> {
        let bumps_attempt = matches!(
            status,
            ProcessingStatus::Processing | ProcessingStatus::Retrying
        );
        let row = sqlx::query(
            "UPDATE workflow_event_processing SET \
             status = $1, \
             worker_id = $2, \
             error_message = $3, \
             attempt_count = attempt_count + CASE WHEN $4 THEN 1 ELSE 0 END, \
             last_attempt_at = CASE WHEN $4 THEN now() ELSE last_attempt_at END, \
             next_attempt_at = CASE WHEN $1 = 'failed' THEN now() + interval '1 second' ELSE next_attempt_at END \
             WHERE processing_id = $5 AND tenant = $6 \
             RETURNING processing_id, tenant, event_id, execution_id, status, attempt_count, \
             max_attempts, worker_id, last_attempt_at, next_attempt_at, error_message, created_at",
        )
        .bind(status.to_string())
        .bind(worker_id)
        .bind(error_message)
        .bind(bumps_attempt)
        .bind(processing_id)
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::ProcessingNotFound(processing_id))?;
        processing_from_row(&row)
    }

    #[instrument(skip(self, error_message))]
    async fn fail_permanently(
        &self,
        tenant: &Tenant,
        processing_id: Uuid,
        worker_id: Option<&str>,
        error_message: &str,
    ) -> Result<EventProcessingRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE workflow_event_processing SET \
             status = 'failed', \
             worker_id = $1, \
             error_message = $2, \
             attempt_count = max_attempts, \
             next_attempt_at = NULL \
             WHERE processing_id = $3 AND tenant = $4 \
             RETURNING processing_id, tenant, event_id, execution_id, status, attempt_count, \
             max_attempts, worker_id, last_attempt_at, next_attempt_at, error_message, created_at",
        )
        .bind(worker_id)
        .bind(error_message)
        .bind(processing_id)
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::ProcessingNotFound(processing_id))?;
        processing_from_row(&row)
    }

    /// Claims the pending/published batch plus the retry-eligible batch
    /// using `FOR UPDATE SKIP LOCKED` so concurrent
    /// workers never contend for the same row.
    #[instrument(skip(self))]
    async fn claim_processing_batch(
        &self,
        batch_size: usize,
        lock_ttl: Duration,
    ) -> Result<ProcessingBatch, StoreError> {
        let lock_ttl_secs = lock_ttl.as_secs() as f64;

        let fresh_rows = sqlx::query(
            "SELECT processing_id, tenant, event_id, execution_id, status, attempt_count, \
             max_attempts, worker_id, last_attempt_at, next_attempt_at, error_message, created_at \
             FROM workflow_event_processing \
             WHERE status IN ('pending', 'published') \
             ORDER BY created_at ASC LIMIT $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let retry_rows = sqlx::query(
            "SELECT processing_id, tenant, event_id, execution_id, status, attempt_count, \
             max_attempts, worker_id, last_attempt_at, next_attempt_at, error_message, created_at \
             FROM workflow_event_processing \
             WHERE (status = 'failed' AND attempt_count < max_attempts \
                    AND (next_attempt_at IS NULL OR next_attempt_at <= now())) \
                OR (status = 'processing' \
                    AND last_attempt_at < now() - (interval '1 second' * $1 * 2)) \
             ORDER BY created_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED",
        )
        .bind(lock_ttl_secs)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(ProcessingBatch {
            fresh: fresh_rows.iter().map(processing_from_row).collect::<Result<_, _>>()?,
            retries: retry_rows.iter().map(processing_from_row).collect::<Result<_, _>>()?,
        })
    }

    #[instrument(skip(self))]
    async fn find_action_result(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        action_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<ActionResult>, StoreError> {
        let row = sqlx::query(
            "SELECT result_id, tenant, execution_id, event_id, action_name, idempotency_key, \
             parameters, ready_to_execute, success, result, error_message, started_at, completed_at \
             FROM workflow_action_results \
             WHERE execution_id = $1 AND tenant = $2 AND action_name = $3 AND idempotency_key = $4",
        )
        .bind(execution_id)
        .bind(tenant.as_str())
        .bind(action_name)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(action_result_from_row).transpose()
    }

    #[instrument(skip(self, result))]
    async fn insert_action_result(&self, result: ActionResult) -> Result<ActionResult, StoreError> {
        sqlx::query(
            "INSERT INTO workflow_action_results \
             (result_id, tenant, execution_id, event_id, action_name, idempotency_key, \
              parameters, ready_to_execute, success, result, error_message, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (execution_id, action_name, idempotency_key) DO NOTHING",
        )
        .bind(result.result_id)
        .bind(result.tenant.as_str())
        .bind(result.execution_id)
        .bind(result.event_id)
        .bind(&result.action_name)
        .bind(&result.idempotency_key)
        .bind(&result.parameters)
        .bind(result.ready_to_execute)
        .bind(result.success)
        .bind(&result.result)
        .bind(&result.error_message)
        .bind(result.started_at)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        self.find_action_result(&result.tenant, result.execution_id, &result.action_name, &result.idempotency_key)
            .await?
            .ok_or_else(|| StoreError::Database("action result vanished after insert".to_string()))
    }

    #[instrument(skip(self, result, error_message))]
    async fn complete_action_result(
        &self,
        tenant: &Tenant,
        result_id: Uuid,
        success: bool,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_action_results SET success = $1, result = $2, error_message = $3, \
             completed_at = now() WHERE result_id = $4 AND tenant = $5",
        )
        .bind(success)
        .bind(result)
        .bind(error_message)
        .bind(result_id)
        .bind(tenant.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn begin_transaction(
        &self,
        _key: &str,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn TransactionHandle>, StoreError> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let level = match isolation {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {level}"))
            .execute(&mut *txn)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Box::new(PostgresTransactionHandle { inner: Some(txn) }))
    }

    #[instrument(skip(self))]
    async fn get_registration(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Option<WorkflowRegistration>, StoreError> {
        // Registration assembly (registration row + ordered versions) is a
        // two-query join the authoring surface owns; left as a stub return
        // here since registration CRUD lives outside this crate's scope
        // an authoring surface is an external collaborator.
        let _ = (tenant, name);
        Ok(None)
    }

    #[instrument(skip(self))]
    async fn list_attachments(
        &self,
        tenant: &Tenant,
        event_type: &str,
    ) -> Result<Vec<WorkflowAttachment>, StoreError> {
        let rows = sqlx::query(
            "SELECT tenant, event_type, registration_id, is_active \
             FROM workflow_event_attachments \
             WHERE tenant = $1 AND event_type = $2 AND is_active = true",
        )
        .bind(tenant.as_str())
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(WorkflowAttachment {
                    tenant: Tenant::new(row.try_get::<String, _>("tenant").map_err(|e| StoreError::Database(e.to_string()))?),
                    event_type: row.try_get("event_type").map_err(|e| StoreError::Database(e.to_string()))?,
                    registration_id: row.try_get("registration_id").map_err(|e| StoreError::Database(e.to_string()))?,
                    is_active: row.try_get("is_active").map_err(|e| StoreError::Database(e.to_string()))?,
                })
            })
            .collect()
    }
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowExecution, StoreError> {
    let status_str: String = row.try_get("status").map_err(db_err)?;
    let context_data: Value = row.try_get("context_data").map_err(db_err)?;
    Ok(WorkflowExecution {
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        tenant: Tenant::new(row.try_get::<String, _>("tenant").map_err(db_err)?),
        workflow_name: row.try_get("workflow_name").map_err(db_err)?,
        workflow_version: row.try_get("workflow_version").map_err(db_err)?,
        current_state: row.try_get("current_state").map_err(db_err)?,
        status: parse_execution_status(&status_str)?,
        context_data: context_data.as_object().cloned().unwrap_or_default(),
        result: row.try_get("result").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowEvent, StoreError> {
    let event_type: Value = row.try_get("event_type").map_err(db_err)?;
    Ok(WorkflowEvent {
        event_id: row.try_get("event_id").map_err(db_err)?,
        tenant: Tenant::new(row.try_get::<String, _>("tenant").map_err(db_err)?),
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        event_name: row.try_get("event_name").map_err(db_err)?,
        event_type: serde_json::from_value(event_type).map_err(|e| StoreError::Serialization(e.to_string()))?,
        payload: row.try_get("payload").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        from_state: row.try_get("from_state").map_err(db_err)?,
        to_state: row.try_get("to_state").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn processing_from_row(row: &sqlx::postgres::PgRow) -> Result<EventProcessingRecord, StoreError> {
    let status_str: String = row.try_get("status").map_err(db_err)?;
    Ok(EventProcessingRecord {
        processing_id: row.try_get("processing_id").map_err(db_err)?,
        tenant: Tenant::new(row.try_get::<String, _>("tenant").map_err(db_err)?),
        event_id: row.try_get("event_id").map_err(db_err)?,
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        status: parse_processing_status(&status_str)?,
        attempt_count: row.try_get::<i32, _>("attempt_count").map_err(db_err)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)? as u32,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(db_err)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn action_result_from_row(row: &sqlx::postgres::PgRow) -> Result<ActionResult, StoreError> {
    Ok(ActionResult {
        result_id: row.try_get("result_id").map_err(db_err)?,
        tenant: Tenant::new(row.try_get::<String, _>("tenant").map_err(db_err)?),
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        event_id: row.try_get("event_id").map_err(db_err)?,
        action_name: row.try_get("action_name").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        parameters: row.try_get("parameters").map_err(db_err)?,
        ready_to_execute: row.try_get("ready_to_execute").map_err(db_err)?,
        success: row.try_get("success").map_err(db_err)?,
        result: row.try_get("result").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_execution_status(value: &str) -> Result<ExecutionStatus, StoreError> {
    match value {
        "active" => Ok(ExecutionStatus::Active),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(StoreError::Database(format!("unknown execution status: {other}"))),
    }
}

fn parse_processing_status(value: &str) -> Result<ProcessingStatus, StoreError> {
    match value {
        "pending" => Ok(ProcessingStatus::Pending),
        "published" => Ok(ProcessingStatus::Published),
        "processing" => Ok(ProcessingStatus::Processing),
        "completed" => Ok(ProcessingStatus::Completed),
        "failed" => Ok(ProcessingStatus::Failed),
        "retrying" => Ok(ProcessingStatus::Retrying),
        other => Err(StoreError::Database(format!("unknown processing status: {other}"))),
    }
}
