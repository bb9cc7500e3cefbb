//! In-memory [`PersistenceStore`] for tests, patterned on
//! `InMemoryWorkflowEventStore` (same `parking_lot::RwLock<HashMap<...>>`
//! shape).

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    ActionResult, EventProcessingRecord, ExecutionStatus, ProcessingStatus, Tenant,
    WorkflowAttachment, WorkflowEvent, WorkflowExecution, WorkflowRegistration,
};

use super::store::{
    IsolationLevel, PersistenceStore, ProcessingBatch, StoreError, TransactionHandle,
};

/// A transaction handle with no real backing transaction: every mutation the
/// in-memory store performs is already atomic under its own lock, so commit
/// and rollback are both no-ops. Exists so [`crate::action::ActionRegistry`]
/// can run transactional actions against this store in tests.
struct NullTransactionHandle;

#[async_trait]
impl TransactionHandle for NullTransactionHandle {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    events: RwLock<HashMap<Uuid, WorkflowEvent>>,
    processing: RwLock<HashMap<Uuid, EventProcessingRecord>>,
    processing_by_event: RwLock<HashMap<Uuid, Uuid>>,
    action_results: RwLock<HashMap<(Uuid, String, String), ActionResult>>,
    registrations: RwLock<HashMap<(String, String), WorkflowRegistration>>,
    attachments: RwLock<HashMap<(String, String), Vec<WorkflowAttachment>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn create_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(execution.execution_id, execution);
        Ok(())
    }

    async fn get_execution(
        &self,
        _tenant: &Tenant,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, StoreError> {
        self.executions
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn update_execution_state(
        &self,
        _tenant: &Tenant,
        execution_id: Uuid,
        current_state: &str,
        context_data: serde_json::Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        execution.current_state = current_state.to_string();
        execution.context_data = context_data;
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn update_execution_status(
        &self,
        _tenant: &Tenant,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        execution.status = status;
        execution.result = result;
        execution.error_message = error_message;
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn append_event(&self, event: WorkflowEvent) -> Result<WorkflowEvent, StoreError> {
        let mut events = self.events.write();
        if let Some(existing) = events.get(&event.event_id) {
            return Ok(existing.clone());
        }
        events.insert(event.event_id, event.clone());
        Ok(event)
    }

    async fn set_event_to_state(
        &self,
        _tenant: &Tenant,
        event_id: Uuid,
        to_state: &str,
    ) -> Result<(), StoreError> {
        let mut events = self.events.write();
        let event = events
            .get_mut(&event_id)
            .ok_or(StoreError::EventNotFound(event_id))?;
        event.to_state = to_state.to_string();
        Ok(())
    }

    async fn get_event(&self, _tenant: &Tenant, event_id: Uuid) -> Result<WorkflowEvent, StoreError> {
        self.events
            .read()
            .get(&event_id)
            .cloned()
            .ok_or(StoreError::EventNotFound(event_id))
    }

    async fn list_events_for_execution(
        &self,
        _tenant: &Tenant,
        execution_id: Uuid,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkflowEvent>, StoreError> {
        let mut events: Vec<WorkflowEvent> = self
            .events
            .read()
            .values()
            .filter(|e| e.execution_id == execution_id)
            .filter(|e| up_to.map(|bound| e.created_at <= bound).unwrap_or(true))
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.created_at, a.event_id).cmp(&(b.created_at, b.event_id)));
        Ok(events)
    }

    async fn create_processing_record(
        &self,
        record: EventProcessingRecord,
    ) -> Result<EventProcessingRecord, StoreError> {
        let mut by_event = self.processing_by_event.write();
        if let Some(existing_id) = by_event.get(&record.event_id) {
            // Idempotent enqueue: return the existing record.
            return self
                .processing
                .read()
                .get(existing_id)
                .cloned()
                .ok_or(StoreError::ProcessingNotFound(*existing_id));
        }
        by_event.insert(record.event_id, record.processing_id);
        self.processing
            .write()
            .insert(record.processing_id, record.clone());
        Ok(record)
    }

    async fn get_processing_record(
        &self,
        _tenant: &Tenant,
        processing_id: Uuid,
    ) -> Result<EventProcessingRecord, StoreError> {
        self.processing
            .read()
            .get(&processing_id)
            .cloned()
            .ok_or(StoreError::ProcessingNotFound(processing_id))
    }

    async fn transition_processing_record(
        &self,
        _tenant: &Tenant,
        processing_id: Uuid,
        status: ProcessingStatus,
        worker_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<EventProcessingRecord, StoreError> {
        let mut processing = self.processing.write();
        let record = processing
            .get_mut(&processing_id)
            .ok_or(StoreError::ProcessingNotFound(processing_id))?;

        if matches!(status, ProcessingStatus::Processing | ProcessingStatus::Retrying) {
            record.attempt_count += 1;
            record.last_attempt_at = Some(Utc::now());
        }
        record.status = status;
        record.worker_id = worker_id.map(|s| s.to_string());
        record.error_message = error_message.map(|s| s.to_string());
        if matches!(status, ProcessingStatus::Failed) {
            record.next_attempt_at = Some(Utc::now() + chrono::Duration::seconds(1));
        }
        Ok(record.clone())
    }

    async fn fail_permanently(
        &self,
        _tenant: &Tenant,
        processing_id: Uuid,
        worker_id: Option<&str>,
        error_message: &str,
    ) -> Result<EventProcessingRecord, StoreError> {
        let mut processing = self.processing.write();
        let record = processing
            .get_mut(&processing_id)
            .ok_or(StoreError::ProcessingNotFound(processing_id))?;

        record.status = ProcessingStatus::Failed;
        record.worker_id = worker_id.map(|s| s.to_string());
        record.error_message = Some(error_message.to_string());
        record.attempt_count = record.max_attempts;
        record.next_attempt_at = None;
        Ok(record.clone())
    }

    async fn claim_processing_batch(
        &self,
        batch_size: usize,
        lock_ttl: Duration,
    ) -> Result<ProcessingBatch, StoreError> {
        let processing = self.processing.read();
        let now = Utc::now();
        let lock_ttl = chrono::Duration::from_std(lock_ttl).unwrap_or(chrono::Duration::seconds(60));

        let mut fresh: Vec<EventProcessingRecord> = processing
            .values()
            .filter(|r| matches!(r.status, ProcessingStatus::Pending | ProcessingStatus::Published))
            .cloned()
            .collect();
        fresh.sort_by_key(|r| r.created_at);
        fresh.truncate(batch_size);

        let mut retries: Vec<EventProcessingRecord> = processing
            .values()
            .filter(|r| r.eligible_for_retry(now, lock_ttl))
            .cloned()
            .collect();
        retries.sort_by_key(|r| r.created_at);
        retries.truncate(batch_size);

        Ok(ProcessingBatch { fresh, retries })
    }

    async fn find_action_result(
        &self,
        _tenant: &Tenant,
        execution_id: Uuid,
        action_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<ActionResult>, StoreError> {
        let key = (execution_id, action_name.to_string(), idempotency_key.to_string());
        Ok(self.action_results.read().get(&key).cloned())
    }

    async fn insert_action_result(&self, result: ActionResult) -> Result<ActionResult, StoreError> {
        let key = (
            result.execution_id,
            result.action_name.clone(),
            result.idempotency_key.clone(),
        );
        let mut results = self.action_results.write();
        if let Some(existing) = results.get(&key) {
            return Ok(existing.clone());
        }
        results.insert(key, result.clone());
        Ok(result)
    }

    async fn complete_action_result(
        &self,
        _tenant: &Tenant,
        result_id: Uuid,
        success: bool,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut results = self.action_results.write();
        let entry = results
            .values_mut()
            .find(|r| r.result_id == result_id)
            .ok_or(StoreError::Database(format!("action result not found: {result_id}")))?;
        entry.success = Some(success);
        entry.result = result;
        entry.error_message = error_message;
        entry.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn begin_transaction(
        &self,
        _key: &str,
        _isolation: IsolationLevel,
    ) -> Result<Box<dyn TransactionHandle>, StoreError> {
        Ok(Box::new(NullTransactionHandle))
    }

    async fn get_registration(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Option<WorkflowRegistration>, StoreError> {
        Ok(self
            .registrations
            .read()
            .get(&(tenant.as_str().to_string(), name.to_string()))
            .cloned())
    }

    async fn list_attachments(
        &self,
        tenant: &Tenant,
        event_type: &str,
    ) -> Result<Vec<WorkflowAttachment>, StoreError> {
        Ok(self
            .attachments
            .read()
            .get(&(tenant.as_str().to_string(), event_type.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

impl InMemoryStore {
    /// Test/fixture helper: seed a registration so `get_registration` can
    /// resolve it.
    pub fn seed_registration(&self, registration: WorkflowRegistration) {
        self.registrations.write().insert(
            (registration.tenant.as_str().to_string(), registration.name.clone()),
            registration,
        );
    }

    /// Test/fixture helper: seed an attachment so global dispatch
    /// finds it.
    pub fn seed_attachment(&self, attachment: WorkflowAttachment) {
        self.attachments
            .write()
            .entry((attachment.tenant.as_str().to_string(), attachment.event_type.clone()))
            .or_default()
            .push(attachment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use serde_json::json;

    fn tenant() -> Tenant {
        Tenant::new("t1")
    }

    #[tokio::test]
    async fn duplicate_event_append_is_idempotent() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();
        let event = WorkflowEvent::new(
            tenant(),
            execution_id,
            "approve",
            EventType::User,
            json!({}),
            "initial",
        );
        let first = store.append_event(event.clone()).await.unwrap();
        let second = store.append_event(event.clone()).await.unwrap();
        assert_eq!(first.event_id, second.event_id);
        assert_eq!(
            store
                .list_events_for_execution(&tenant(), execution_id, None)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_processing_record_for_same_event_is_idempotent() {
        let store = InMemoryStore::new();
        let event_id = Uuid::now_v7();
        let execution_id = Uuid::now_v7();
        let record = EventProcessingRecord::new(tenant(), event_id, execution_id, 3);
        let first = store.create_processing_record(record.clone()).await.unwrap();
        let second = store.create_processing_record(record).await.unwrap();
        assert_eq!(first.processing_id, second.processing_id);
    }

    #[tokio::test]
    async fn action_result_lookup_returns_stored_result_once_completed() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();
        let result = ActionResult::pending(
            tenant(),
            execution_id,
            None,
            "send_email",
            "k1",
            json!({}),
        );
        let inserted = store.insert_action_result(result).await.unwrap();
        store
            .complete_action_result(&tenant(), inserted.result_id, true, Some(json!({"ok": true})), None)
            .await
            .unwrap();

        let found = store
            .find_action_result(&tenant(), execution_id, "send_email", "k1")
            .await
            .unwrap()
            .expect("result should exist");
        assert!(found.is_completed());
        assert_eq!(found.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn to_state_is_set_exactly_once() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();
        let event = WorkflowEvent::new(
            tenant(),
            execution_id,
            "approve",
            EventType::User,
            json!({}),
            "pending",
        );
        let event_id = event.event_id;
        store.append_event(event).await.unwrap();
        store.set_event_to_state(&tenant(), event_id, "approved").await.unwrap();
        let loaded = store.get_event(&tenant(), event_id).await.unwrap();
        assert_eq!(loaded.to_state, "approved");
        assert!(loaded.is_applied());
    }
}
