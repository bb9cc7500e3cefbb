//! Workflow runtime: the start/enqueue/process/wait operations that
//! tie the definition registry, action registry, event store, stream, and
//! lock together into one execution model.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::action::{ActionError, ActionRegistry, RegistryError};
use crate::engine::{self, ExecutorError, ReplayOptions, SharedStateCache};
use crate::lock::{DistributedLock, LockError, LockOptions};
use crate::model::{
    EventType, ExecutionStatus, ProcessingStatus, Tenant, WorkflowEvent, WorkflowExecution,
};
use crate::persistence::{IsolationLevel, PersistenceStore, StoreError};
use crate::reliability::{DefaultErrorClassifier, ErrorClass, ErrorClassifier};
use crate::stream::{StreamClient, StreamError};

use super::context::{EmitFn, WaiterRegistry, WorkflowContext};
use super::definition::{RegistrationLoader, WorkflowDefinition, WorkflowDefinitionRegistry};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Sourcing(#[from] ExecutorError),

    #[error("unknown workflow definition: {0}")]
    DefinitionNotFound(String),

    #[error("lock contention on {0}")]
    LockContention(String),

    #[error("timed out waiting for execution {0} to complete")]
    WaitTimeout(Uuid),
}

#[derive(Debug, Clone, Default)]
pub struct StartExecutionOptions {
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartResult {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitEventOptions {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub event_id: Uuid,
    pub processing_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub execution_id: Uuid,
    pub event_id: Uuid,
    pub to_state: String,
}

/// Ties the definition registry, action registry, event store, optional
/// stream transport, and optional distributed lock into the
/// start/enqueue/process/wait operations every host process drives.
///
/// Cheaply cloneable: every field is itself `Arc`-backed, so a clone can be
/// captured by the [`EmitFn`] closure a spawned execute function carries.
/// Upper bound on `attempt_count` before a row is finalized `failed` for
/// good, matching the worker config's own `maxRetries` default.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct WorkflowRuntime {
    store: Arc<dyn PersistenceStore>,
    actions: Arc<ActionRegistry>,
    definitions: Arc<Mutex<WorkflowDefinitionRegistry>>,
    loader: Option<Arc<dyn RegistrationLoader>>,
    cache: SharedStateCache,
    waiters: Arc<WaiterRegistry>,
    stream: Option<Arc<dyn StreamClient>>,
    lock: Option<Arc<dyn DistributedLock>>,
    classifier: Arc<dyn ErrorClassifier>,
    default_max_attempts: u32,
    stream_name: String,
    consumer_group: String,
}

impl WorkflowRuntime {
    pub fn new(store: Arc<dyn PersistenceStore>, actions: Arc<ActionRegistry>) -> Self {
        Self {
            store,
            actions,
            definitions: Arc::new(Mutex::new(WorkflowDefinitionRegistry::new())),
            loader: None,
            cache: Arc::new(engine::StateCache::new()),
            waiters: Arc::new(WaiterRegistry::new()),
            stream: None,
            lock: None,
            classifier: Arc::new(DefaultErrorClassifier),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            stream_name: "workflow:events:global".to_string(),
            consumer_group: "workflow-workers".to_string(),
        }
    }

    /// Switch to distributed mode: `enqueueEvent` publishes to `stream`
    /// rather than processing the event inline.
    pub fn with_stream(mut self, stream: Arc<dyn StreamClient>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn RegistrationLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Overrides how processing failures are classified into
    /// `{transient, recoverable, permanent}`; defaults to
    /// [`DefaultErrorClassifier`].
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Overrides `maxRetries`: the attempt budget newly enqueued events get.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn register_workflow(&self, definition: WorkflowDefinition) {
        self.definitions.lock().register(definition);
    }

    /// `getDefinition`: resolves from the in-memory registry; an absent
    /// entry is a hard error even when a matching registration exists in
    /// the external loader, since that loader only carries metadata, not a
    /// callable body the process hasn't already registered.
    pub async fn get_definition(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<WorkflowDefinition, RuntimeError> {
        if let Some(def) = self.definitions.lock().get(name, version) {
            return Ok(def);
        }
        if let Some(loader) = &self.loader {
            if loader.load(name).await?.is_some() {
                warn!(workflow = name, "registration found externally but no compiled definition is registered");
            }
        }
        Err(RuntimeError::DefinitionNotFound(name.to_string()))
    }

    /// `startExecution`: resolves the definition, creates the execution
    /// row, appends `workflow.started`, and spawns the execute function in
    /// the background so the caller isn't blocked on the body's first
    /// `events.waitFor` suspension.
    #[instrument(skip(self, input))]
    pub async fn start_execution(
        &self,
        tenant: Tenant,
        workflow_name: &str,
        input: Value,
        options: StartExecutionOptions,
    ) -> Result<StartResult, RuntimeError> {
        let definition = self.get_definition(workflow_name, options.version.as_deref()).await?;

        let mut execution = WorkflowExecution::new(tenant.clone(), workflow_name, &definition.version);
        let execution_id = execution.execution_id;
        if let Some(input_obj) = input.as_object() {
            execution.context_data = input_obj.clone();
        }
        self.store.create_execution(execution).await?;

        let started = WorkflowEvent::new(
            tenant.clone(),
            execution_id,
            "workflow.started",
            EventType::System,
            input,
            "none",
        );
        self.store.append_event(started).await?;

        let state = engine::replay(self.store.as_ref(), &self.cache, &tenant, execution_id, ReplayOptions::default())
            .await?;
        let ctx = self.build_context(tenant, execution_id, state);

        let execute = definition.execute.clone();
        tokio::spawn(async move {
            execute(ctx).await;
        });

        Ok(StartResult { execution_id })
    }

    /// `submitEventSync`: processes the event inline and returns once
    /// applied, bypassing the stream entirely. Used in single-process mode
    /// and by tests.
    #[instrument(skip(self, payload))]
    pub async fn submit_event_sync(
        &self,
        tenant: Tenant,
        execution_id: Uuid,
        event_name: &str,
        payload: Value,
        options: SubmitEventOptions,
    ) -> Result<ProcessResult, RuntimeError> {
        let execution = self.store.get_execution(&tenant, execution_id).await?;
        let mut event = WorkflowEvent::new(
            tenant.clone(),
            execution_id,
            event_name,
            EventType::User,
            payload,
            &execution.current_state,
        );
        if let Some(user_id) = options.user_id {
            event = event.with_user_id(user_id);
        }
        let event = self.store.append_event(event).await?;

        let record = crate::model::EventProcessingRecord::new(tenant.clone(), event.event_id, execution_id, 1);
        let record = self.store.create_processing_record(record).await?;

        self.process_locked(&tenant, &record, "inline").await
    }

    /// `enqueueEvent`: appends the event, creates its processing record,
    /// and either publishes to the stream (distributed mode) or processes
    /// it inline (no stream configured).
    #[instrument(skip(self, payload))]
    pub async fn enqueue_event(
        &self,
        tenant: Tenant,
        execution_id: Uuid,
        event_name: &str,
        payload: Value,
    ) -> Result<EnqueueResult, RuntimeError> {
        let execution = self.store.get_execution(&tenant, execution_id).await?;
        let event = WorkflowEvent::new(
            tenant.clone(),
            execution_id,
            event_name,
            EventType::Workflow,
            payload,
            &execution.current_state,
        );

        let key = format!("workflow:{execution_id}");
        let handle = self.store.begin_transaction(&key, IsolationLevel::ReadCommitted).await?;

        let appended: Result<(WorkflowEvent, crate::model::EventProcessingRecord), RuntimeError> = async {
            let event = self.store.append_event(event).await?;

            let record = crate::model::EventProcessingRecord::new(
                tenant.clone(),
                event.event_id,
                execution_id,
                self.default_max_attempts,
            );
            let mut record = self.store.create_processing_record(record).await?;

            if let Some(stream) = &self.stream {
                let stream_event: crate::model::StreamEvent = (&event).into();
                stream.publish(&self.stream_name, &stream_event).await?;
                record = self
                    .store
                    .transition_processing_record(&tenant, record.processing_id, ProcessingStatus::Published, None, None)
                    .await?;
            }

            Ok((event, record))
        }
        .await;

        let (event, record) = match appended {
            Ok(pair) => {
                handle.commit().await?;
                pair
            }
            Err(e) => {
                let _ = handle.rollback().await;
                return Err(e);
            }
        };

        if self.stream.is_none() {
            self.process_locked(&tenant, &record, "inline").await?;
        }

        Ok(EnqueueResult {
            event_id: event.event_id,
            processing_id: record.processing_id,
        })
    }

    /// `processQueuedEvent`: the worker-side counterpart to `enqueueEvent`.
    /// Acquires the per-event lock (when configured) before mutating
    /// anything, and always releases it before returning.
    #[instrument(skip(self))]
    pub async fn process_queued_event(
        &self,
        tenant: &Tenant,
        processing_id: Uuid,
        worker_id: &str,
    ) -> Result<ProcessResult, RuntimeError> {
        let record = self.store.get_processing_record(tenant, processing_id).await?;
        let lock_key = format!("event:{}", record.event_id);

        if let Some(lock) = &self.lock {
            let opts = LockOptions::event_processing_default();
            if !lock.acquire(&lock_key, worker_id, opts).await? {
                return Err(RuntimeError::LockContention(lock_key));
            }
        }

        let result = self.process_locked(tenant, &record, worker_id).await;

        if let Some(lock) = &self.lock {
            if let Err(e) = lock.release(&lock_key, worker_id).await {
                warn!(key = %lock_key, error = %e, "failed to release event lock");
            }
        }

        result
    }

    async fn process_locked(
        &self,
        tenant: &Tenant,
        record: &crate::model::EventProcessingRecord,
        worker_id: &str,
    ) -> Result<ProcessResult, RuntimeError> {
        // A row claimed fresh (`pending`/`published`) dispatches as
        // `processing`; anything else reaching here came off the retry
        // scan (`failed` under budget, or an abandoned `processing` row),
        // so it's marked `retrying` with this worker's id instead, making
        // "owner while retrying" observable for the duration of the retry.
        let is_retry = !matches!(record.status, ProcessingStatus::Pending | ProcessingStatus::Published);
        let dispatch_status = if is_retry { ProcessingStatus::Retrying } else { ProcessingStatus::Processing };
        self.store
            .transition_processing_record(tenant, record.processing_id, dispatch_status, Some(worker_id), None)
            .await?;

        match self.apply_event(tenant, record.event_id, record.execution_id).await {
            Ok(to_state) => {
                self.store
                    .transition_processing_record(tenant, record.processing_id, ProcessingStatus::Completed, Some(worker_id), None)
                    .await?;
                self.waiters.notify(record.execution_id);
                info!(execution_id = %record.execution_id, event_id = %record.event_id, to_state = %to_state, "event applied");
                Ok(ProcessResult {
                    execution_id: record.execution_id,
                    event_id: record.event_id,
                    to_state,
                })
            }
            Err(e) => {
                let message = e.to_string();
                let action_error = runtime_error_to_action_error(&e);
                let class = self.classifier.classify(&action_error);

                if class == ErrorClass::Permanent {
                    // No `next_attempt_at` gets scheduled: the retry scan
                    // must never pick this row back up.
                    self.store
                        .fail_permanently(tenant, record.processing_id, Some(worker_id), &message)
                        .await?;
                } else {
                    self.store
                        .transition_processing_record(
                            tenant,
                            record.processing_id,
                            ProcessingStatus::Failed,
                            Some(worker_id),
                            Some(message.as_str()),
                        )
                        .await?;
                }
                Err(e)
            }
        }
    }

    async fn apply_event(
        &self,
        tenant: &Tenant,
        event_id: Uuid,
        execution_id: Uuid,
    ) -> Result<String, RuntimeError> {
        let event = self.store.get_event(tenant, event_id).await?;
        let state = engine::replay(self.store.as_ref(), &self.cache, tenant, execution_id, ReplayOptions::default())
            .await?;

        let mut next_state = state.clone();
        engine::apply_event(&mut next_state, &event);

        self.store.set_event_to_state(tenant, event.event_id, &next_state.current_state).await?;
        self.store
            .update_execution_state(tenant, execution_id, &next_state.current_state, next_state.data.clone())
            .await?;
        self.cache.invalidate(execution_id);

        if next_state.is_complete {
            self.store
                .update_execution_status(tenant, execution_id, ExecutionStatus::Completed, None, None)
                .await?;
        }

        Ok(next_state.current_state)
    }

    /// `getExecutionState`: the current derived state, via the cache.
    pub async fn get_execution_state(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
    ) -> Result<engine::ExecutionState, RuntimeError> {
        Ok(engine::replay(self.store.as_ref(), &self.cache, tenant, execution_id, ReplayOptions::default()).await?)
    }

    /// Polls `get_execution` until terminal or `max_wait` elapses.
    pub async fn wait_for_completion(
        &self,
        tenant: &Tenant,
        execution_id: Uuid,
        max_wait: Duration,
        check_interval: Duration,
    ) -> Result<WorkflowExecution, RuntimeError> {
        let deadline = Utc::now() + chrono::Duration::from_std(max_wait).unwrap_or(chrono::Duration::zero());
        loop {
            let execution = self.store.get_execution(tenant, execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            if Utc::now() >= deadline {
                return Err(RuntimeError::WaitTimeout(execution_id));
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Global dispatch: starts one execution per active attachment
    /// matching `event_type`.
    pub async fn dispatch_global_event(
        &self,
        tenant: &Tenant,
        event_type: &str,
        payload: Value,
    ) -> Result<Vec<StartResult>, RuntimeError> {
        let attachments = self.store.list_attachments(tenant, event_type).await?;
        let mut results = Vec::with_capacity(attachments.len());
        for attachment in attachments.into_iter().filter(|a| a.is_active) {
            let result = self
                .start_execution(tenant.clone(), &attachment.workflow_name, payload.clone(), StartExecutionOptions::default())
                .await?;
            results.push(result);
        }
        Ok(results)
    }

    fn build_context(&self, tenant: Tenant, execution_id: Uuid, state: engine::ExecutionState) -> WorkflowContext {
        let emit: EmitFn = {
            let runtime = self.clone();
            Arc::new(move |tenant, execution_id, name, payload| {
                let runtime = runtime.clone();
                Box::pin(async move { runtime.enqueue_event(tenant, execution_id, &name, payload).await.map(|_| ()) })
            })
        };

        WorkflowContext::new(
            tenant,
            execution_id,
            self.store.clone(),
            self.actions.clone(),
            self.cache.clone(),
            self.waiters.clone(),
            emit,
            state,
        )
    }
}

/// Maps any [`RuntimeError`] surfaced while applying a queued event to an
/// [`ActionError`] so it can run through the same [`ErrorClassifier`] an
/// action invocation's own failures do. Shared by [`WorkflowRuntime`] and
/// [`crate::worker::service`]'s per-record classification.
pub(crate) fn runtime_error_to_action_error(err: &RuntimeError) -> ActionError {
    match err {
        RuntimeError::DefinitionNotFound(_) => ActionError::validation(err.to_string()),
        _ => ActionError::retryable(err.to_string()),
    }
}

impl std::fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntime")
            .field("stream_name", &self.stream_name)
            .field("consumer_group", &self.consumer_group)
            .field("distributed", &self.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tenant;
    use crate::persistence::InMemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn runtime() -> WorkflowRuntime {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::default());
        let actions = Arc::new(ActionRegistry::new(store.clone()));
        WorkflowRuntime::new(store, actions)
    }

    #[tokio::test]
    async fn start_execution_runs_the_registered_body() {
        let runtime = runtime();
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();

        runtime.register_workflow(WorkflowDefinition::new(
            "noop",
            "1",
            Arc::new(move |ctx: WorkflowContext| {
                let flag = flag.clone();
                Box::pin(async move {
                    ctx.set_state("done").await.ok();
                    flag.store(true, Ordering::SeqCst);
                })
            }),
        ));

        let tenant = Tenant::new("acme");
        let result = runtime
            .start_execution(tenant.clone(), "noop", serde_json::json!({}), StartExecutionOptions::default())
            .await
            .unwrap();

        // Give the spawned execute function a chance to run.
        for _ in 0..20 {
            if completed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed.load(Ordering::SeqCst));

        let state = runtime.get_execution_state(&tenant, result.execution_id).await.unwrap();
        assert_eq!(state.current_state, "done");
    }

    #[tokio::test]
    async fn unregistered_workflow_is_an_error() {
        let runtime = runtime();
        let err = runtime
            .start_execution(Tenant::new("acme"), "missing", serde_json::json!({}), StartExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn submit_event_sync_applies_immediately() {
        let runtime = runtime();
        runtime.register_workflow(WorkflowDefinition::new(
            "approval",
            "1",
            Arc::new(|_ctx: WorkflowContext| Box::pin(async {})),
        ));

        let tenant = Tenant::new("acme");
        let start = runtime
            .start_execution(tenant.clone(), "approval", serde_json::json!({}), StartExecutionOptions::default())
            .await
            .unwrap();

        let result = runtime
            .submit_event_sync(
                tenant.clone(),
                start.execution_id,
                "approve",
                serde_json::json!({}),
                SubmitEventOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.execution_id, start.execution_id);
    }
}
