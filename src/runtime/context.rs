//! Execute-function context: the `actions`/`data`/`events`/`state`
//! surface a workflow body runs against, described for the runtime's
//! `events.waitFor` suspension model.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::{ActionContext, ActionRegistry, RegistryError};
use crate::engine::{ExecutionState, SharedStateCache};
use crate::model::Tenant;
use crate::persistence::PersistenceStore;

use super::engine::RuntimeError;

/// How often `events.waitFor` re-checks the event log between wake-ups, in
/// case the waiter notification races the event append.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Emits a workflow-originated event through the runtime's `enqueueEvent`
/// path. A plain closure rather than a reference to
/// [`super::engine::WorkflowRuntime`] so this module doesn't need to know
/// the runtime's concrete type.
pub type EmitFn = Arc<
    dyn Fn(Tenant, Uuid, String, Value) -> futures::future::BoxFuture<'static, Result<(), RuntimeError>>
        + Send
        + Sync,
>;

/// Per-execution `Notify` handles so `events.waitFor` wakes promptly instead
/// of relying solely on its poll interval. Shared across every
/// [`WorkflowContext`] the runtime spawns.
#[derive(Default)]
pub struct WaiterRegistry {
    notifiers: Mutex<HashMap<Uuid, Arc<Notify>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, execution_id: Uuid) -> Arc<Notify> {
        self.notifiers
            .lock()
            .entry(execution_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake any context suspended on `execution_id`. Called by the runtime
    /// after a queued event has been applied.
    pub fn notify(&self, execution_id: Uuid) {
        if let Some(notify) = self.notifiers.lock().get(&execution_id) {
            notify.notify_waiters();
        }
    }
}

/// Context passed to a [`super::WorkflowDefinition::execute`] body.
///
/// Holds a local, mutable view of the execution's derived state
/// ([`ExecutionState`]) that `data`/`state` operations read synchronously
/// and write by appending an event and folding it in immediately, so a
/// workflow body sees its own writes without a round trip through the
/// store's replay path.
#[derive(Clone)]
pub struct WorkflowContext {
    tenant: Tenant,
    execution_id: Uuid,
    store: Arc<dyn PersistenceStore>,
    actions: Arc<ActionRegistry>,
    cache: SharedStateCache,
    waiters: Arc<WaiterRegistry>,
    emit: EmitFn,
    state: Arc<Mutex<ExecutionState>>,
    seen_event_names: Arc<Mutex<Vec<String>>>,
    call_index: Arc<AtomicUsize>,
}

impl WorkflowContext {
    pub fn new(
        tenant: Tenant,
        execution_id: Uuid,
        store: Arc<dyn PersistenceStore>,
        actions: Arc<ActionRegistry>,
        cache: SharedStateCache,
        waiters: Arc<WaiterRegistry>,
        emit: EmitFn,
        initial_state: ExecutionState,
    ) -> Self {
        Self {
            tenant,
            execution_id,
            store,
            actions,
            cache,
            waiters,
            emit,
            state: Arc::new(Mutex::new(initial_state)),
            seen_event_names: Arc::new(Mutex::new(Vec::new())),
            call_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// `actions.<name>(params)`: invoke a registered action under a
    /// deterministic idempotency key derived from `(execution_id,
    /// action_name, call_index)`, where `call_index` is this context's
    /// own monotonic call counter. A re-spawned context (after a worker
    /// restart) starts that counter back at zero and calls actions in the
    /// same order the original run did, so the Nth `actions.<name>()` call
    /// always lands on the same key and short-circuits on the persisted
    /// result instead of re-running the action body.
    pub async fn call_action(&self, action_name: &str, input: Value) -> Result<Value, RegistryError> {
        let call_index = self.call_index.fetch_add(1, Ordering::SeqCst);
        let idempotency_key = ActionContext::call_index_idempotency_key(self.execution_id, action_name, call_index);
        let ctx = ActionContext::new(self.tenant.clone(), self.execution_id, None, action_name, idempotency_key);
        self.actions.execute(&ctx, input).await
    }

    /// `data.get(key)`.
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.state.lock().data.get(key).cloned()
    }

    /// `data.set(key, value)`: appended as a data-assignment event so
    /// replay after a restart reconstructs the same value, and folded into
    /// the local state mirror immediately so a subsequent `data.get` in the
    /// same body sees it without waiting on the store round trip.
    pub async fn set_data(&self, key: &str, value: Value) -> Result<(), RuntimeError> {
        let payload = serde_json::json!({ "data": { "key": key, "value": value } });
        self.emit_internal("workflow.data_set", payload).await?;
        self.state.lock().data.insert(key.to_string(), value);
        Ok(())
    }

    /// `getCurrentState()`.
    pub fn get_current_state(&self) -> String {
        self.state.lock().current_state.clone()
    }

    /// `setState(name)`: appended as a `workflow.transitioned` event, folded
    /// into the local state mirror immediately (see [`Self::set_data`]).
    pub async fn set_state(&self, new_state: impl Into<String>) -> Result<(), RuntimeError> {
        let new_state = new_state.into();
        let payload = serde_json::json!({ "to_state": new_state.clone() });
        self.emit_internal("workflow.transitioned", payload).await?;
        self.state.lock().current_state = new_state;
        Ok(())
    }

    /// `events.emit(name, payload)`: routes through the runtime's
    /// `enqueueEvent`, so the emitted event is itself subject to the
    /// at-least-once delivery and processing-record bookkeeping every other
    /// event gets.
    pub async fn emit(&self, event_name: &str, payload: Value) -> Result<(), RuntimeError> {
        (self.emit)(self.tenant.clone(), self.execution_id, event_name.to_string(), payload).await
    }

    async fn emit_internal(&self, event_name: &str, payload: Value) -> Result<(), RuntimeError> {
        self.emit(event_name, payload).await?;
        self.cache.invalidate(self.execution_id);
        Ok(())
    }

    /// `events.waitFor(name)`: suspends until an event named `name` has been
    /// applied to this execution, returning its payload. Polls the event log
    /// on a timer in addition to the waiter notification, so a notification
    /// that races the store write is never missed outright.
    pub async fn wait_for(&self, event_name: &str) -> Result<Value, RuntimeError> {
        self.wait_for_any(&[event_name]).await.map(|(_, payload)| payload)
    }

    /// `events.waitFor([names])`: as [`Self::wait_for`], but resolves on the
    /// first of several event names, returning which one matched.
    pub async fn wait_for_any(&self, event_names: &[&str]) -> Result<(String, Value), RuntimeError> {
        loop {
            if let Some(found) = self.scan_for_events(event_names).await? {
                return Ok(found);
            }

            let notify = self.waiters.handle(self.execution_id);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    async fn scan_for_events(&self, event_names: &[&str]) -> Result<Option<(String, Value)>, RuntimeError> {
        let events = self
            .store
            .list_events_for_execution(&self.tenant, self.execution_id, None)
            .await?;

        let mut seen = self.seen_event_names.lock();
        for event in &events {
            if seen.contains(&event.event_id.to_string()) {
                continue;
            }
            seen.push(event.event_id.to_string());
            if event_names.contains(&event.event_name.as_str()) {
                return Ok(Some((event.event_name.clone(), event.payload.clone())));
            }
        }
        Ok(None)
    }

    /// Structured-logging helper tagging every line with execution identity.
    pub fn log_info(&self, message: &str) {
        info!(execution_id = %self.execution_id, tenant = %self.tenant.as_str(), "{message}");
    }

    pub fn log_warn(&self, message: &str) {
        warn!(execution_id = %self.execution_id, tenant = %self.tenant.as_str(), "{message}");
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("tenant", &self.tenant)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Polled manually via `tokio_test::task::spawn` rather than driven by a
    // runtime, so a missing `notify_waiters()` call shows up as a future
    // stuck `Pending` forever instead of a test that just happens to pass.
    #[test]
    fn notify_wakes_a_waiter_blocked_on_the_same_execution() {
        let registry = WaiterRegistry::new();
        let execution_id = Uuid::now_v7();
        let notify = registry.handle(execution_id);

        let mut waiter = tokio_test::task::spawn(async move {
            notify.notified().await;
        });

        assert!(waiter.poll().is_pending(), "waiter resolved before any notify");

        registry.notify(execution_id);
        assert!(waiter.poll().is_ready(), "waiter did not wake after notify");
    }

    #[test]
    fn notify_on_an_unregistered_execution_is_a_no_op() {
        let registry = WaiterRegistry::new();
        registry.notify(Uuid::now_v7());
    }
}
