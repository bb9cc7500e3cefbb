//! Event sourcing engine: pure replay of an execution's event log into
//! its derived state, plus a short-TTL cache fronting the persistence store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::instrument;
use uuid::Uuid;

use crate::model::{EventType, Tenant, WorkflowEvent};
use crate::persistence::{PersistenceStore, StoreError};

/// Default cache TTL for a replayed [`ExecutionState`].
pub const STATE_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

/// Derived state of one execution, the fold of its event log.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub tenant: Tenant,
    pub current_state: String,
    pub data: Map<String, Value>,
    pub events_applied: usize,
    pub is_complete: bool,
}

impl ExecutionState {
    fn initial(tenant: Tenant, execution_id: Uuid) -> Self {
        Self {
            execution_id,
            tenant,
            current_state: "initial".to_string(),
            data: Map::new(),
            events_applied: 0,
            is_complete: false,
        }
    }
}

/// Fold a single event into `state.data`, and mutate `state.current_state`/
/// `state.is_complete` for recognized system events. Unknown event names
/// leave `data` unchanged, matching the fold's documented behavior.
pub fn apply_event(state: &mut ExecutionState, event: &WorkflowEvent) {
    if let Some(assignment) = event.payload.get("data").and_then(Value::as_object) {
        if let (Some(key), Some(value)) = (
            assignment.get("key").and_then(Value::as_str),
            assignment.get("value"),
        ) {
            state.data.insert(key.to_string(), value.clone());
        }
    }

    // Matched by name alone: `event_type` classifies an event's origin
    // (system/workflow body/external caller), not how it folds into state,
    // and a workflow body's own `events.setState`/`events.emit` calls are
    // recorded as `EventType::Workflow`, not `EventType::System`.
    match event.event_name.as_str() {
        "workflow.started" => {
            state.current_state = "initial".to_string();
        }
        "workflow.transitioned" => {
            if let Some(to_state) = event.payload.get("to_state").and_then(Value::as_str) {
                state.current_state = to_state.to_string();
            }
        }
        "workflow.completed" => {
            state.is_complete = true;
        }
        _ => {}
    }

    state.events_applied += 1;
}

/// Fold `events` (already ordered by `(created_at, event_id)`) into an
/// [`ExecutionState`]. Pure: calling twice with the same event set yields
/// structurally equal state.
pub fn fold(tenant: Tenant, execution_id: Uuid, events: &[WorkflowEvent]) -> ExecutionState {
    let mut state = ExecutionState::initial(tenant, execution_id);
    for event in events {
        apply_event(&mut state, event);
    }
    state
}

struct CacheEntry {
    cached_at: Instant,
    state: ExecutionState,
}

/// `executionId -> {timestamp, state}` cache fronting [`replay`], with a
/// default TTL. Bypassed entirely when a caller asks for `debug` output or
/// an `up_to` bound, since those requests need a specific point-in-time view
/// rather than the latest one.
#[derive(Default)]
pub struct StateCache {
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, execution_id: Uuid, ttl: Duration) -> Option<ExecutionState> {
        let entries = self.entries.lock();
        let entry = entries.get(&execution_id)?;
        if entry.cached_at.elapsed() > ttl {
            return None;
        }
        Some(entry.state.clone())
    }

    fn put(&self, execution_id: Uuid, state: ExecutionState) {
        self.entries.lock().insert(
            execution_id,
            CacheEntry {
                cached_at: Instant::now(),
                state,
            },
        );
    }

    pub fn invalidate(&self, execution_id: Uuid) {
        self.entries.lock().remove(&execution_id);
    }
}

/// Options for [`replay`].
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Bound replay to events created at or before this time (time-travel
    /// debugging).
    pub up_to: Option<chrono::DateTime<chrono::Utc>>,
    /// Force a fresh replay even if a cached state exists.
    pub debug: bool,
}

/// Derive an execution's state by folding its event history, consulting
/// `cache` first unless `opts.debug` or `opts.up_to` is set.
#[instrument(skip(store, cache))]
pub async fn replay(
    store: &dyn PersistenceStore,
    cache: &StateCache,
    tenant: &Tenant,
    execution_id: Uuid,
    opts: ReplayOptions,
) -> Result<ExecutionState, ExecutorError> {
    let bypass_cache = opts.debug || opts.up_to.is_some();

    if !bypass_cache {
        if let Some(state) = cache.get(execution_id, STATE_CACHE_TTL) {
            return Ok(state);
        }
    }

    let events = store
        .list_events_for_execution(tenant, execution_id, opts.up_to)
        .await?;
    let state = fold(tenant.clone(), execution_id, &events);

    if !bypass_cache {
        cache.put(execution_id, state.clone());
    }

    Ok(state)
}

/// Cache handle shared by the runtime; a thin wrapper so callers don't pass
/// `Arc<StateCache>` around everywhere the cache lives.
pub type SharedStateCache = Arc<StateCache>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn system_event(
        tenant: &Tenant,
        execution_id: Uuid,
        name: &str,
        payload: Value,
        from_state: &str,
    ) -> WorkflowEvent {
        WorkflowEvent::new(tenant.clone(), execution_id, name, EventType::System, payload, from_state)
    }

    #[test]
    fn replay_is_deterministic_for_the_same_event_set() {
        let tenant = Tenant::new("acme");
        let execution_id = Uuid::now_v7();
        let events = vec![
            system_event(&tenant, execution_id, "workflow.started", json!({}), "none"),
            system_event(
                &tenant,
                execution_id,
                "workflow.transitioned",
                json!({"to_state": "approved"}),
                "initial",
            ),
        ];

        let a = fold(tenant.clone(), execution_id, &events);
        let b = fold(tenant, execution_id, &events);
        assert_eq!(a, b);
        assert_eq!(a.current_state, "approved");
        assert_eq!(a.events_applied, 2);
    }

    #[test]
    fn unknown_event_name_leaves_data_unchanged() {
        let tenant = Tenant::new("acme");
        let execution_id = Uuid::now_v7();
        let events = vec![system_event(
            &tenant,
            execution_id,
            "some.unrecognized.event",
            json!({}),
            "initial",
        )];
        let state = fold(tenant, execution_id, &events);
        assert!(state.data.is_empty());
        assert_eq!(state.current_state, "initial");
    }

    #[test]
    fn data_assignment_in_payload_sets_key() {
        let tenant = Tenant::new("acme");
        let execution_id = Uuid::now_v7();
        let events = vec![system_event(
            &tenant,
            execution_id,
            "workflow.started",
            json!({"data": {"key": "amount", "value": 10}}),
            "none",
        )];
        let state = fold(tenant, execution_id, &events);
        assert_eq!(state.data.get("amount"), Some(&json!(10)));
    }

    #[test]
    fn workflow_completed_marks_is_complete() {
        let tenant = Tenant::new("acme");
        let execution_id = Uuid::now_v7();
        let events = vec![system_event(
            &tenant,
            execution_id,
            "workflow.completed",
            json!({}),
            "approved",
        )];
        let state = fold(tenant, execution_id, &events);
        assert!(state.is_complete);
    }

    #[tokio::test]
    async fn replay_uses_cache_until_ttl_expires() {
        let store = InMemoryStore::default();
        let cache = StateCache::new();
        let tenant = Tenant::new("acme");
        let execution_id = Uuid::now_v7();

        let execution = crate::model::WorkflowExecution::new(tenant.clone(), "approval", "1");
        store.create_execution(execution).await.unwrap();
        let event = system_event(&tenant, execution_id, "workflow.started", json!({}), "none")
            .with_event_id(Uuid::now_v7());
        store.append_event(event).await.unwrap();

        let first = replay(&store, &cache, &tenant, execution_id, ReplayOptions::default())
            .await
            .unwrap();
        assert_eq!(first.events_applied, 1);

        // Append a second event directly, bypassing the cache: a cached
        // read should still return the stale one-event state.
        let second_event = system_event(
            &tenant,
            execution_id,
            "workflow.transitioned",
            json!({"to_state": "approved"}),
            "initial",
        );
        store.append_event(second_event).await.unwrap();

        let cached = replay(&store, &cache, &tenant, execution_id, ReplayOptions::default())
            .await
            .unwrap();
        assert_eq!(cached.events_applied, 1);

        let debug = replay(
            &store,
            &cache,
            &tenant,
            execution_id,
            ReplayOptions { up_to: None, debug: true },
        )
        .await
        .unwrap();
        assert_eq!(debug.events_applied, 2);
    }
}
