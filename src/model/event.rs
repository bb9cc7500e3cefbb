//! Workflow Event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Tenant;

/// Classification of a Workflow Event's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Produced internally by the runtime (e.g. `workflow.started`).
    System,
    /// Produced by a workflow definition's own execute function.
    Workflow,
    /// Produced by an external caller via `enqueueEvent`/`submitEventSync`.
    User,
}

/// A single entry in an execution's append-only event log.
///
/// `event_id` doubles as the idempotency key for enqueue deduplication
/// (invariant: at most one row per `event_id`). `to_state` starts out equal
/// to `from_state` and is written exactly once, by the processor, after
/// state derivation determines the post-event state; once non-null it must
/// never be rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: Uuid,
    pub tenant: Tenant,
    pub execution_id: Uuid,
    pub event_name: String,
    pub event_type: EventType,
    pub payload: Value,
    pub user_id: Option<String>,
    pub from_state: String,
    pub to_state: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Construct a new event with `to_state` left equal to `from_state`,
    /// matching the pre-application state described by the Event entity.
    pub fn new(
        tenant: Tenant,
        execution_id: Uuid,
        event_name: impl Into<String>,
        event_type: EventType,
        payload: Value,
        from_state: impl Into<String>,
    ) -> Self {
        let from_state = from_state.into();
        Self {
            event_id: Uuid::now_v7(),
            tenant,
            execution_id,
            event_name: event_name.into(),
            event_type,
            payload,
            user_id: None,
            to_state: from_state.clone(),
            from_state,
            created_at: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// `true` once a processor has written a `to_state` different from
    /// `from_state`, i.e. the event has been applied.
    pub fn is_applied(&self) -> bool {
        self.to_state != self.from_state
    }
}

/// Transient projection of a [`WorkflowEvent`] onto the stream broker.
/// Decoded on the consumer side and validated against this fixed schema;
/// invalid envelopes are logged and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: Uuid,
    pub execution_id: Uuid,
    pub tenant: Tenant,
    pub event_type: EventType,
    pub event_name: String,
    pub payload: Value,
}

impl From<&WorkflowEvent> for StreamEvent {
    fn from(event: &WorkflowEvent) -> Self {
        Self {
            event_id: event.event_id,
            execution_id: event.execution_id,
            tenant: event.tenant.clone(),
            event_type: event.event_type,
            event_name: event.event_name.clone(),
            payload: event.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_event_starts_unapplied() {
        let event = WorkflowEvent::new(
            Tenant::new("t1"),
            Uuid::now_v7(),
            "approve",
            EventType::User,
            json!({"approved": true}),
            "pending_approval",
        );
        assert_eq!(event.from_state, event.to_state);
        assert!(!event.is_applied());
    }

    #[test]
    fn stream_event_projects_required_fields() {
        let event = WorkflowEvent::new(
            Tenant::new("t1"),
            Uuid::now_v7(),
            "ticket.created",
            EventType::System,
            json!({}),
            "initial",
        );
        let stream: StreamEvent = (&event).into();
        assert_eq!(stream.event_id, event.event_id);
        assert_eq!(stream.event_name, "ticket.created");
    }

    #[test]
    fn serde_round_trip_preserves_event_type() {
        let json = serde_json::to_string(&EventType::Workflow).unwrap();
        assert_eq!(json, "\"workflow\"");
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventType::Workflow);
    }
}
