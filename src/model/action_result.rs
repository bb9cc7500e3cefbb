//! Action Result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Tenant;

/// The persisted outcome of one action invocation, keyed by
/// `(execution_id, event_id, action_name, idempotency_key)`, which must be
/// unique. A second invocation with the same idempotency key returns this
/// row's `result` without re-running the action body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub result_id: Uuid,
    pub tenant: Tenant,
    pub execution_id: Uuid,
    pub event_id: Option<Uuid>,
    pub action_name: String,
    pub idempotency_key: String,
    pub parameters: Value,
    pub ready_to_execute: bool,
    pub success: Option<bool>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActionResult {
    pub fn pending(
        tenant: Tenant,
        execution_id: Uuid,
        event_id: Option<Uuid>,
        action_name: impl Into<String>,
        idempotency_key: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            result_id: Uuid::now_v7(),
            tenant,
            execution_id,
            event_id,
            action_name: action_name.into(),
            idempotency_key: idempotency_key.into(),
            parameters,
            ready_to_execute: true,
            success: None,
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.success.is_some()
    }
}
