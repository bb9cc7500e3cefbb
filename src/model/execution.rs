//! Workflow Execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::Tenant;

/// Lifecycle status of a running workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Active)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A running (or terminated) instance of a workflow definition.
///
/// Invariant: `current_state` and `context_data` must always equal the
/// values derived by replaying the execution's events up to the latest
/// applied event. The runtime never writes these fields
/// directly outside of event application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub tenant: Tenant,
    pub workflow_name: String,
    pub workflow_version: String,
    pub current_state: String,
    pub status: ExecutionStatus,
    pub context_data: Map<String, Value>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        tenant: Tenant,
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::now_v7(),
            tenant,
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
            current_state: "initial".to_string(),
            status: ExecutionStatus::Active,
            context_data: Map::new(),
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}
