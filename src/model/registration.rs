//! Workflow Registration (external loader side).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Tenant;

/// One serialized version of a workflow definition as the registration
/// store persists it: metadata plus an execution function body (opaque to
/// the core — the host process resolves this to a registered closure by
/// `version`) and a version string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRegistrationVersion {
    pub version: String,
    pub definition_body: String,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a workflow registration as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Active,
    Archived,
}

/// A named workflow as tracked by the authoring surface. Created externally;
/// the runtime only reads it through [`crate::runtime::RegistrationLoader`]
/// when a definition isn't already resident in the in-memory registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRegistration {
    pub registration_id: uuid::Uuid,
    pub tenant: Tenant,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub status: RegistrationStatus,
    pub versions: Vec<WorkflowRegistrationVersion>,
}

impl WorkflowRegistration {
    /// The version marked `is_current`, if any.
    pub fn current_version(&self) -> Option<&WorkflowRegistrationVersion> {
        self.versions.iter().find(|v| v.is_current)
    }

    pub fn version(&self, version: &str) -> Option<&WorkflowRegistrationVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// A row of the `workflow_event_attachments` / `event_catalog` tables
/// : ties an externally-defined `event_type` to the workflow
/// registration that should be started when such an event arrives on the
/// global stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAttachment {
    pub tenant: Tenant,
    pub event_type: String,
    pub registration_id: uuid::Uuid,
    pub workflow_name: String,
    pub is_active: bool,
}
