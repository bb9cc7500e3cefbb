//! Compiled workflow definitions: a name-versioned registry of execute
//! functions, plus the external-loader seam for registrations that aren't
//! already in memory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::model::WorkflowRegistration;
use crate::persistence::StoreError;

use super::context::WorkflowContext;

/// An execute function body: runs to completion or suspends at
/// `events.waitFor`, driven entirely by the [`WorkflowContext`] it is given.
/// Modeled as a boxed async closure rather than a synchronous reducer so a
/// `.await` inside the body can genuinely suspend; see
/// [`super::engine::WorkflowRuntime`] for how recovery after a restart
/// re-spawns the closure and fast-forwards it via idempotent replay.
pub type WorkflowFn = Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// A compiled workflow: its name/version identity and its execute function.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub execute: WorkflowFn,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>, execute: WorkflowFn) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            execute,
        }
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

/// External loader consulted when the in-memory registry has no compiled
/// definition for a requested `(name, version)`. Out of scope in this core
/// (registration CRUD lives in the surrounding application); the default
/// `PersistenceStore::get_registration` returns `Ok(None)`, so by default no
/// loader is configured and an unknown name is simply an error.
#[async_trait]
pub trait RegistrationLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<WorkflowRegistration>, StoreError>;
}

/// In-memory `name -> version -> definition` registry (`registerWorkflow`/
/// `getDefinition`).
///
/// `current_version` tracks, per workflow name, which version was
/// registered most recently — a plain `HashMap<String, WorkflowDefinition>`
/// has no ordering of its own, so `.values().last()` would pick an
/// arbitrary entry instead of the actual latest registration.
#[derive(Default, Clone)]
pub struct WorkflowDefinitionRegistry {
    definitions: HashMap<String, HashMap<String, WorkflowDefinition>>,
    current_version: HashMap<String, String>,
}

impl WorkflowDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: WorkflowDefinition) {
        self.current_version.insert(definition.name.clone(), definition.version.clone());
        self.definitions
            .entry(definition.name.clone())
            .or_default()
            .insert(definition.version.clone(), definition);
    }

    /// Look up a definition by name, optionally pinned to `version`; absent
    /// a version, the one registered most recently under that name wins,
    /// resolved via `current_version` rather than iteration order.
    pub fn get(&self, name: &str, version: Option<&str>) -> Option<WorkflowDefinition> {
        let versions = self.definitions.get(name)?;
        match version {
            Some(v) => versions.get(v).cloned(),
            None => {
                let current = self.current_version.get(name)?;
                versions.get(current).cloned()
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_fn() -> WorkflowFn {
        Arc::new(|_ctx| Box::pin(async {}))
    }

    #[test]
    fn register_and_get_by_name_only() {
        let mut registry = WorkflowDefinitionRegistry::new();
        registry.register(WorkflowDefinition::new("approval", "1", noop_fn()));

        assert!(registry.contains("approval"));
        assert!(registry.get("approval", None).is_some());
        assert!(registry.get("missing", None).is_none());
    }

    #[test]
    fn get_with_no_version_always_resolves_the_most_recently_registered() {
        let mut registry = WorkflowDefinitionRegistry::new();
        registry.register(WorkflowDefinition::new("approval", "1", noop_fn()));
        registry.register(WorkflowDefinition::new("approval", "2", noop_fn()));
        registry.register(WorkflowDefinition::new("approval", "3", noop_fn()));

        for _ in 0..20 {
            assert_eq!(registry.get("approval", None).unwrap().version, "3");
        }
    }

    #[test]
    fn get_pinned_to_a_specific_version() {
        let mut registry = WorkflowDefinitionRegistry::new();
        registry.register(WorkflowDefinition::new("approval", "1", noop_fn()));
        registry.register(WorkflowDefinition::new("approval", "2", noop_fn()));

        let v1 = registry.get("approval", Some("1")).unwrap();
        assert_eq!(v1.version, "1");
        assert!(registry.get("approval", Some("3")).is_none());
    }
}
