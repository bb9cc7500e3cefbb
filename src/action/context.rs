//! Action invocation context.

use uuid::Uuid;

use crate::model::Tenant;

/// Context passed to an [`super::Action`] body on every invocation.
///
/// Carries enough identity for the action to produce a deterministic
/// idempotency key itself (actions invoked directly through
/// [`super::ActionRegistry::execute`] rather than through a Workflow
/// Context proxy may not have one supplied) and for structured logging.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub tenant: Tenant,
    pub execution_id: Uuid,
    pub event_id: Option<Uuid>,
    pub action_name: String,
    pub idempotency_key: String,
}

impl ActionContext {
    pub fn new(
        tenant: Tenant,
        execution_id: Uuid,
        event_id: Option<Uuid>,
        action_name: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant,
            execution_id,
            event_id,
            action_name: action_name.into(),
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Default idempotency key shape when the caller supplies none:
    /// `execution_id-action-timestamp-nonce`. Not reproducible across
    /// re-spawns — only for actions invoked directly through
    /// [`super::ActionRegistry::execute`] outside a workflow body, where
    /// there is no call index to derive a stable key from.
    pub fn default_idempotency_key(execution_id: Uuid, action_name: &str) -> String {
        let nonce = Uuid::new_v4();
        format!(
            "{execution_id}-{action_name}-{timestamp}-{nonce}",
            timestamp = chrono::Utc::now().timestamp_millis()
        )
    }

    /// Deterministic idempotency key for a Workflow Context action proxy
    /// call: `execution_id-action_name-call_index`. Reproducible across a
    /// crash-and-replay re-spawn of the execute function, since the same
    /// call site always reaches the same `call_index` on every re-run.
    pub fn call_index_idempotency_key(execution_id: Uuid, action_name: &str, call_index: usize) -> String {
        format!("{execution_id}-{action_name}-{call_index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_idempotency_key_embeds_execution_and_action() {
        let execution_id = Uuid::now_v7();
        let key = ActionContext::default_idempotency_key(execution_id, "send_email");
        assert!(key.starts_with(&format!("{execution_id}-send_email-")));
    }

    #[test]
    fn call_index_idempotency_key_is_stable_across_calls() {
        let execution_id = Uuid::now_v7();
        let a = ActionContext::call_index_idempotency_key(execution_id, "send_email", 0);
        let b = ActionContext::call_index_idempotency_key(execution_id, "send_email", 0);
        assert_eq!(a, b);

        let c = ActionContext::call_index_idempotency_key(execution_id, "send_email", 1);
        assert_ne!(a, c);
    }

    #[test]
    fn context_carries_tenant_and_event() {
        let execution_id = Uuid::now_v7();
        let event_id = Uuid::now_v7();
        let ctx = ActionContext::new(
            Tenant::new("acme"),
            execution_id,
            Some(event_id),
            "send_email",
            "k1",
        );
        assert_eq!(ctx.tenant.as_str(), "acme");
        assert_eq!(ctx.event_id, Some(event_id));
    }
}
