//! Type-erased action registry.
//!
//! Mirrors the registry-of-factories shape used for workflow registration:
//! callers register a strongly-typed [`Action`] once at startup, and the
//! runtime/worker invoke it later by name with JSON input, without knowing
//! the concrete type. `execute` additionally implements the persisted-result
//! protocol: a call with an idempotency key already on file returns the
//! stored result instead of re-running the action body.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::ActionResult;
use crate::persistence::{IsolationLevel, PersistenceStore, StoreError, TransactionHandle};

use super::context::ActionContext;
use super::definition::{Action, ActionError};

/// Type-erased action interface the registry stores.
#[async_trait]
trait AnyAction: Send + Sync {
    async fn invoke(&self, ctx: &ActionContext, input: Value) -> Result<Value, ActionError>;
}

struct ActionAdapter<A: Action> {
    inner: A,
}

#[async_trait]
impl<A: Action> AnyAction for ActionAdapter<A> {
    async fn invoke(&self, ctx: &ActionContext, input: Value) -> Result<Value, ActionError> {
        let typed_input: A::Input = serde_json::from_value(input).map_err(|e| {
            ActionError::validation(format!("invalid input for {}: {e}", A::NAME))
        })?;
        let output = self.inner.execute(ctx, typed_input).await?;
        serde_json::to_value(output)
            .map_err(|e| ActionError::non_retryable(format!("failed to serialize output: {e}")))
    }
}

/// Type-erased transactional action interface: the executor gets an open
/// transaction handle and the transaction commits iff it returns `Ok`.
#[async_trait]
trait AnyTransactionalAction: Send + Sync {
    async fn invoke(
        &self,
        ctx: &ActionContext,
        input: Value,
        txn: &mut dyn TransactionHandle,
    ) -> Result<Value, ActionError>;

    fn isolation(&self) -> IsolationLevel;
}

/// Executor body registered via [`ActionRegistry::register_transactional`].
pub type TransactionalFn = Arc<
    dyn Fn(
            ActionContext,
            Value,
            &mut dyn TransactionHandle,
        ) -> futures::future::BoxFuture<'_, Result<Value, ActionError>>
        + Send
        + Sync,
>;

struct TransactionalAdapter {
    isolation: IsolationLevel,
    body: TransactionalFn,
}

#[async_trait]
impl AnyTransactionalAction for TransactionalAdapter {
    async fn invoke(
        &self,
        ctx: &ActionContext,
        input: Value,
        txn: &mut dyn TransactionHandle,
    ) -> Result<Value, ActionError> {
        (self.body)(ctx.clone(), input, txn).await
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

/// Errors surfaced directly by the registry, distinct from [`ActionError`]
/// (which comes from the action body itself).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action {0} failed: {1}")]
    Action(String, #[source] ActionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registry of action implementations, keyed by [`Action::NAME`].
///
/// `execute` implements the persisted-result protocol:
/// a lookup by `(execution_id, action_name, idempotency_key)` that already
/// has a completed row returns it unchanged; otherwise a pending row is
/// inserted, the action body runs, and the row is completed with the
/// outcome. Two concurrent callers racing the same idempotency key both
/// attempt the insert; the store's uniqueness guarantee ensures only one
/// invocation actually runs the body.
pub struct ActionRegistry {
    store: Arc<dyn PersistenceStore>,
    actions: HashMap<String, Arc<dyn AnyAction>>,
    transactional: HashMap<String, Arc<dyn AnyTransactionalAction>>,
}

impl ActionRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            store,
            actions: HashMap::new(),
            transactional: HashMap::new(),
        }
    }

    /// Register a plain action implementation.
    pub fn register<A: Action + 'static>(&mut self, action: A) {
        self.actions
            .insert(A::NAME.to_string(), Arc::new(ActionAdapter { inner: action }));
    }

    /// Register a transactional action body. `isolation` is the level
    /// requested for the transaction handle passed to `body` on every
    /// invocation; the transaction commits iff `body` returns `Ok`.
    pub fn register_transactional(
        &mut self,
        name: impl Into<String>,
        isolation: IsolationLevel,
        body: TransactionalFn,
    ) {
        self.transactional
            .insert(name.into(), Arc::new(TransactionalAdapter { isolation, body }));
    }

    /// List all registered action names (plain and transactional).
    pub fn list(&self) -> Vec<&str> {
        self.actions
            .keys()
            .chain(self.transactional.keys())
            .map(|s| s.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name) || self.transactional.contains_key(name)
    }

    /// Execute a registered action under the persisted-result protocol.
    ///
    /// Returns the stored output on a repeat call with the same
    /// `ctx.idempotency_key`; otherwise invokes the action body (inside an
    /// open transaction, for actions registered via
    /// [`Self::register_transactional`]) and persists the outcome before
    /// returning it.
    pub async fn execute(&self, ctx: &ActionContext, input: Value) -> Result<Value, RegistryError> {
        if let Some(existing) = self
            .store
            .find_action_result(&ctx.tenant, ctx.execution_id, &ctx.action_name, &ctx.idempotency_key)
            .await?
        {
            if let Some(success) = existing.success {
                if success {
                    return Ok(existing.result.unwrap_or(Value::Null));
                }
                return Err(RegistryError::Action(
                    ctx.action_name.clone(),
                    ActionError::retryable(
                        existing
                            .error_message
                            .unwrap_or_else(|| "action previously failed".to_string()),
                    ),
                ));
            }
            // A pending row from a concurrent/crashed attempt: fall through
            // and retry the invocation rather than wait indefinitely.
        } else {
            let pending = ActionResult::pending(
                ctx.tenant.clone(),
                ctx.execution_id,
                ctx.event_id,
                ctx.action_name.clone(),
                ctx.idempotency_key.clone(),
                input.clone(),
            );
            self.store.insert_action_result(pending).await?;
        }

        let outcome = if let Some(txn_action) = self.transactional.get(&ctx.action_name) {
            self.execute_transactional(ctx, input, txn_action.as_ref()).await
        } else if let Some(action) = self.actions.get(&ctx.action_name) {
            action.invoke(ctx, input).await
        } else {
            return Err(RegistryError::UnknownAction(ctx.action_name.clone()));
        };

        self.persist_outcome(ctx, &outcome).await?;

        outcome.map_err(|e| RegistryError::Action(ctx.action_name.clone(), e))
    }

    async fn execute_transactional(
        &self,
        ctx: &ActionContext,
        input: Value,
        txn_action: &dyn AnyTransactionalAction,
    ) -> Result<Value, ActionError> {
        let key = format!("workflow:{}", ctx.execution_id);
        let mut handle = self
            .store
            .begin_transaction(&key, txn_action.isolation())
            .await
            .map_err(|e| ActionError::retryable(e.to_string()))?;

        match txn_action.invoke(ctx, input, handle.as_mut()).await {
            Ok(value) => {
                handle
                    .commit()
                    .await
                    .map_err(|e| ActionError::retryable(e.to_string()))?;
                Ok(value)
            }
            Err(e) => {
                let _ = handle.rollback().await;
                Err(e)
            }
        }
    }

    async fn persist_outcome(
        &self,
        ctx: &ActionContext,
        outcome: &Result<Value, ActionError>,
    ) -> Result<(), StoreError> {
        let existing = self
            .store
            .find_action_result(&ctx.tenant, ctx.execution_id, &ctx.action_name, &ctx.idempotency_key)
            .await?;
        let Some(existing) = existing else {
            return Ok(());
        };
        match outcome {
            Ok(value) => {
                self.store
                    .complete_action_result(&ctx.tenant, existing.result_id, true, Some(value.clone()), None)
                    .await
            }
            Err(e) => {
                self.store
                    .complete_action_result(
                        &ctx.tenant,
                        existing.result_id,
                        false,
                        None,
                        Some(e.message.clone()),
                    )
                    .await
            }
        }
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("transactional", &self.transactional.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tenant;
    use crate::persistence::InMemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DoubleInput {
        n: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct DoubleOutput {
        result: i64,
    }

    struct DoubleAction;

    #[async_trait]
    impl Action for DoubleAction {
        const NAME: &'static str = "double";
        type Input = DoubleInput;
        type Output = DoubleOutput;

        async fn execute(
            &self,
            _ctx: &ActionContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActionError> {
            Ok(DoubleOutput { result: input.n * 2 })
        }
    }

    fn ctx(execution_id: uuid::Uuid, key: &str) -> ActionContext {
        ActionContext::new(Tenant::new("acme"), execution_id, None, "double", key)
    }

    #[tokio::test]
    async fn executes_registered_action_and_persists_result() {
        let store: Arc<dyn crate::persistence::PersistenceStore> = Arc::new(InMemoryStore::default());
        let mut registry = ActionRegistry::new(store.clone());
        registry.register(DoubleAction);

        let execution_id = uuid::Uuid::now_v7();
        let c = ctx(execution_id, "k1");
        let out = registry
            .execute(&c, serde_json::json!({ "n": 21 }))
            .await
            .expect("action should succeed");
        assert_eq!(out, serde_json::json!({ "result": 42 }));

        let stored = store
            .find_action_result(&c.tenant, execution_id, "double", "k1")
            .await
            .unwrap()
            .expect("result should be persisted");
        assert_eq!(stored.success, Some(true));
    }

    #[tokio::test]
    async fn repeat_call_with_same_idempotency_key_short_circuits() {
        let store: Arc<dyn crate::persistence::PersistenceStore> = Arc::new(InMemoryStore::default());
        let mut registry = ActionRegistry::new(store.clone());
        registry.register(DoubleAction);

        let execution_id = uuid::Uuid::now_v7();
        let c = ctx(execution_id, "k1");
        registry.execute(&c, serde_json::json!({ "n": 5 })).await.unwrap();
        let second = registry
            .execute(&c, serde_json::json!({ "n": 999 }))
            .await
            .unwrap();

        // Second call returns the first call's stored result, not a
        // re-run against the new input.
        assert_eq!(second, serde_json::json!({ "result": 10 }));
    }

    #[tokio::test]
    async fn unknown_action_is_an_error() {
        let store: Arc<dyn crate::persistence::PersistenceStore> = Arc::new(InMemoryStore::default());
        let registry = ActionRegistry::new(store);
        let execution_id = uuid::Uuid::now_v7();
        let c = ActionContext::new(Tenant::new("acme"), execution_id, None, "missing", "k1");
        let err = registry.execute(&c, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownAction(_)));
    }
}
