//! Crate-wide error taxonomy.
//!
//! Every component has its own narrow error enum (`StoreError`, `StreamError`,
//! `LockError`, `ActionError`, ...); this `EngineError` is the cross-cutting
//! classification this system needs, with `#[from]` conversions so callers
//! at the runtime/worker boundary can collapse everything to one type
//! without losing the original error as a source.

use uuid::Uuid;

use crate::action::{ActionError, RegistryError};
use crate::engine::ExecutorError;
use crate::lock::LockError;
use crate::persistence::StoreError;
use crate::stream::StreamError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing or invalid configuration at startup. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker unreachable, lock service unavailable, transient persistence
    /// errors. Retried with backoff at the layer that owns the retry.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Unknown workflow name/version, unknown event, unknown execution.
    /// Surfaced to the caller; never silently recovered.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate event_id on enqueue is idempotent success and is not
    /// represented as an error; a duplicate processing_id is an invariant
    /// violation and fatal to the task that observes it.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing required action parameter or malformed stream envelope.
    /// Permanent; the offending record is marked failed and not retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Thrown by an action body or execute function; classified by
    /// [`crate::reliability::ErrorClassifier`] and either retried or marked
    /// failed.
    #[error("executor error: {0}")]
    Executor(String),

    /// Failure to acquire the per-event lock. The current task returns
    /// without side effects so the scan can reconsider later.
    #[error("lock contention on {key}")]
    LockContention { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Sourcing(#[from] ExecutorError),
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::NotAcquired { key } => EngineError::LockContention { key },
            other => EngineError::TransientInfra(other.to_string()),
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownAction(name) => EngineError::NotFound(format!("action: {name}")),
            RegistryError::Action(_, e) => EngineError::Action(e),
            RegistryError::Store(e) => EngineError::Store(e),
        }
    }
}

/// Errors surfaced while loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for environment variable {name}: {value}")]
    InvalidVar { name: String, value: String },
}

/// A named execution error identity, used when an [`EngineError`] needs to
/// reference the execution it occurred in without taking ownership of it.
pub fn not_found_execution(execution_id: Uuid) -> EngineError {
    EngineError::NotFound(format!("execution not found: {execution_id}"))
}
