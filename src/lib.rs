//! # Workflow Engine
//!
//! A PostgreSQL- and Redis-backed durable workflow engine: event-sourced
//! executions, idempotent action invocation, at-least-once event delivery,
//! and a worker service that claims and applies queued events.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowRuntime                          │
//! │  (starts executions, enqueues/applies events, replay)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PersistenceStore                           │
//! │  (PostgreSQL: executions, events, processing records)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerService                            │
//! │  (claims processing rows, applies them, reports health)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod lock;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod runtime;
pub mod stream;
pub mod worker;

/// Common imports for a host process wiring this crate together.
pub mod prelude {
    pub use crate::action::{Action, ActionContext, ActionError, ActionRegistry, RegistryError};
    pub use crate::config::{init_tracing, Config};
    pub use crate::engine::{ExecutionState, ExecutorError, ReplayOptions};
    pub use crate::error::EngineError;
    pub use crate::health::{HealthSnapshot, HealthState, HealthStatus};
    pub use crate::lock::{DistributedLock, LockError, LockOptions, RedisLock};
    pub use crate::model::{
        EventProcessingRecord, EventType, ExecutionStatus, ProcessingStatus, StreamEvent, Tenant,
        WorkflowEvent, WorkflowExecution,
    };
    pub use crate::persistence::{InMemoryStore, PersistenceStore, PostgresStore, StoreError};
    pub use crate::reliability::{CircuitBreakerConfig, ErrorClassifier, RetryPolicy};
    pub use crate::runtime::{
        StartExecutionOptions, SubmitEventOptions, WorkflowContext, WorkflowDefinition,
        WorkflowRuntime,
    };
    pub use crate::stream::{RedisStreamClient, StreamClient, StreamError};
    pub use crate::worker::{WorkerConfig, WorkerService, WorkerServiceError};
}

pub use error::EngineError;
pub use runtime::WorkflowRuntime;
