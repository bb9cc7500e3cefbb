//! Workflow runtime: definition registry, execute-function context,
//! and the start/enqueue/process/wait operations.

mod context;
mod definition;
mod engine;

pub use context::WorkflowContext;
pub use definition::{RegistrationLoader, WorkflowDefinition, WorkflowDefinitionRegistry, WorkflowFn};
pub use engine::{
    EnqueueResult, ProcessResult, RuntimeError, StartExecutionOptions, StartResult,
    SubmitEventOptions, WorkflowRuntime,
};
pub(crate) use engine::runtime_error_to_action_error;
