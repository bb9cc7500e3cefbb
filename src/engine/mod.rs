//! Event sourcing engine.

mod sourcing;

pub use sourcing::{
    apply_event, fold, replay, ExecutionState, ExecutorError, ReplayOptions, SharedStateCache,
    StateCache, STATE_CACHE_TTL,
};
