//! [`StreamClient`] contract: at-least-once publish/consume over a named
//! stream with consumer-group semantics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{EventType, StreamEvent, Tenant};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream connection error: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// A delivered stream entry: the decoded payload plus the broker-assigned id
/// a [`StreamClient::ack`] call needs to acknowledge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    pub message_id: String,
    pub event_id: Uuid,
    pub execution_id: Uuid,
    pub tenant: Tenant,
    pub event_type: EventType,
    pub event_name: String,
    pub payload: serde_json::Value,
}

impl StreamMessage {
    pub fn from_stream_event(message_id: impl Into<String>, event: &StreamEvent) -> Self {
        Self {
            message_id: message_id.into(),
            event_id: event.event_id,
            execution_id: event.execution_id,
            tenant: event.tenant.clone(),
            event_type: event.event_type,
            event_name: event.event_name.clone(),
            payload: event.payload.clone(),
        }
    }
}

/// Handler invoked for each delivery from [`StreamClient::register_consumer`].
/// Returning `Ok(())` acks the message; returning `Err` leaves it unacked for
/// redelivery after the idle timeout, or via claim-of-abandoned-entries.
pub type ConsumerHandler =
    std::sync::Arc<dyn Fn(StreamMessage) -> futures::future::BoxFuture<'static, Result<(), StreamError>> + Send + Sync>;

/// Broker client abstraction for the single global stream
/// (`workflow:events:global`, group `workflow-workers`).
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Connect once. Idempotent: calling twice is a no-op.
    async fn initialize(&self) -> Result<(), StreamError>;

    /// Create `group` on `stream` (with MKSTREAM), treating "already exists"
    /// as success. Implementations should remember per-process that the
    /// group exists to avoid repeat round trips.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// XADD-equivalent: append `event` to `stream`, returning the
    /// broker-assigned message id.
    async fn publish(&self, stream: &str, event: &StreamEvent) -> Result<String, StreamError>;

    /// Start a background consumer loop reading `stream` under `group` as
    /// `consumer_name`, invoking `handler` for each delivery.
    async fn register_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer_name: &str,
        handler: ConsumerHandler,
    ) -> Result<(), StreamError>;

    /// Stop the background consumer loop started by `register_consumer`.
    async fn stop_consumer(&self) -> Result<(), StreamError>;

    /// Release connections. Called once during graceful shutdown.
    async fn close(&self) -> Result<(), StreamError>;
}
