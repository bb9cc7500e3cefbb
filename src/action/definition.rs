//! The `Action` trait and its error type.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::context::ActionContext;

/// Error returned from an action body.
///
/// Mirrors `ActivityError`: a message, an optional machine
/// classification, and a `retryable` flag the default
/// [`crate::reliability::ErrorClassifier`] uses as a strong signal (an
/// action that says it isn't retryable is never reclassified as
/// transient).
#[derive(Debug, Clone)]
pub struct ActionError {
    pub message: String,
    pub error_type: Option<String>,
    pub retryable: bool,
    pub details: Option<serde_json::Value>,
}

impl ActionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// A missing required parameter or similarly malformed invocation.
    /// Permanent: never retried.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Some("validation".to_string()),
            retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        ActionError::retryable(err.to_string())
    }
}

/// A named, strongly-typed action body. Registered into an
/// [`super::registry::ActionRegistry`] and invoked only through the
/// persisted-result protocol in [`super::registry::ActionRegistry::execute`].
#[async_trait]
pub trait Action: Send + Sync {
    const NAME: &'static str;
    type Input: Serialize + DeserializeOwned + Send;
    type Output: Serialize + DeserializeOwned + Send;

    async fn execute(
        &self,
        ctx: &ActionContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_constructors_set_retryable_flag() {
        assert!(ActionError::retryable("x").retryable);
        assert!(!ActionError::non_retryable("x").retryable);
        assert!(!ActionError::validation("missing field").retryable);
    }

    #[test]
    fn display_shows_message() {
        let err = ActionError::retryable("boom");
        assert_eq!(err.to_string(), "boom");
    }
}
