use async_trait::async_trait;
use serde_json::Value;
use tracing::Span;

use crate::contracts::ValidationError;

/// Business logic bound to one routing key.
///
/// Handlers never see the broker channel: the processor acks, nacks or
/// dead-letters the delivery according to the returned outcome.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Schema check run before dispatch. A failure here marks the payload as
    /// malformed and the delivery is acknowledged without calling `handle`.
    fn validate(&self, _payload: &Value) -> Result<(), ValidationError> {
        Ok(())
    }

    async fn handle(&self, ctx: &HandlerContext, payload: Value) -> Result<(), HandlerError>;
}

/// Failure returned by a handler. The variant carries the acknowledgment
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Caller's fault: the event can never be processed. Ack and drop.
    #[error("Unprocessable event (will not retry): {0}")]
    Unprocessable(String),

    /// System's fault: a dependency failed. Hand the delivery back.
    #[error("Downstream failure (will retry): {0}")]
    Downstream(String),
}

impl HandlerError {
    pub fn unprocessable(reason: impl Into<String>) -> Self {
        Self::Unprocessable(reason.into())
    }

    pub fn downstream(reason: impl Into<String>) -> Self {
        Self::Downstream(reason.into())
    }

    pub fn should_acknowledge(&self) -> bool {
        matches!(self, Self::Unprocessable(_))
    }
}

/// Per-message context handed to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub routing_key: String,
    /// Caller-supplied correlation id, or a generated one when absent.
    pub trace_id: String,
    pub delivery_tag: u64,
    pub span: Span,
}

impl HandlerContext {
    pub fn new(routing_key: &str, correlation_id: Option<&str>, delivery_tag: u64) -> Self {
        let trace_id = correlation_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!(
            "message",
            routing_key = %routing_key,
            trace_id = %trace_id,
            delivery_tag
        );

        Self {
            routing_key: routing_key.to_string(),
            trace_id,
            delivery_tag,
            span,
        }
    }
}
