use serde::{Deserialize, Serialize};

/// Classification of everything that can go wrong while turning one inbound
/// message into an acknowledgment decision.
///
/// Only [`ProcessingError::EmptyMessage`] is ever surfaced to a caller as an
/// `Err`; every other variant travels inside a [`Verdict`] next to the
/// decision it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessingError {
    /// A poll returned nothing. No broker interaction follows.
    EmptyMessage,

    /// No handler is registered for the routing key.
    UnknownRoutingKey { routing_key: String },

    /// Content is not JSON, or does not match the handler's schema.
    /// Redelivery can never fix it.
    MalformedPayload { reason: String },

    /// The event content violates a business rule (missing customer,
    /// duplicate lead, missing lead). Acknowledged and dropped.
    BusinessRuleViolation { reason: String },

    /// Infrastructure failure (network, 5xx, timeout). Redelivery may succeed.
    DownstreamFailure { reason: String },

    /// The handler panicked. Treated like a downstream failure.
    Unclassified { reason: String },
}

impl ProcessingError {
    pub fn unknown_routing_key(routing_key: impl Into<String>) -> Self {
        Self::UnknownRoutingKey {
            routing_key: routing_key.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub fn business_rule(reason: impl Into<String>) -> Self {
        Self::BusinessRuleViolation {
            reason: reason.into(),
        }
    }

    pub fn downstream(reason: impl Into<String>) -> Self {
        Self::DownstreamFailure {
            reason: reason.into(),
        }
    }

    pub fn unclassified(reason: impl Into<String>) -> Self {
        Self::Unclassified {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::EmptyMessage => "Empty message",
            Self::UnknownRoutingKey { routing_key } => routing_key,
            Self::MalformedPayload { reason }
            | Self::BusinessRuleViolation { reason }
            | Self::DownstreamFailure { reason }
            | Self::Unclassified { reason } => reason,
        }
    }

    /// Whether the failure is the caller's fault, so the delivery is consumed
    /// rather than handed back to the broker.
    pub fn should_acknowledge(&self) -> bool {
        matches!(
            self,
            Self::MalformedPayload { .. } | Self::BusinessRuleViolation { .. }
        )
    }

    /// Whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownstreamFailure { .. } | Self::Unclassified { .. }
        )
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::UnknownRoutingKey { .. } => "unknown_routing_key",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::BusinessRuleViolation { .. } => "business_rule_violation",
            Self::DownstreamFailure { .. } => "downstream_failure",
            Self::Unclassified { .. } => "unclassified",
        }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "Empty message. Ignoring"),
            Self::UnknownRoutingKey { routing_key } => {
                write!(f, "Unknown message type: {}", routing_key)
            }
            Self::MalformedPayload { reason } => write!(f, "Invalid message: {}", reason),
            Self::BusinessRuleViolation { reason } => {
                write!(f, "Unprocessable event: {}", reason)
            }
            Self::DownstreamFailure { reason } => write!(f, "Downstream failure: {}", reason),
            Self::Unclassified { reason } => write!(f, "Unclassified failure: {}", reason),
        }
    }
}

impl std::error::Error for ProcessingError {}

/// What happens to a delivery once processing is over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AckDecision {
    Ack,
    NackRequeue,
    NackDiscard,
    /// Publish the payload to the failure exchange, then ack.
    DeadLetter,
}

impl AckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::NackRequeue => "nack_requeue",
            Self::NackDiscard => "nack_discard",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for AckDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision together with the failure that caused it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: AckDecision,
    pub failure: Option<ProcessingError>,
}

impl Verdict {
    pub fn success() -> Self {
        Self {
            decision: AckDecision::Ack,
            failure: None,
        }
    }

    pub fn failed(decision: AckDecision, failure: ProcessingError) -> Self {
        Self {
            decision,
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}
