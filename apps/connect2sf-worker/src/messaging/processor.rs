//! Turns one delivery into exactly one acknowledgment decision and applies
//! it to the channel.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tracing::{Instrument, debug, error, info, warn};

use super::broker::{BrokerChannel, BrokerError, InboundMessage, OutboundMessage};
use super::handler::{HandlerContext, HandlerError};
use super::registry::HandlerRegistry;
use crate::contracts::{AckDecision, ProcessingError, Verdict, failed_routing_key};
use crate::metrics::Metrics;
use crate::telemetry::panic_message;

const SIGNATURE: &str = "MessageProcessor#process";
const ERROR_TYPE_HEADER: &str = "x-error-type";
const ERROR_REASON_HEADER: &str = "x-error-reason";
const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";

/// What to do with a delivery whose handler hit an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownstreamFailurePolicy {
    /// Hand the delivery back to the queue for another attempt.
    #[default]
    Requeue,
    /// Park it on the failure exchange so a degraded dependency is not
    /// hammered with redeliveries.
    DeadLetter,
}

/// What to do with a delivery nobody registered a handler for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownRoutingKeyPolicy {
    #[default]
    Discard,
    DeadLetter,
}

impl FromStr for DownstreamFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "requeue" => Ok(Self::Requeue),
            "dead-letter" | "dead_letter" | "deadletter" => Ok(Self::DeadLetter),
            other => Err(format!("expected requeue or dead-letter, got {:?}", other)),
        }
    }
}

impl FromStr for UnknownRoutingKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "dead-letter" | "dead_letter" | "deadletter" => Ok(Self::DeadLetter),
            other => Err(format!("expected discard or dead-letter, got {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorPolicy {
    pub downstream_failure: DownstreamFailurePolicy,
    pub unknown_routing_key: UnknownRoutingKeyPolicy,
    pub dead_letter_exchange: String,
}

impl ProcessorPolicy {
    pub fn new(dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            downstream_failure: DownstreamFailurePolicy::default(),
            unknown_routing_key: UnknownRoutingKeyPolicy::default(),
            dead_letter_exchange: dead_letter_exchange.into(),
        }
    }

    /// Whether any outcome can end up on the failure exchange.
    pub fn uses_dead_letter(&self) -> bool {
        self.downstream_failure == DownstreamFailurePolicy::DeadLetter
            || self.unknown_routing_key == UnknownRoutingKeyPolicy::DeadLetter
    }

    fn on_downstream_failure(&self) -> AckDecision {
        match self.downstream_failure {
            DownstreamFailurePolicy::Requeue => AckDecision::NackRequeue,
            DownstreamFailurePolicy::DeadLetter => AckDecision::DeadLetter,
        }
    }

    fn on_unknown_routing_key(&self) -> AckDecision {
        match self.unknown_routing_key {
            UnknownRoutingKeyPolicy::Discard => AckDecision::NackDiscard,
            UnknownRoutingKeyPolicy::DeadLetter => AckDecision::DeadLetter,
        }
    }
}

/// The verdict that was actually applied to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub delivery_tag: u64,
    pub verdict: Verdict,
    /// False when the channel rejected the ack/nack. The broker redelivers
    /// such messages once the channel closes.
    pub settled: bool,
}

pub struct MessageProcessor {
    registry: Arc<HandlerRegistry>,
    policy: ProcessorPolicy,
    metrics: Arc<Metrics>,
}

impl MessageProcessor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        policy: ProcessorPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            policy,
            metrics,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ProcessorPolicy {
        &self.policy
    }

    /// Classifies `message` and settles it on `channel`.
    ///
    /// The only error is [`ProcessingError::EmptyMessage`], returned without
    /// touching the channel when there is nothing to process.
    pub async fn process(
        &self,
        channel: &dyn BrokerChannel,
        message: Option<InboundMessage>,
    ) -> Result<Disposition, ProcessingError> {
        let Some(message) = message else {
            debug!("Empty message. Ignoring");
            return Err(ProcessingError::EmptyMessage);
        };

        let start = Instant::now();
        let verdict = self.classify(&message).await;
        let disposition = self.settle(channel, &message, verdict).await;

        self.metrics.record_settlement(
            &message.routing_key,
            disposition.verdict.decision,
            disposition.verdict.failure.as_ref(),
            start.elapsed().as_secs_f64(),
        );
        Ok(disposition)
    }

    /// Resolves the handler, decodes and validates the payload, runs the
    /// handler and maps the outcome to a decision. A panic anywhere in that
    /// pipeline becomes an unclassified failure.
    pub async fn classify(&self, message: &InboundMessage) -> Verdict {
        let ctx = HandlerContext::new(
            &message.routing_key,
            message.correlation_id.as_deref(),
            message.delivery_tag,
        );
        debug!(
            parent: &ctx.span,
            redelivered = message.redelivered,
            payload_size = message.content.len(),
            "Consuming message"
        );

        let verdict = match AssertUnwindSafe(self.run_handler(&ctx, message))
            .catch_unwind()
            .instrument(ctx.span.clone())
            .await
        {
            Ok(verdict) => verdict,
            Err(panic) => Verdict::failed(
                self.policy.on_downstream_failure(),
                ProcessingError::unclassified(panic_message(&*panic)),
            ),
        };
        log_verdict(&ctx, &verdict);
        verdict
    }

    async fn run_handler(&self, ctx: &HandlerContext, message: &InboundMessage) -> Verdict {
        let Some(handler) = self.registry.resolve(&message.routing_key) else {
            return Verdict::failed(
                self.policy.on_unknown_routing_key(),
                ProcessingError::unknown_routing_key(&message.routing_key),
            );
        };

        let payload: Value = match serde_json::from_slice(&message.content) {
            Ok(payload) => payload,
            Err(e) => {
                return Verdict::failed(AckDecision::Ack, ProcessingError::malformed(e.to_string()));
            }
        };

        if let Err(e) = handler.validate(&payload) {
            return Verdict::failed(AckDecision::Ack, ProcessingError::malformed(e.to_string()));
        }

        match handler.handle(ctx, payload).await {
            Ok(()) => Verdict::success(),
            Err(HandlerError::Unprocessable(reason)) => {
                Verdict::failed(AckDecision::Ack, ProcessingError::business_rule(reason))
            }
            Err(HandlerError::Downstream(reason)) => Verdict::failed(
                self.policy.on_downstream_failure(),
                ProcessingError::downstream(reason),
            ),
        }
    }

    /// Applies `verdict` to the channel. A dead letter that cannot be
    /// published is requeued instead.
    pub async fn settle(
        &self,
        channel: &dyn BrokerChannel,
        message: &InboundMessage,
        verdict: Verdict,
    ) -> Disposition {
        let delivery_tag = message.delivery_tag;

        let (verdict, result) = match verdict.decision {
            AckDecision::Ack => {
                let result = channel.ack(delivery_tag).await;
                (verdict, result)
            }
            AckDecision::NackRequeue => {
                let result = channel.nack(delivery_tag, true).await;
                (verdict, result)
            }
            AckDecision::NackDiscard => {
                let result = channel.nack(delivery_tag, false).await;
                (verdict, result)
            }
            AckDecision::DeadLetter => match self.dead_letter(channel, message, &verdict).await {
                Ok(()) => {
                    let result = channel.ack(delivery_tag).await;
                    (verdict, result)
                }
                Err(e) => {
                    error!(
                        signature = SIGNATURE,
                        delivery_tag,
                        error = %e,
                        "Failed to publish dead letter, requeueing instead"
                    );
                    let result = channel.nack(delivery_tag, true).await;
                    let verdict = Verdict {
                        decision: AckDecision::NackRequeue,
                        failure: verdict.failure,
                    };
                    (verdict, result)
                }
            },
        };

        let settled = match result {
            Ok(()) => true,
            Err(e) => {
                error!(
                    signature = SIGNATURE,
                    delivery_tag,
                    decision = %verdict.decision,
                    error = %e,
                    "Failed to settle message"
                );
                false
            }
        };

        Disposition {
            delivery_tag,
            verdict,
            settled,
        }
    }

    async fn dead_letter(
        &self,
        channel: &dyn BrokerChannel,
        message: &InboundMessage,
        verdict: &Verdict,
    ) -> Result<(), BrokerError> {
        let routing_key = failed_routing_key(&message.routing_key);

        let mut headers = BTreeMap::new();
        headers.insert(
            ORIGINAL_ROUTING_KEY_HEADER.to_string(),
            message.routing_key.clone(),
        );
        if let Some(failure) = &verdict.failure {
            headers.insert(ERROR_TYPE_HEADER.to_string(), failure.error_type().to_string());
            headers.insert(ERROR_REASON_HEADER.to_string(), failure.reason().to_string());
        }

        channel
            .publish(
                &self.policy.dead_letter_exchange,
                &routing_key,
                OutboundMessage {
                    payload: message.content.clone(),
                    correlation_id: message.correlation_id.clone(),
                    headers,
                },
            )
            .await?;

        info!(
            delivery_tag = message.delivery_tag,
            exchange = %self.policy.dead_letter_exchange,
            routing_key = %routing_key,
            "Message sent to failure exchange"
        );
        Ok(())
    }
}

fn log_verdict(ctx: &HandlerContext, verdict: &Verdict) {
    let decision = verdict.decision;
    match &verdict.failure {
        None => info!(
            parent: &ctx.span,
            signature = SIGNATURE,
            %decision,
            "Message processed successfully"
        ),
        Some(failure) if failure.should_acknowledge() => warn!(
            parent: &ctx.span,
            signature = SIGNATURE,
            %decision,
            error_type = failure.error_type(),
            error = %failure,
            "Unprocessable event, acknowledging"
        ),
        Some(failure) => error!(
            parent: &ctx.span,
            signature = SIGNATURE,
            %decision,
            error_type = failure.error_type(),
            retryable = failure.is_retryable(),
            error = %failure,
            "Message processing failed"
        ),
    }
}
