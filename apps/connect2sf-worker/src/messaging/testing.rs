//! In-memory broker channel and handlers for protocol tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use super::broker::{
    BrokerChannel, BrokerError, DeliveryStream, InboundMessage, OutboundMessage, Topology,
};
use super::handler::{EventHandler, HandlerContext, HandlerError};
use crate::contracts::ValidationError;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    DeclareTopology(Topology),
    Subscribe { queue: String },
    Get { queue: String },
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
    Publish {
        exchange: String,
        routing_key: String,
        message: OutboundMessage,
    },
}

#[derive(Default)]
pub struct RecordingChannel {
    calls: Mutex<Vec<BrokerCall>>,
    queue: Mutex<VecDeque<InboundMessage>>,
    subscription: Mutex<Option<Vec<InboundMessage>>>,
    fail_publish: AtomicBool,
    fail_settlement: AtomicBool,
    fail_get: AtomicBool,
}

impl RecordingChannel {
    /// Messages served one at a time by `get`.
    pub fn with_queue(messages: Vec<InboundMessage>) -> Self {
        let channel = Self::default();
        *channel.queue.lock().unwrap() = messages.into();
        channel
    }

    /// Messages pushed through `subscribe`; the stream ends after the last one.
    /// Without a subscription the stream stays open until dropped.
    pub fn with_subscription(messages: Vec<InboundMessage>) -> Self {
        let channel = Self::default();
        *channel.subscription.lock().unwrap() = Some(messages);
        channel
    }

    pub fn failing_publish(self) -> Self {
        self.fail_publish.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_settlement(self) -> Self {
        self.fail_settlement.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_get(self) -> Self {
        self.fail_get.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Ack/nack calls only, sorted by delivery tag.
    pub fn settlements(&self) -> Vec<BrokerCall> {
        let mut settlements: Vec<BrokerCall> = self
            .calls()
            .into_iter()
            .filter(|call| matches!(call, BrokerCall::Ack(_) | BrokerCall::Nack { .. }))
            .collect();
        settlements.sort_by_key(|call| match call {
            BrokerCall::Ack(tag) => *tag,
            BrokerCall::Nack { delivery_tag, .. } => *delivery_tag,
            _ => 0,
        });
        settlements
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn record(&self, call: BrokerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn settlement_result(&self) -> Result<(), BrokerError> {
        if self.fail_settlement.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("channel closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.record(BrokerCall::DeclareTopology(topology.clone()));
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.record(BrokerCall::Subscribe {
            queue: queue.to_string(),
        });
        match self.subscription.lock().unwrap().take() {
            Some(messages) => Ok(futures::stream::iter(
                messages
                    .into_iter()
                    .map(Ok::<InboundMessage, BrokerError>),
            )
            .boxed()),
            None => Ok(futures::stream::pending::<Result<InboundMessage, BrokerError>>().boxed()),
        }
    }

    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>, BrokerError> {
        self.record(BrokerCall::Get {
            queue: queue.to_string(),
        });
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("get failed".to_string()));
        }
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.record(BrokerCall::Ack(delivery_tag));
        self.settlement_result()
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.record(BrokerCall::Nack {
            delivery_tag,
            requeue,
        });
        self.settlement_result()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishRejected {
                exchange: exchange.to_string(),
            });
        }
        self.record(BrokerCall::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        });
        Ok(())
    }
}

pub fn message(delivery_tag: u64, routing_key: &str, content: &str) -> InboundMessage {
    InboundMessage {
        routing_key: routing_key.to_string(),
        content: content.as_bytes().to_vec(),
        correlation_id: Some("unit-tests".to_string()),
        delivery_tag,
        redelivered: false,
    }
}

/// Requires an `id`; fails according to the payload's `fail` field.
pub struct ScriptedHandler;

#[async_trait]
impl EventHandler for ScriptedHandler {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        if payload.get("fail").and_then(Value::as_str) == Some("panic-in-validate") {
            panic!("scripted validation panic");
        }
        if payload.get("id").is_none() {
            return Err(ValidationError::MissingField("id".to_string()));
        }
        Ok(())
    }

    async fn handle(&self, _ctx: &HandlerContext, payload: Value) -> Result<(), HandlerError> {
        match payload.get("fail").and_then(Value::as_str) {
            Some("unprocessable") => Err(HandlerError::unprocessable("scripted business failure")),
            Some("downstream") => Err(HandlerError::downstream("scripted outage")),
            Some("panic") => panic!("scripted panic"),
            _ => Ok(()),
        }
    }
}
