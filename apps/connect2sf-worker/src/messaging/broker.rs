use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind, options::*};
use tracing::{debug, error, info};

/// One delivery as seen by the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub routing_key: String,
    pub content: Vec<u8>,
    pub correlation_id: Option<String>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        Self {
            routing_key: delivery.routing_key.as_str().to_string(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            content: delivery.data,
        }
    }
}

/// A message this worker publishes (dead letters).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Exchange, queue and bindings a consumer needs before it can receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_keys: Vec<String>,
    pub dead_letter_exchange: Option<String>,
}

impl Topology {
    /// Inspection queue bound to the dead-letter exchange.
    pub fn failed_queue(&self) -> String {
        format!("{}.failed", self.queue)
    }
}

pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, BrokerError>>;

/// The channel operations the consumption protocol relies on.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError>;

    async fn subscribe(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("AMQP operation failed: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Broker refused publish to exchange {exchange}")]
    PublishRejected { exchange: String },

    #[error("Channel unavailable: {0}")]
    Unavailable(String),
}

/// [`BrokerChannel`] backed by a lapin channel in confirm mode.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn inner(&self) -> &Channel {
        &self.channel
    }

    fn ensure_open(&self, operation: &str) -> Result<(), BrokerError> {
        require_open(self.channel.status().connected(), operation)
    }
}

/// Fails fast instead of handing lapin a frame for a closed channel.
fn require_open(connected: bool, operation: &str) -> Result<(), BrokerError> {
    if connected {
        Ok(())
    } else {
        Err(BrokerError::Unavailable(format!(
            "channel closed before {}",
            operation
        )))
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_declare(&topology.queue, durable_queue(), FieldTable::default())
            .await?;

        for routing_key in &topology.routing_keys {
            debug!(
                queue = %topology.queue,
                exchange = %topology.exchange,
                routing_key = %routing_key,
                "Binding queue"
            );
            self.channel
                .queue_bind(
                    &topology.queue,
                    &topology.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        if let Some(dlx) = &topology.dead_letter_exchange {
            let failed_queue = topology.failed_queue();
            self.channel
                .exchange_declare(
                    dlx,
                    ExchangeKind::Topic,
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await?;
            self.channel
                .queue_declare(&failed_queue, durable_queue(), FieldTable::default())
                .await?;
            self.channel
                .queue_bind(
                    &failed_queue,
                    dlx,
                    "#",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            bindings = ?topology.routing_keys,
            dead_letter_exchange = ?topology.dead_letter_exchange,
            "Queue topology configured"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue, "Failed to start consumer");
                BrokerError::from(e)
            })?;

        Ok(consumer
            .map(|delivery| delivery.map(InboundMessage::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>, BrokerError> {
        self.ensure_open("get")?;
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;
        Ok(message.map(|m| InboundMessage::from(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open("ack")?;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open("nack")?;
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.ensure_open("publish")?;
        let mut headers = FieldTable::default();
        for (key, value) in message.headers {
            headers.insert(key.into(), AMQPValue::LongString(value.into()));
        }

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(headers);
        if let Some(correlation_id) = message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::PublishRejected {
                exchange: exchange.to_string(),
            });
        }
        Ok(())
    }
}
