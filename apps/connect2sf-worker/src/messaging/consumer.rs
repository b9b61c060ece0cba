use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::broker::{BrokerChannel, BrokerError, Topology};
use super::processor::{Disposition, MessageProcessor};
use crate::contracts::ProcessingError;
use crate::metrics::Metrics;

/// Long-lived subscription that feeds every delivery through the
/// [`MessageProcessor`].
pub struct Consumer {
    channel: Arc<dyn BrokerChannel>,
    processor: Arc<MessageProcessor>,
    topology: Topology,
    consumer_tag: String,
    shutdown: Arc<Notify>,
    drain_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Consumer {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        processor: Arc<MessageProcessor>,
        exchange: String,
        queue: String,
        consumer_tag: String,
        shutdown: Arc<Notify>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let topology = topology_for(&processor, exchange, queue);
        Self {
            channel,
            processor,
            topology,
            consumer_tag,
            shutdown,
            drain_timeout: Duration::from_secs(5),
            metrics,
        }
    }

    /// How long in-flight deliveries may keep running after shutdown.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declares exchange and queue and binds every routing key currently in
    /// the registry. Handlers registered later need this to run again.
    pub async fn setup_topology(&self) -> Result<(), ConsumerError> {
        self.channel
            .declare_topology(&self.topology)
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.topology.queue, "Failed to declare topology");
                ConsumerError::SetupFailed(e)
            })
    }

    pub async fn start(self) -> Result<(), ConsumerError> {
        info!(
            queue = %self.topology.queue,
            consumer_tag = %self.consumer_tag,
            "Starting RabbitMQ consumer"
        );

        let mut deliveries = self
            .channel
            .subscribe(&self.topology.queue, &self.consumer_tag)
            .await
            .map_err(ConsumerError::ConsumeFailed)?;
        info!(
            queue = %self.topology.queue,
            consumer_tag = %self.consumer_tag,
            "Consumer started successfully"
        );

        self.metrics.active_consumers.inc();
        let mut in_flight: JoinSet<Result<Disposition, ProcessingError>> =
            JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(
                        consumer_tag = %self.consumer_tag,
                        "Shutdown signal received, stopping consumer"
                    );
                    break;
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_result(joined);
                }

                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(message)) => {
                            let channel = self.channel.clone();
                            let processor = self.processor.clone();
                            in_flight.spawn(async move {
                                processor.process(channel.as_ref(), Some(message)).await
                            });
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Error receiving message from RabbitMQ");
                        }
                        None => {
                            warn!("Consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }

        drop(deliveries);
        self.drain(&mut in_flight).await;

        self.metrics.active_consumers.dec();
        info!(consumer_tag = %self.consumer_tag, "Consumer stopped");
        Ok(())
    }

    /// Best effort: anything still unsettled when the timeout hits is
    /// redelivered by the broker once the connection closes.
    async fn drain(
        &self,
        in_flight: &mut JoinSet<Result<Disposition, ProcessingError>>,
    ) {
        if in_flight.is_empty() {
            return;
        }
        info!(in_flight = in_flight.len(), "Waiting for in-flight messages");

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join_result(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "Drain timeout reached, leaving remaining messages to broker redelivery"
            );
            in_flight.abort_all();
        }
    }
}

pub(crate) fn topology_for(
    processor: &MessageProcessor,
    exchange: String,
    queue: String,
) -> Topology {
    let policy = processor.policy();
    Topology {
        exchange,
        queue,
        routing_keys: processor.registry().routing_keys(),
        dead_letter_exchange: policy
            .uses_dead_letter()
            .then(|| policy.dead_letter_exchange.clone()),
    }
}

fn log_join_result(
    joined: Result<Result<Disposition, ProcessingError>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(disposition)) if !disposition.settled => {
            warn!(
                delivery_tag = disposition.delivery_tag,
                "Message left unsettled, broker will redeliver"
            );
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Message processing task aborted"),
    }
}

/// Why the continuous worker stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The shutdown signal fired while the consumer was still running.
    Signal,
    /// The consumer task finished on its own, e.g. the broker closed the
    /// delivery stream. Nothing is consuming anymore.
    ConsumerStopped,
}

/// Waits for either `signal` or the end of the consumer task, whichever
/// comes first. `consumer` stays joinable after a [`WorkerExit::Signal`].
pub async fn wait_for_exit<S>(signal: S, consumer: &mut JoinHandle<()>) -> WorkerExit
where
    S: Future<Output = ()>,
{
    tokio::select! {
        _ = signal => WorkerExit::Signal,
        joined = consumer => {
            if let Err(e) = joined {
                error!(error = %e, "Consumer task aborted");
            }
            WorkerExit::ConsumerStopped
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(BrokerError),

    #[error("Failed to setup queue topology: {0}")]
    SetupFailed(BrokerError),
}
