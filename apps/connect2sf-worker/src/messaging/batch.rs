//! Bounded polling variant for scheduled runs.
//!
//! Instead of a standing subscription the runner issues up to `batch_size`
//! `basic.get` polls, settles each message exactly as the continuous
//! consumer does, and returns once the ceiling is reached or the queue is
//! drained. The caller then tears the connection down.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, Topology};
use super::consumer::{ConsumerError, topology_for};
use super::processor::{Disposition, MessageProcessor};
use crate::contracts::AckDecision;
use crate::metrics::Metrics;

pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Completed polls, whether they returned a message, nothing, or an error.
    pub polls: usize,
    pub acked: usize,
    pub requeued: usize,
    pub discarded: usize,
    pub dead_lettered: usize,
    pub empty: usize,
    pub poll_failures: usize,
    pub unsettled: usize,
    pub timed_out: bool,
}

impl BatchSummary {
    pub fn messages(&self) -> usize {
        self.acked + self.requeued + self.discarded + self.dead_lettered
    }

    fn record(&mut self, disposition: &Disposition) {
        if !disposition.settled {
            self.unsettled += 1;
            return;
        }
        match disposition.verdict.decision {
            AckDecision::Ack => self.acked += 1,
            AckDecision::NackRequeue => self.requeued += 1,
            AckDecision::NackDiscard => self.discarded += 1,
            AckDecision::DeadLetter => self.dead_lettered += 1,
        }
    }
}

pub struct BatchDrainRunner {
    channel: Arc<dyn BrokerChannel>,
    processor: Arc<MessageProcessor>,
    topology: Topology,
    batch_size: usize,
    batch_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl BatchDrainRunner {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        processor: Arc<MessageProcessor>,
        exchange: String,
        queue: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        let topology = topology_for(&processor, exchange, queue);
        Self {
            channel,
            processor,
            topology,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: Duration::from_secs(300),
            metrics,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    pub async fn run(&self) -> Result<BatchSummary, ConsumerError> {
        self.channel
            .declare_topology(&self.topology)
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.topology.queue, "Failed to declare topology");
                ConsumerError::SetupFailed(e)
            })?;
        debug!("Asserted all required exchanges and queues");

        let mut summary = BatchSummary::default();
        let drained = tokio::time::timeout(self.batch_timeout, self.drain(&mut summary)).await;
        if drained.is_err() {
            summary.timed_out = true;
            warn!(
                timeout_secs = self.batch_timeout.as_secs(),
                polls = summary.polls,
                "Batch timeout reached before the batch completed"
            );
        }

        info!(
            queue = %self.topology.queue,
            polls = summary.polls,
            messages = summary.messages(),
            acked = summary.acked,
            requeued = summary.requeued,
            discarded = summary.discarded,
            dead_lettered = summary.dead_lettered,
            empty = summary.empty,
            poll_failures = summary.poll_failures,
            "Batch finished"
        );
        Ok(summary)
    }

    async fn drain(&self, summary: &mut BatchSummary) {
        while summary.polls < self.batch_size {
            let polled = self.channel.get(&self.topology.queue).await;
            summary.polls += 1;

            let message = match polled {
                Ok(message) => message,
                Err(e) => {
                    summary.poll_failures += 1;
                    self.metrics.record_poll("failed");
                    error!(error = %e, queue = %self.topology.queue, "Get failed to consume");
                    break;
                }
            };

            match self.processor.process(self.channel.as_ref(), message).await {
                Ok(disposition) => {
                    self.metrics.record_poll("message");
                    summary.record(&disposition);
                }
                Err(e) => {
                    summary.empty += 1;
                    self.metrics.record_poll("empty");
                    debug!(reason = %e, "Queue drained");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::processor::ProcessorPolicy;
    use crate::messaging::registry::HandlerRegistry;
    use crate::messaging::testing::{BrokerCall, RecordingChannel, ScriptedHandler, message};

    fn runner(channel: Arc<RecordingChannel>) -> BatchDrainRunner {
        let registry = HandlerRegistry::new().with_handler("project-created", ScriptedHandler);
        let processor = Arc::new(MessageProcessor::new(
            Arc::new(registry),
            ProcessorPolicy::new("projects.failed"),
            Metrics::new().unwrap(),
        ));
        BatchDrainRunner::new(
            channel,
            processor,
            "projects".to_string(),
            "connect2sf.project".to_string(),
            Metrics::new().unwrap(),
        )
    }

    fn get_count(channel: &RecordingChannel) -> usize {
        channel
            .calls()
            .iter()
            .filter(|call| matches!(call, BrokerCall::Get { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_short_queue_stops_after_available_messages() {
        let channel = Arc::new(RecordingChannel::with_queue(vec![
            message(1, "project-created", r#"{"id":1}"#),
            message(2, "project-created", r#"{"id":2,"fail":"downstream"}"#),
            message(3, "project-created", r#"{"id":3,"fail":"unprocessable"}"#),
        ]));

        let summary = runner(channel.clone()).run().await.unwrap();

        assert_eq!(summary.messages(), 3);
        assert_eq!(summary.acked, 2);
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.empty, 1);
        assert_eq!(summary.polls, 4);
        assert!(!summary.timed_out);
        assert_eq!(get_count(&channel), 4);
        assert_eq!(
            channel.settlements(),
            vec![
                BrokerCall::Ack(1),
                BrokerCall::Nack {
                    delivery_tag: 2,
                    requeue: true
                },
                BrokerCall::Ack(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_ceiling_bounds_polls() {
        let messages = (1..=15)
            .map(|tag| message(tag, "project-created", r#"{"id":1}"#))
            .collect();
        let channel = Arc::new(RecordingChannel::with_queue(messages));

        let summary = runner(channel.clone()).with_batch_size(10).run().await.unwrap();

        assert_eq!(summary.polls, 10);
        assert_eq!(summary.acked, 10);
        assert_eq!(summary.empty, 0);
        assert_eq!(channel.remaining(), 5);
    }

    #[tokio::test]
    async fn test_empty_queue_makes_no_settlement() {
        let channel = Arc::new(RecordingChannel::default());

        let summary = runner(channel.clone()).run().await.unwrap();

        assert_eq!(summary.polls, 1);
        assert_eq!(summary.empty, 1);
        assert!(channel.settlements().is_empty());
    }

    #[tokio::test]
    async fn test_failed_poll_ends_batch() {
        let channel = Arc::new(RecordingChannel::default().failing_get());

        let summary = runner(channel.clone()).run().await.unwrap();

        assert_eq!(summary.poll_failures, 1);
        assert_eq!(summary.polls, 1);
        assert!(channel.settlements().is_empty());
    }

    #[tokio::test]
    async fn test_topology_is_declared_before_polling() {
        let channel = Arc::new(RecordingChannel::default());
        runner(channel.clone()).run().await.unwrap();

        let calls = channel.calls();
        assert!(matches!(calls[0], BrokerCall::DeclareTopology(_)));
        assert!(matches!(calls[1], BrokerCall::Get { .. }));
    }
}
