use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

use crate::contracts::{AckDecision, ProcessingError};

pub mod server;

pub struct Metrics {
    pub messages_processed_total: CounterVec,
    pub messages_failed_total: CounterVec,
    pub messages_requeued_total: Counter,
    pub messages_dead_lettered_total: Counter,
    pub message_processing_duration_seconds: HistogramVec,
    pub batch_polls_total: CounterVec,
    pub active_consumers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_processed_total = CounterVec::new(
            Opts::new(
                "connect2sf_messages_processed_total",
                "Total number of messages settled, by routing key and decision",
            ),
            &["routing_key", "decision"],
        )?;

        let messages_failed_total = CounterVec::new(
            Opts::new(
                "connect2sf_messages_failed_total",
                "Total number of messages that failed processing",
            ),
            &["error_type"],
        )?;

        let messages_requeued_total = Counter::new(
            "connect2sf_messages_requeued_total",
            "Total number of messages handed back to the queue",
        )?;

        let messages_dead_lettered_total = Counter::new(
            "connect2sf_messages_dead_lettered_total",
            "Total number of messages published to the failure exchange",
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "connect2sf_message_processing_duration_seconds",
                "Time taken to process a message",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["routing_key", "status"],
        )?;

        let batch_polls_total = CounterVec::new(
            Opts::new(
                "connect2sf_batch_polls_total",
                "Total number of queue polls made by the scheduled worker",
            ),
            &["result"],
        )?;

        let active_consumers = Gauge::new(
            "connect2sf_active_consumers",
            "Number of active consumer loops",
        )?;

        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(messages_requeued_total.clone()))?;
        registry.register(Box::new(messages_dead_lettered_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(batch_polls_total.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;

        Ok(Arc::new(Self {
            messages_processed_total,
            messages_failed_total,
            messages_requeued_total,
            messages_dead_lettered_total,
            message_processing_duration_seconds,
            batch_polls_total,
            active_consumers,
            registry,
        }))
    }

    pub fn record_settlement(
        &self,
        routing_key: &str,
        decision: AckDecision,
        failure: Option<&ProcessingError>,
        duration_secs: f64,
    ) {
        self.messages_processed_total
            .with_label_values(&[routing_key, decision.as_str()])
            .inc();

        let status = match failure {
            Some(failure) => {
                self.messages_failed_total
                    .with_label_values(&[failure.error_type()])
                    .inc();
                failure.error_type()
            }
            None => "success",
        };
        self.message_processing_duration_seconds
            .with_label_values(&[routing_key, status])
            .observe(duration_secs);

        match decision {
            AckDecision::NackRequeue => self.messages_requeued_total.inc(),
            AckDecision::DeadLetter => self.messages_dead_lettered_total.inc(),
            AckDecision::Ack | AckDecision::NackDiscard => {}
        }
    }

    pub fn record_poll(&self, result: &str) {
        self.batch_polls_total.with_label_values(&[result]).inc();
    }
}
