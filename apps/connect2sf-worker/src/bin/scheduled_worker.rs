//! One-shot worker meant to be run on a schedule: drains at most one batch
//! from the project queue, then closes the connection and exits.

use std::sync::Arc;

use tracing::{error, info, warn};

use connect2sf_worker::app::{build_processor, build_registry, build_sync_service, connect_broker};
use connect2sf_worker::config::Config;
use connect2sf_worker::messaging::{AmqpChannel, BatchDrainRunner};
use connect2sf_worker::metrics::Metrics;
use connect2sf_worker::telemetry::{setup_logging, setup_panic_handler};

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = setup_logging(&config.rust_log) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        batch_size = config.batch.size,
        "connect2sf scheduled worker starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Failed to create metrics");
            std::process::exit(1);
        }
    };

    let service = match build_sync_service(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Failed to build service clients");
            std::process::exit(1);
        }
    };
    let processor = build_processor(&config, build_registry(service), metrics.clone());

    let connection_name = format!("{}-scheduled", config.service_name);
    let (rabbitmq, channel) = match connect_broker(&config, &connection_name).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "Failed to set up RabbitMQ");
            std::process::exit(1);
        }
    };

    let runner = BatchDrainRunner::new(
        Arc::new(AmqpChannel::new(channel)),
        processor,
        config.broker.exchange.clone(),
        config.broker.queue.clone(),
        metrics,
    )
    .with_batch_size(config.batch.size)
    .with_batch_timeout(config.batch.timeout);

    let outcome = tokio::select! {
        result = runner.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let exit_code = match outcome {
        Some(Ok(summary)) => {
            info!(
                polls = summary.polls,
                messages = summary.messages(),
                "Closing self after processing messages"
            );
            0
        }
        Some(Err(e)) => {
            error!(error = %e, "Batch run failed");
            1
        }
        None => {
            warn!("Received SIGINT, closing connection");
            if let Err(e) = rabbitmq.shutdown().await {
                error!(error = %e, "Error during shutdown");
            }
            std::process::exit(0);
        }
    };

    if let Err(e) = rabbitmq.shutdown_after_grace(config.batch.grace).await {
        error!(error = %e, "Error during shutdown");
    }

    info!("connect2sf scheduled worker stopped");
    std::process::exit(exit_code);
}
