use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use connect2sf_worker::app::{build_processor, build_registry, build_sync_service, connect_broker};
use connect2sf_worker::config::Config;
use connect2sf_worker::messaging::{
    AmqpChannel, ChannelProvider, Consumer, WorkerExit, wait_for_exit,
};
use connect2sf_worker::metrics::{Metrics, server::start_metrics_server};
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
        "connect2sf worker starting"
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

    let (rabbitmq, channel) = match connect_broker(&config, &config.service_name).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "Failed to set up RabbitMQ");
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let shutdown = Arc::new(Notify::new());
    let consumer = Consumer::new(
        Arc::new(AmqpChannel::new(channel.clone())),
        processor,
        config.broker.exchange.clone(),
        config.broker.queue.clone(),
        format!("{}-consumer", config.service_name),
        shutdown.clone(),
        metrics,
    )
    .with_drain_timeout(config.shutdown_drain);

    if let Err(e) = consumer.setup_topology().await {
        error!(error = %e, "Failed to setup queue topology");
        std::process::exit(1);
    }

    let mut consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.start().await {
            error!(error = %e, "Consumer error");
        }
    });

    info!(queue = %config.broker.queue, "Ready to process project events");

    let signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    let exit = wait_for_exit(signal, &mut consumer_handle).await;
    match exit {
        WorkerExit::Signal => {
            warn!("Shutdown signal received, cleaning up...");
            shutdown.notify_one();

            let consumer_timeout = config.shutdown_drain + std::time::Duration::from_secs(1);
            if let Err(e) = tokio::time::timeout(consumer_timeout, consumer_handle).await {
                warn!(error = ?e, "Consumer shutdown timeout");
            }
        }
        WorkerExit::ConsumerStopped => {
            error!(queue = %config.broker.queue, "Consumer stopped unexpectedly, exiting");
        }
    }

    if let Err(e) = ChannelProvider::close_channel(&channel).await {
        warn!(error = %e, "Error closing channel");
    }
    if let Err(e) = rabbitmq.shutdown().await {
        error!(error = %e, "Error during shutdown");
    }

    if exit == WorkerExit::ConsumerStopped {
        std::process::exit(1);
    }
    info!("connect2sf worker stopped");
}
