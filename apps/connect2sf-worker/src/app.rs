//! Startup wiring shared by the continuous and the scheduled worker.

use std::sync::Arc;

use lapin::Channel;
use tracing::info;

use crate::config::Config;
use crate::contracts::{PROJECT_CREATED, PROJECT_UPDATED};
use crate::messaging::{
    ChannelError, ChannelProvider, ConnectionError, HandlerRegistry, MessageProcessor,
    RabbitMqConnection, logged,
};
use crate::metrics::Metrics;
use crate::services::{
    CrmError, DynamoCampaignConfig, IdentityClient, IdentityError, ProjectCreatedHandler,
    ProjectSyncService, ProjectUpdatedHandler, SalesforceClient,
};

pub async fn build_sync_service(config: &Config) -> Result<Arc<ProjectSyncService>, AppError> {
    let campaigns = DynamoCampaignConfig::from_config(&config.campaign_store).await;
    let identity = IdentityClient::new(&config.identity, config.http_timeout)?;
    let crm = SalesforceClient::new(&config.salesforce, config.http_timeout)?;

    Ok(Arc::new(ProjectSyncService::new(
        Arc::new(campaigns),
        Arc::new(identity),
        Arc::new(crm),
        config.salesforce.owner_id.clone(),
    )))
}

/// Routing key to handler table, each handler wrapped in logging.
pub fn build_registry(service: Arc<ProjectSyncService>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler(
            PROJECT_CREATED,
            logged(
                "ProjectSyncService#project_created",
                ProjectCreatedHandler::new(service.clone()),
            ),
        )
        .with_handler(
            PROJECT_UPDATED,
            logged(
                "ProjectSyncService#project_updated",
                ProjectUpdatedHandler::new(service),
            ),
        )
}

pub fn build_processor(
    config: &Config,
    registry: HandlerRegistry,
    metrics: Arc<Metrics>,
) -> Arc<MessageProcessor> {
    let policy = config.broker.processor_policy();
    info!(
        routing_keys = ?registry.routing_keys(),
        downstream_failure = ?policy.downstream_failure,
        unknown_routing_key = ?policy.unknown_routing_key,
        "Message processor configured"
    );
    Arc::new(MessageProcessor::new(Arc::new(registry), policy, metrics))
}

/// Opens the connection and the confirm-mode channel.
pub async fn connect_broker(
    config: &Config,
    connection_name: &str,
) -> Result<(RabbitMqConnection, Channel), AppError> {
    let connection = RabbitMqConnection::connect(&config.rabbitmq_url, connection_name).await?;
    let channel =
        ChannelProvider::create_channel(connection.get_connection(), config.broker.prefetch).await?;
    Ok((connection, channel))
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to create identity client: {0}")]
    Identity(#[from] IdentityError),

    #[error("Failed to create Salesforce client: {0}")]
    Crm(#[from] CrmError),
}
