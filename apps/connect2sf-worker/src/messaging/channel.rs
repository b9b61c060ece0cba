use lapin::options::ConfirmSelectOptions;
use lapin::{Channel, Connection};
use tracing::{error, info};

pub const DEFAULT_PREFETCH: u16 = 10;

pub struct ChannelProvider;

impl ChannelProvider {
    /// Opens a channel in publisher-confirm mode with the given prefetch.
    /// Confirms are needed so dead-letter publishes can be verified before
    /// the original delivery is acked.
    pub async fn create_channel(
        connection: &Connection,
        prefetch: u16,
    ) -> Result<Channel, ChannelError> {
        info!("Creating RabbitMQ channel");

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        info!(channel_id = channel.id(), prefetch_count = prefetch, "Configuring channel QoS");

        channel
            .basic_qos(prefetch, Default::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to configure channel QoS");
                ChannelError::QoSConfigurationFailed(e.to_string())
            })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to enable publisher confirms");
                ChannelError::ConfirmSelectFailed(e.to_string())
            })?;

        info!(
            channel_id = channel.id(),
            prefetch_count = prefetch,
            "Channel configured successfully"
        );

        Ok(channel)
    }

    pub async fn close_channel(channel: &Channel) -> Result<(), ChannelError> {
        let channel_id = channel.id();
        if !channel.status().connected() {
            return Ok(());
        }
        info!(channel_id, "Closing RabbitMQ channel");

        channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            ChannelError::CloseFailed(e.to_string())
        })?;

        info!(channel_id, "Channel closed successfully");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to create channel: {0}")]
    CreationFailed(String),

    #[error("Failed to configure channel QoS: {0}")]
    QoSConfigurationFailed(String),

    #[error("Failed to enable publisher confirms: {0}")]
    ConfirmSelectFailed(String),

    #[error("Failed to close channel: {0}")]
    CloseFailed(String),
}
