use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use tracing::debug;

use crate::config::CampaignStoreConfig;

const MAGIC_NUMBERS: &str = "magicnumbers";
const DRIP_CAMPAIGN_ID: &str = "dripcampaignid";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CampaignConfig: Send + Sync {
    /// Campaign new leads are enrolled in.
    async fn salesforce_campaign_id(&self) -> Result<String, CampaignConfigError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CampaignConfigError {
    #[error("Configuration for {table} not found")]
    NotFound { table: String },

    #[error("Invalid {table}. dripcampaignid not found in magicnumbers")]
    MissingField { table: String },

    #[error("Configuration store error: {0}")]
    Store(String),
}

/// Reads the per-environment configuration record from DynamoDB.
pub struct DynamoCampaignConfig {
    client: Client,
    table: String,
    environment: String,
}

impl DynamoCampaignConfig {
    pub fn new(client: Client, table: String, environment: String) -> Self {
        Self {
            client,
            table,
            environment,
        }
    }

    /// Loads AWS credentials from the environment and honours a local
    /// endpoint override.
    pub async fn from_config(config: &CampaignStoreConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        Self::new(
            Client::new(&sdk_config),
            config.table.clone(),
            config.environment.clone(),
        )
    }
}

#[async_trait]
impl CampaignConfig for DynamoCampaignConfig {
    async fn salesforce_campaign_id(&self) -> Result<String, CampaignConfigError> {
        debug!(table = %self.table, environment = %self.environment, "Scanning configuration table");

        let mut items = self
            .client
            .scan()
            .table_name(&self.table)
            .filter_expression("#environment = :environment")
            .expression_attribute_names("#environment", "Environment")
            .expression_attribute_values(":environment", AttributeValue::S(self.environment.clone()))
            .into_paginator()
            .items()
            .send();

        match items.next().await {
            Some(Ok(item)) => campaign_id(&item, &self.table),
            Some(Err(e)) => Err(CampaignConfigError::Store(
                DisplayErrorContext(&e).to_string(),
            )),
            None => Err(CampaignConfigError::NotFound {
                table: self.table.clone(),
            }),
        }
    }
}

/// `magicnumbers.M.dripcampaignid.S` of a configuration record.
fn campaign_id(
    item: &HashMap<String, AttributeValue>,
    table: &str,
) -> Result<String, CampaignConfigError> {
    item.get(MAGIC_NUMBERS)
        .and_then(|numbers| numbers.as_m().ok())
        .and_then(|numbers| numbers.get(DRIP_CAMPAIGN_ID))
        .and_then(|id| id.as_s().ok())
        .cloned()
        .ok_or_else(|| CampaignConfigError::MissingField {
            table: table.to_string(),
        })
}
