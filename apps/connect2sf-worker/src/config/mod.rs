use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::messaging::channel::DEFAULT_PREFETCH;
use crate::messaging::{DownstreamFailurePolicy, ProcessorPolicy, UnknownRoutingKeyPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: String,
    pub service_name: String,
    pub rust_log: String,
    pub broker: BrokerConfig,
    pub batch: BatchConfig,
    pub shutdown_drain: Duration,
    pub metrics_port: u16,
    pub http_timeout: Duration,
    pub identity: IdentityConfig,
    pub salesforce: SalesforceConfig,
    pub campaign_store: CampaignStoreConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub exchange: String,
    pub queue: String,
    pub dead_letter_exchange: String,
    pub prefetch: u16,
    pub downstream_failure: DownstreamFailurePolicy,
    pub unknown_routing_key: UnknownRoutingKeyPolicy,
}

impl BrokerConfig {
    pub fn processor_policy(&self) -> ProcessorPolicy {
        ProcessorPolicy {
            downstream_failure: self.downstream_failure,
            unknown_routing_key: self.unknown_routing_key,
            dead_letter_exchange: self.dead_letter_exchange.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub size: usize,
    pub grace: Duration,
    pub timeout: Duration,
}

#[derive(Clone, PartialEq)]
pub struct IdentityConfig {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<removed>")
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub struct SalesforceConfig {
    /// Login host; also the JWT audience.
    pub audience: String,
    pub client_id: String,
    pub subject: String,
    /// PEM-encoded RSA private key.
    pub client_key: String,
    pub owner_id: String,
    pub api_version: String,
}

impl fmt::Debug for SalesforceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SalesforceConfig")
            .field("audience", &self.audience)
            .field("client_id", &self.client_id)
            .field("subject", &self.subject)
            .field("client_key", &"<removed>")
            .field("owner_id", &self.owner_id)
            .field("api_version", &self.api_version)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CampaignStoreConfig {
    pub table: String,
    pub environment: String,
    pub region: String,
    pub endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Source(lookup);

        let rabbitmq_url = vars.required("RABBITMQ_URL")?;
        let service_name = vars.required("SERVICE_NAME")?;
        let rust_log = vars.or("RUST_LOG", "info");

        let exchange = vars.or("RABBITMQ_EXCHANGE", "projects");
        let broker = BrokerConfig {
            dead_letter_exchange: vars
                .optional("RABBITMQ_DEAD_LETTER_EXCHANGE")
                .unwrap_or_else(|| format!("{}.failed", exchange)),
            exchange,
            queue: vars.or("RABBITMQ_QUEUE", "connect2sf.project"),
            prefetch: vars.parsed("RABBITMQ_PREFETCH", DEFAULT_PREFETCH)?,
            downstream_failure: vars
                .parsed("DOWNSTREAM_FAILURE_POLICY", DownstreamFailurePolicy::default())?,
            unknown_routing_key: vars
                .parsed("UNKNOWN_ROUTING_KEY_POLICY", UnknownRoutingKeyPolicy::default())?,
        };
        if broker.prefetch == 0 {
            return Err(ConfigError::Invalid {
                key: "RABBITMQ_PREFETCH",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let batch = BatchConfig {
            size: vars.parsed("BATCH_SIZE", 10)?,
            grace: Duration::from_secs(vars.parsed("BATCH_GRACE_SECS", 30)?),
            timeout: Duration::from_secs(vars.parsed("BATCH_TIMEOUT_SECS", 300)?),
        };

        let identity = IdentityConfig {
            url: vars.required("IDENTITY_SERVICE_URL")?,
            client_id: vars.required("IDENTITY_CLIENT_ID")?,
            client_secret: vars.required("IDENTITY_CLIENT_SECRET")?,
        };

        let salesforce = SalesforceConfig {
            audience: vars.or("SALESFORCE_AUDIENCE", "https://login.salesforce.com"),
            client_id: vars.required("SALESFORCE_CLIENT_ID")?,
            subject: vars.required("SALESFORCE_SUBJECT")?,
            client_key: vars.required("SALESFORCE_CLIENT_KEY")?.replace("\\n", "\n"),
            owner_id: vars.required("SALESFORCE_OWNER_ID")?,
            api_version: vars.or("SALESFORCE_API_VERSION", "v37.0"),
        };

        let campaign_store = CampaignStoreConfig {
            table: vars.or("CONFIG_TABLE", "AppXpressConfig"),
            environment: vars.or("DEPLOY_ENV", "development"),
            region: vars.or("AWS_REGION", "us-east-1"),
            endpoint: vars.optional("AWS_DYNAMODB_ENDPOINT"),
        };

        Ok(Self {
            rabbitmq_url,
            service_name,
            rust_log,
            broker,
            batch,
            shutdown_drain: Duration::from_secs(vars.parsed("SHUTDOWN_DRAIN_SECS", 5)?),
            metrics_port: vars.parsed("METRICS_PORT", 9090)?,
            http_timeout: Duration::from_millis(vars.parsed("HTTP_TIMEOUT_MS", 30_000)?),
            identity,
            salesforce,
            campaign_store,
        })
    }
}

struct Source<F>(F);

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Blank values count as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::MissingRequired(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
