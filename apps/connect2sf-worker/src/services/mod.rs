pub mod campaign_config;
pub mod identity;
pub mod project_sync;
pub mod salesforce;

pub use campaign_config::{CampaignConfig, CampaignConfigError, DynamoCampaignConfig};
pub use identity::{IdentityApi, IdentityClient, IdentityError, UserProfile};
pub use project_sync::{ProjectCreatedHandler, ProjectSyncService, ProjectUpdatedHandler};
pub use salesforce::{CrmApi, CrmAuth, CrmError, QueryResult, SalesforceClient};
