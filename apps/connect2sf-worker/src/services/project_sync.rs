//! Turns project lifecycle events into Salesforce leads.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryFutureExt;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::campaign_config::CampaignConfig;
use super::identity::IdentityApi;
use super::salesforce::{CrmApi, CrmError};
use crate::contracts::{ProjectCreated, ProjectUpdated, ValidationError};
use crate::messaging::{EventHandler, HandlerContext, HandlerError};

const LEAD: &str = "Lead";
const CAMPAIGN_MEMBER: &str = "CampaignMember";
const LEAD_SOURCE: &str = "Connect";
const COMPANY: &str = "Unknown";

/// Created-project fields copied onto the lead, `""` when absent.
const PROJECT_LEAD_FIELDS: &[(&str, &str)] = &[
    ("TC_Connect_Description__c", "/description"),
    ("TC_Connect_Project_Status__c", "/status"),
    ("Ref_Code__c", "/details/utm/code"),
    ("TC_Connect_Direct_Project_Id__c", "/directProjectId"),
    ("TC_Connect_Cancel_Reason__c", "/cancelReason"),
    ("Google_Analytics_Click_ID__c", "/details/utm/google/_gclid"),
    ("Google_Analytics_Client_ID__c", "/details/utm/google/_gacid"),
];

pub struct ProjectSyncService {
    campaigns: Arc<dyn CampaignConfig>,
    identity: Arc<dyn IdentityApi>,
    crm: Arc<dyn CrmApi>,
    owner_id: String,
}

impl ProjectSyncService {
    pub fn new(
        campaigns: Arc<dyn CampaignConfig>,
        identity: Arc<dyn IdentityApi>,
        crm: Arc<dyn CrmApi>,
        owner_id: String,
    ) -> Self {
        Self {
            campaigns,
            identity,
            crm,
            owner_id,
        }
    }

    /// Creates a lead for the primary customer and enrolls it in the drip
    /// campaign.
    pub async fn project_created(&self, project: &ProjectCreated) -> Result<(), HandlerError> {
        let Some(user_id) = project.primary_customer_id() else {
            info!(
                project_id = project.id,
                members = %serde_json::Value::Array(project.members().to_vec()),
                "Project has no primary customer"
            );
            return Err(HandlerError::unprocessable("Cannot find primary customer"));
        };

        let (campaign_id, user, auth) = tokio::try_join!(
            self.campaigns
                .salesforce_campaign_id()
                .map_err(|e| HandlerError::downstream(e.to_string())),
            self.identity
                .get_user(user_id, None)
                .map_err(|e| HandlerError::downstream(e.to_string())),
            self.crm.authenticate().map_err(crm_failure),
        )?;

        let mut lead = Map::new();
        lead.insert("FirstName".into(), json!(user.first_name));
        lead.insert("LastName".into(), json!(user.last_name));
        lead.insert("Email".into(), json!(user.email));
        lead.insert("LeadSource".into(), json!(LEAD_SOURCE));
        lead.insert("Company".into(), json!(COMPANY));
        lead.insert("OwnerId".into(), json!(self.owner_id));
        lead.insert("TC_Handle__c".into(), json!(user.handle));
        lead.insert("TC_Connect_Project_Id__c".into(), json!(project.id));
        for (column, pointer) in PROJECT_LEAD_FIELDS {
            lead.insert((*column).into(), project.field_or_empty(pointer));
        }

        let duplicate = |e: CrmError| {
            if e.is_duplicate() {
                HandlerError::unprocessable(format!(
                    "Lead already existing for project {}",
                    project.id
                ))
            } else {
                crm_failure(e)
            }
        };

        let lead_id = self
            .crm
            .create_object(LEAD.to_string(), lead, auth.clone())
            .await
            .map_err(duplicate)?;
        debug!(project_id = project.id, lead_id = %lead_id, "Lead created");

        let mut member = Map::new();
        member.insert("LeadId".into(), json!(lead_id));
        member.insert("CampaignId".into(), json!(campaign_id));
        self.crm
            .create_object(CAMPAIGN_MEMBER.to_string(), member, auth)
            .await
            .map_err(duplicate)?;

        info!(project_id = project.id, lead_id = %lead_id, "Project lead synced");
        Ok(())
    }

    /// Mirrors status, description and referral changes onto the project's
    /// lead while it is still unconverted.
    pub async fn project_updated(&self, event: &ProjectUpdated) -> Result<(), HandlerError> {
        let auth = self.crm.authenticate().await.map_err(crm_failure)?;

        let soql = format!(
            "SELECT id,IsConverted FROM Lead WHERE TC_Connect_Project_Id__c = '{}'",
            event.project_id
        );
        let result = self
            .crm
            .query(soql, auth.clone())
            .await
            .map_err(crm_failure)?;

        let Some(lead) = result.records.first() else {
            return Err(HandlerError::unprocessable(format!(
                "Cannot find Lead with TC_Connect_Project_Id__c = '{}'",
                event.project_id
            )));
        };
        let lead_id = lead
            .get("Id")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::downstream("Lead record returned without Id"))?;
        let converted = lead.get("IsConverted").and_then(Value::as_bool) == Some(true);

        let changes = event.lead_changes();
        if converted || changes.is_empty() {
            debug!(
                project_id = event.project_id,
                converted,
                changes = changes.len(),
                "Nothing to update on lead"
            );
            return Ok(());
        }

        self.crm
            .update_object(lead_id.to_string(), LEAD.to_string(), changes, auth)
            .await
            .map_err(crm_failure)?;
        info!(project_id = event.project_id, lead_id, "Lead updated");
        Ok(())
    }
}

fn crm_failure(e: CrmError) -> HandlerError {
    HandlerError::downstream(e.to_string())
}

/// Handles `project-created`.
pub struct ProjectCreatedHandler {
    service: Arc<ProjectSyncService>,
}

impl ProjectCreatedHandler {
    pub fn new(service: Arc<ProjectSyncService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for ProjectCreatedHandler {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        ProjectCreated::parse(payload).map(|_| ())
    }

    async fn handle(&self, _ctx: &HandlerContext, payload: Value) -> Result<(), HandlerError> {
        let project = ProjectCreated::parse(&payload)
            .map_err(|e| HandlerError::unprocessable(e.to_string()))?;
        self.service.project_created(&project).await
    }
}

/// Handles `project-updated`.
pub struct ProjectUpdatedHandler {
    service: Arc<ProjectSyncService>,
}

impl ProjectUpdatedHandler {
    pub fn new(service: Arc<ProjectSyncService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for ProjectUpdatedHandler {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        ProjectUpdated::parse(payload).map(|_| ())
    }

    async fn handle(&self, _ctx: &HandlerContext, payload: Value) -> Result<(), HandlerError> {
        let event = ProjectUpdated::parse(&payload)
            .map_err(|e| HandlerError::unprocessable(e.to_string()))?;
        self.service.project_updated(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{AckDecision, PROJECT_CREATED, ProcessingError};
    use crate::messaging::testing::{BrokerCall, RecordingChannel, message};
    use crate::messaging::{HandlerRegistry, MessageProcessor, ProcessorPolicy};
    use crate::metrics::Metrics;
    use crate::services::campaign_config::{CampaignConfigError, MockCampaignConfig};
    use crate::services::identity::{MockIdentityApi, UserProfile};
    use crate::services::salesforce::{CrmAuth, MockCrmApi, QueryResult};
    use mockall::Sequence;
    use mockall::predicate::eq;

    fn auth() -> CrmAuth {
        CrmAuth {
            access_token: "fake-token".to_string(),
            instance_url: "http://fake-domain".to_string(),
        }
    }

    fn user() -> UserProfile {
        UserProfile {
            first_name: Some("john".to_string()),
            last_name: Some("doe".to_string()),
            email: Some("jd@example.com".to_string()),
            handle: Some("jdoe".to_string()),
        }
    }

    fn created_payload() -> Value {
        json!({
            "id": 1,
            "details": {
                "appDefinition": {"budget": 10000, "whenToStart": "asap"},
                "utm": {"code": "123", "google": {"_gacid": "1234.5678", "_gclid": "5678.1234"}}
            },
            "cancelReason": null,
            "members": [{"id": 1234, "userId": 40135978, "role": "customer", "isPrimary": true}]
        })
    }

    fn campaigns() -> MockCampaignConfig {
        let mut campaigns = MockCampaignConfig::new();
        campaigns
            .expect_salesforce_campaign_id()
            .returning(|| Ok("sf-camp-id".to_string()));
        campaigns
    }

    fn identity() -> MockIdentityApi {
        let mut identity = MockIdentityApi::new();
        identity
            .expect_get_user()
            .with(eq("40135978".to_string()), eq(None))
            .returning(|_, _| Ok(user()));
        identity
    }

    fn authenticated_crm() -> MockCrmApi {
        let mut crm = MockCrmApi::new();
        crm.expect_authenticate().returning(|| Ok(auth()));
        crm
    }

    fn service(
        campaigns: MockCampaignConfig,
        identity: MockIdentityApi,
        crm: MockCrmApi,
    ) -> Arc<ProjectSyncService> {
        Arc::new(ProjectSyncService::new(
            Arc::new(campaigns),
            Arc::new(identity),
            Arc::new(crm),
            "owner-id".to_string(),
        ))
    }

    fn created(payload: &Value) -> ProjectCreated {
        ProjectCreated::parse(payload).unwrap()
    }

    fn updated(payload: Value) -> ProjectUpdated {
        ProjectUpdated::parse(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_created_project_makes_lead_then_campaign_member() {
        let mut crm = authenticated_crm();
        let mut seq = Sequence::new();
        crm.expect_create_object()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|object_type, fields, auth| {
                object_type == "Lead"
                    && fields["FirstName"] == "john"
                    && fields["LastName"] == "doe"
                    && fields["Email"] == "jd@example.com"
                    && fields["LeadSource"] == "Connect"
                    && fields["Company"] == "Unknown"
                    && fields["OwnerId"] == "owner-id"
                    && fields["TC_Handle__c"] == "jdoe"
                    && fields["TC_Connect_Project_Id__c"] == 1
                    && fields["TC_Connect_Description__c"] == ""
                    && fields["TC_Connect_Project_Status__c"] == ""
                    && fields["Ref_Code__c"] == "123"
                    && fields["TC_Connect_Direct_Project_Id__c"] == ""
                    && fields["TC_Connect_Cancel_Reason__c"].is_null()
                    && fields["Google_Analytics_Click_ID__c"] == "5678.1234"
                    && fields["Google_Analytics_Client_ID__c"] == "1234.5678"
                    && auth.access_token == "fake-token"
            })
            .returning(|_, _, _| Ok("fake-lead-id".to_string()));
        crm.expect_create_object()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|object_type, fields, _| {
                object_type == "CampaignMember"
                    && fields["LeadId"] == "fake-lead-id"
                    && fields["CampaignId"] == "sf-camp-id"
            })
            .returning(|_, _, _| Ok("fake-member-id".to_string()));

        let service = service(campaigns(), identity(), crm);
        service.project_created(&created(&created_payload())).await.unwrap();
    }

    #[tokio::test]
    async fn test_created_without_primary_customer_is_unprocessable() {
        let mut payload = created_payload();
        payload["members"][0]["isPrimary"] = json!(false);

        let service = service(
            MockCampaignConfig::new(),
            MockIdentityApi::new(),
            MockCrmApi::new(),
        );
        let err = service.project_created(&created(&payload)).await.unwrap_err();

        assert_eq!(
            err,
            HandlerError::unprocessable("Cannot find primary customer")
        );
    }

    #[tokio::test]
    async fn test_duplicate_lead_is_unprocessable() {
        let mut crm = authenticated_crm();
        crm.expect_create_object().times(1).returning(|_, _, _| {
            Err(CrmError::DuplicateValue(
                "TC_Connect_Project_Id__c duplicates value on record with id: 00Q1".to_string(),
            ))
        });

        let service = service(campaigns(), identity(), crm);
        let err = service
            .project_created(&created(&created_payload()))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            HandlerError::unprocessable("Lead already existing for project 1")
        );
    }

    #[tokio::test]
    async fn test_crm_outage_is_downstream() {
        let mut crm = authenticated_crm();
        crm.expect_create_object().returning(|_, _, _| {
            Err(CrmError::Api {
                status: 503,
                body: "unavailable".to_string(),
            })
        });

        let service = service(campaigns(), identity(), crm);
        let err = service
            .project_created(&created(&created_payload()))
            .await
            .unwrap_err();

        assert!(!err.should_acknowledge());
    }

    #[tokio::test]
    async fn test_missing_campaign_config_is_downstream() {
        let mut campaigns = MockCampaignConfig::new();
        campaigns.expect_salesforce_campaign_id().returning(|| {
            Err(CampaignConfigError::NotFound {
                table: "AppXpressConfig".to_string(),
            })
        });
        let mut crm = authenticated_crm();
        crm.expect_create_object().never();

        let service = service(campaigns, identity(), crm);
        let err = service
            .project_created(&created(&created_payload()))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            HandlerError::downstream("Configuration for AppXpressConfig not found")
        );
    }

    fn lead_query(records: Vec<Value>) -> MockCrmApi {
        let mut crm = authenticated_crm();
        crm.expect_query()
            .with(
                eq("SELECT id,IsConverted FROM Lead WHERE TC_Connect_Project_Id__c = '1'"
                    .to_string()),
                eq(auth()),
            )
            .times(1)
            .returning(move |_, _| {
                Ok(QueryResult {
                    total_size: records.len() as u64,
                    done: true,
                    records: records.clone(),
                })
            });
        crm
    }

    fn update_payload() -> Value {
        json!({
            "original": {"id": 1, "status": "in_review"},
            "updated": {"id": 1, "status": "active", "cancelReason": null}
        })
    }

    #[tokio::test]
    async fn test_updated_project_updates_lead() {
        let mut crm = lead_query(vec![json!({"Id": "fake-lead-id", "IsConverted": false})]);
        crm.expect_update_object()
            .times(1)
            .withf(|id, object_type, fields, _| {
                id == "fake-lead-id"
                    && object_type == "Lead"
                    && fields.len() == 1
                    && fields["TC_Connect_Project_Status__c"] == "active"
            })
            .returning(|_, _, _, _| Ok(()));

        let service = service(MockCampaignConfig::new(), MockIdentityApi::new(), crm);
        service.project_updated(&updated(update_payload())).await.unwrap();
    }

    #[tokio::test]
    async fn test_converted_lead_is_left_alone() {
        let mut crm = lead_query(vec![json!({"Id": "fake-lead-id", "IsConverted": true})]);
        crm.expect_update_object().never();

        let service = service(MockCampaignConfig::new(), MockIdentityApi::new(), crm);
        service.project_updated(&updated(update_payload())).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_without_changes_is_skipped() {
        let mut crm = lead_query(vec![json!({"Id": "fake-lead-id", "IsConverted": false})]);
        crm.expect_update_object().never();

        let service = service(MockCampaignConfig::new(), MockIdentityApi::new(), crm);
        let payload = json!({"original": {"id": 1}, "updated": {"status": "", "cancelReason": null}});
        service.project_updated(&updated(payload)).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_lead_is_unprocessable() {
        let crm = lead_query(vec![]);

        let service = service(MockCampaignConfig::new(), MockIdentityApi::new(), crm);
        let err = service
            .project_updated(&updated(update_payload()))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            HandlerError::unprocessable(
                "Cannot find Lead with TC_Connect_Project_Id__c = '1'"
            )
        );
    }

    #[test]
    fn test_handlers_validate_payload_shape() {
        let service = service(
            MockCampaignConfig::new(),
            MockIdentityApi::new(),
            MockCrmApi::new(),
        );
        let created_handler = ProjectCreatedHandler::new(service.clone());
        let updated_handler = ProjectUpdatedHandler::new(service);

        assert!(created_handler.validate(&created_payload()).is_ok());
        assert!(created_handler.validate(&json!({"id": 1})).is_err());
        assert!(updated_handler.validate(&update_payload()).is_ok());
        assert!(updated_handler.validate(&json!({"updated": {}})).is_err());
    }

    #[tokio::test]
    async fn test_duplicate_lead_delivery_is_acked_as_business_rule_violation() {
        let mut crm = authenticated_crm();
        crm.expect_create_object().returning(|_, _, _| {
            Err(CrmError::DuplicateValue("DUPLICATE_VALUE".to_string()))
        });
        let service = service(campaigns(), identity(), crm);
        let registry =
            HandlerRegistry::new().with_handler(PROJECT_CREATED, ProjectCreatedHandler::new(service));
        let processor = MessageProcessor::new(
            Arc::new(registry),
            ProcessorPolicy::new("projects.failed"),
            Metrics::new().unwrap(),
        );
        let channel = RecordingChannel::default();

        let disposition = processor
            .process(
                &channel,
                Some(message(9, PROJECT_CREATED, &created_payload().to_string())),
            )
            .await
            .unwrap();

        assert_eq!(disposition.verdict.decision, AckDecision::Ack);
        assert!(matches!(
            disposition.verdict.failure,
            Some(ProcessingError::BusinessRuleViolation { .. })
        ));
        assert_eq!(channel.settlements(), vec![BrokerCall::Ack(9)]);
    }

    #[tokio::test]
    async fn test_created_project_delivery_is_acked_after_lead_and_campaign_member() {
        let created_objects = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut crm = authenticated_crm();
        let mut seq = Sequence::new();
        let recorded = created_objects.clone();
        crm.expect_create_object()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|object_type, _, _| object_type == "Lead")
            .returning(move |object_type, _, _| {
                recorded.lock().unwrap().push(object_type);
                Ok("fake-lead-id".to_string())
            });
        let recorded = created_objects.clone();
        crm.expect_create_object()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|object_type, fields, _| {
                object_type == "CampaignMember" && fields["LeadId"] == "fake-lead-id"
            })
            .returning(move |object_type, _, _| {
                recorded.lock().unwrap().push(object_type);
                Ok("fake-member-id".to_string())
            });
        let service = service(campaigns(), identity(), crm);
        let registry =
            HandlerRegistry::new().with_handler(PROJECT_CREATED, ProjectCreatedHandler::new(service));
        let processor = MessageProcessor::new(
            Arc::new(registry),
            ProcessorPolicy::new("projects.failed"),
            Metrics::new().unwrap(),
        );
        let channel = RecordingChannel::default();

        let disposition = processor
            .process(
                &channel,
                Some(message(4, PROJECT_CREATED, &created_payload().to_string())),
            )
            .await
            .unwrap();

        assert!(disposition.verdict.is_success());
        assert_eq!(channel.settlements(), vec![BrokerCall::Ack(4)]);
        assert_eq!(
            *created_objects.lock().unwrap(),
            vec!["Lead".to_string(), "CampaignMember".to_string()]
        );
    }
}
