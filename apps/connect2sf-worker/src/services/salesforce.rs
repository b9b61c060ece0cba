//! Salesforce REST client authenticated with the OAuth 2.0 JWT bearer flow.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::SalesforceConfig;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
const DUPLICATE_MARKERS: &[&str] = &["DUPLICATE_VALUE", "duplicates value on record"];

/// Session returned by the token endpoint.
#[derive(Clone, PartialEq, Deserialize)]
pub struct CrmAuth {
    pub access_token: String,
    pub instance_url: String,
}

impl fmt::Debug for CrmAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmAuth")
            .field("access_token", &"<removed>")
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub total_size: u64,
    pub done: bool,
    pub records: Vec<Value>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn authenticate(&self) -> Result<CrmAuth, CrmError>;

    /// Creates an sObject and returns its id.
    async fn create_object(
        &self,
        object_type: String,
        fields: Map<String, Value>,
        auth: CrmAuth,
    ) -> Result<String, CrmError>;

    async fn query(&self, soql: String, auth: CrmAuth) -> Result<QueryResult, CrmError>;

    async fn update_object(
        &self,
        id: String,
        object_type: String,
        fields: Map<String, Value>,
        auth: CrmAuth,
    ) -> Result<(), CrmError>;

    async fn delete_object(
        &self,
        object_type: String,
        id: String,
        auth: CrmAuth,
    ) -> Result<(), CrmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("Failed to sign Salesforce assertion: {0}")]
    Assertion(#[from] jsonwebtoken::errors::Error),

    #[error("Salesforce request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Salesforce rejected a duplicate value: {0}")]
    DuplicateValue(String),

    #[error("Salesforce returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Unexpected Salesforce response: {0}")]
    UnexpectedResponse(String),
}

impl CrmError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateValue(_))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: Option<String>,
}

pub struct SalesforceClient {
    http: reqwest::Client,
    login_url: String,
    client_id: String,
    subject: String,
    key: EncodingKey,
    api_version: String,
}

impl SalesforceClient {
    pub fn new(config: &SalesforceConfig, timeout: Duration) -> Result<Self, CrmError> {
        let key = EncodingKey::from_rsa_pem(config.client_key.as_bytes())?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            login_url: config.audience.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            subject: config.subject.clone(),
            key,
            api_version: config.api_version.clone(),
        })
    }

    fn assertion(&self) -> Result<String, CrmError> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let claims = AssertionClaims {
            iss: &self.client_id,
            sub: &self.subject,
            aud: &self.login_url,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }

    fn sobject_url(&self, auth: &CrmAuth, path: &str) -> String {
        format!(
            "{}/services/data/{}/{}",
            auth.instance_url.trim_end_matches('/'),
            self.api_version,
            path
        )
    }
}

/// Passes successful responses through; maps failures to [`CrmError`].
async fn checked(response: reqwest::Response) -> Result<reqwest::Response, CrmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if DUPLICATE_MARKERS.iter().any(|marker| body.contains(marker)) {
        return Err(CrmError::DuplicateValue(body));
    }
    warn!(status = status.as_u16(), body = %body, "Salesforce request failed");
    Err(CrmError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CrmApi for SalesforceClient {
    async fn authenticate(&self) -> Result<CrmAuth, CrmError> {
        debug!(client_id = %self.client_id, "Requesting Salesforce access token");
        let assertion = self.assertion()?;
        let response = self
            .http
            .post(format!("{}/services/oauth2/token", self.login_url))
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        Ok(checked(response).await?.json().await?)
    }

    async fn create_object(
        &self,
        object_type: String,
        fields: Map<String, Value>,
        auth: CrmAuth,
    ) -> Result<String, CrmError> {
        let response = self
            .http
            .post(self.sobject_url(&auth, &format!("sobjects/{}", object_type)))
            .bearer_auth(&auth.access_token)
            .json(&fields)
            .send()
            .await?;

        let created: CreateResponse = checked(response).await?.json().await?;
        created.id.ok_or_else(|| {
            CrmError::UnexpectedResponse(format!("no id returned for new {}", object_type))
        })
    }

    async fn query(&self, soql: String, auth: CrmAuth) -> Result<QueryResult, CrmError> {
        let response = self
            .http
            .get(self.sobject_url(&auth, "query"))
            .bearer_auth(&auth.access_token)
            .query(&[("q", soql.as_str())])
            .send()
            .await?;

        Ok(checked(response).await?.json().await?)
    }

    async fn update_object(
        &self,
        id: String,
        object_type: String,
        fields: Map<String, Value>,
        auth: CrmAuth,
    ) -> Result<(), CrmError> {
        let response = self
            .http
            .patch(self.sobject_url(&auth, &format!("sobjects/{}/{}", object_type, id)))
            .bearer_auth(&auth.access_token)
            .json(&fields)
            .send()
            .await?;

        checked(response).await?;
        Ok(())
    }

    async fn delete_object(
        &self,
        object_type: String,
        id: String,
        auth: CrmAuth,
    ) -> Result<(), CrmError> {
        let response = self
            .http
            .delete(self.sobject_url(&auth, &format!("sobjects/{}/{}", object_type, id)))
            .bearer_auth(&auth.access_token)
            .send()
            .await?;

        checked(response).await?;
        Ok(())
    }
}
