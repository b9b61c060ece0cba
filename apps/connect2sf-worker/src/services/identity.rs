//! Client for the identity service's user lookup API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::IdentityConfig;

/// Profile fields the CRM lead is built from.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub handle: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Exchanges the client credentials for a bearer token.
    async fn authenticate(&self) -> Result<String, IdentityError>;

    /// Fetches a user. Authenticates first when no token is given.
    async fn get_user(
        &self,
        user_id: String,
        token: Option<String>,
    ) -> Result<UserProfile, IdentityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Identity service returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Serialize)]
struct AuthorizationRequest<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
    secret: &'a str,
}

#[derive(Deserialize)]
struct Token {
    token: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: EnvelopeResult<T>,
}

#[derive(Deserialize)]
struct EnvelopeResult<T> {
    content: T,
}

pub struct IdentityClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl IdentityClient {
    pub fn new(config: &IdentityConfig, timeout: Duration) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    async fn content<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, IdentityError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.result.content)
    }
}

#[async_trait]
impl IdentityApi for IdentityClient {
    async fn authenticate(&self) -> Result<String, IdentityError> {
        debug!(client_id = %self.client_id, "Authenticating with identity service");
        let response = self
            .http
            .post(format!("{}/v3/authorization", self.base_url))
            .json(&AuthorizationRequest {
                client_id: &self.client_id,
                secret: &self.client_secret,
            })
            .send()
            .await?;

        let token: Token = Self::content(response).await?;
        Ok(token.token)
    }

    async fn get_user(
        &self,
        user_id: String,
        token: Option<String>,
    ) -> Result<UserProfile, IdentityError> {
        let token = match token {
            Some(token) => token,
            None => self.authenticate().await?,
        };

        debug!(user_id = %user_id, "Fetching user from identity service");
        let response = self
            .http
            .get(format!("{}/v3/users/{}", self.base_url, user_id))
            .bearer_auth(token)
            .send()
            .await?;

        Self::content(response).await
    }
}
