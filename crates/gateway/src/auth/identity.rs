//! Refresh-token exchange with the OIDC identity provider.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use super::store::ClientRegistration;
use crate::error::AuthError;

pub(crate) const USER_AGENT: &str = "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser#unknown_unknown api/sso-oidc#3.738.0 m/E KiroIDE";

/// Result of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: SecretString,
    /// Present when the provider rotated the refresh token.
    pub refresh_token: Option<SecretString>,
    pub expires_in: i64,
    pub profile_arn: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn refresh(
        &self,
        registration: &ClientRegistration,
        refresh_token: &SecretString,
    ) -> Result<RefreshedToken, AuthError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: SecretString,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    refresh_token: Option<SecretString>,
    profile_arn: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

pub struct OidcProvider {
    client: Client,
    url: Url,
}

impl OidcProvider {
    pub fn new(client: Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    async fn refresh(
        &self,
        registration: &ClientRegistration,
        refresh_token: &SecretString,
    ) -> Result<RefreshedToken, AuthError> {
        let body = RefreshRequest {
            client_id: &registration.client_id,
            client_secret: registration.client_secret.expose_secret(),
            grant_type: "refresh_token",
            refresh_token: refresh_token.expose_secret(),
        };

        let response = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|error| AuthError::Transient(error.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("{status}: {}", text.chars().take(200).collect::<String>());

            return Err(classify_failure(status, message));
        }

        let response: RefreshResponse = response
            .json()
            .await
            .map_err(|error| AuthError::Transient(format!("invalid refresh response: {error}")))?;

        Ok(RefreshedToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_in: response.expires_in,
            profile_arn: response.profile_arn,
        })
    }
}

fn classify_failure(status: StatusCode, message: String) -> AuthError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AuthError::Transient(message)
    } else {
        AuthError::Rejected(message)
    }
}
