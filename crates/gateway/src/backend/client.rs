//! HTTP calls to the backend conversation API, with retries.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use http::StatusCode;
use reqwest::{Client, header};
use secrecy::ExposeSecret;
use url::Url;

use super::envelope::CodeWhispererRequest;
use crate::{
    auth::{Credential, TokenStore},
    error::{GatewayError, GatewayResult},
};

const USER_AGENT: &str = "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser#unknown_unknown api/codewhisperer#3.738.0 m/E KiroIDE";

/// Error bodies are cut to this many characters before they reach clients.
const MAX_ERROR_BODY_CHARS: usize = 500;

pub(crate) type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Network-level failures. All of them are retried.
#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Network(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

/// A response whose body has not been read yet.
pub(crate) struct TransportResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

#[async_trait]
pub(crate) trait BackendTransport: Send + Sync {
    async fn send(
        &self,
        request: &CodeWhispererRequest,
        credential: &Credential,
    ) -> Result<TransportResponse, TransportError>;
}

pub(crate) struct ReqwestTransport {
    client: Client,
    endpoint: Url,
}

impl ReqwestTransport {
    pub fn new(config: &config::BackendConfig) -> anyhow::Result<Self> {
        let client = crate::http_client::client_builder(USER_AGENT)
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl BackendTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &CodeWhispererRequest,
        credential: &Credential,
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", credential.access_token.expose_secret()),
            )
            .header("x-amzn-codewhisperer-optout", "true")
            .json(request)
            .send()
            .await?;

        Ok(TransportResponse {
            status: response.status(),
            body: response.bytes_stream().map(|chunk| chunk.map_err(TransportError::from)).boxed(),
        })
    }
}

enum AttemptError {
    /// 5xx, timeouts and transient credential failures.
    Retryable(String),
    /// 401/403: the credential was refused.
    Unauthorized { status: StatusCode, message: String },
    Fatal(GatewayError),
}

/// Sends envelopes to the backend following the retry schedule.
pub(crate) struct BackendClient {
    transport: Arc<dyn BackendTransport>,
    tokens: TokenStore,
    retry_delays: Vec<Duration>,
}

impl BackendClient {
    pub fn new(transport: Arc<dyn BackendTransport>, tokens: TokenStore, retry_delays: Vec<Duration>) -> Self {
        Self {
            transport,
            tokens,
            retry_delays,
        }
    }

    /// Returns the body of the first successful response.
    ///
    /// 5xx responses, timeouts and connection failures are retried after each
    /// delay of the schedule in turn. A refused credential is refreshed and the
    /// request repeated once, outside of the schedule.
    pub async fn send(&self, request: &CodeWhispererRequest) -> GatewayResult<ByteStream> {
        let mut attempts = 0;
        let mut retries = 0;
        let mut reauthenticated = false;

        loop {
            attempts += 1;

            let message = match self.attempt(request).await {
                Ok(body) => return Ok(body),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Unauthorized { status, message }) => {
                    if reauthenticated {
                        return Err(GatewayError::BackendRejected {
                            status: status.as_u16(),
                            message,
                        });
                    }

                    log::warn!("Backend refused the access token ({status}), refreshing and retrying once");

                    self.tokens.invalidate().await;
                    reauthenticated = true;

                    continue;
                }
                Err(AttemptError::Retryable(message)) => message,
            };

            let Some(delay) = self.retry_delays.get(retries) else {
                log::error!("Backend request failed after {attempts} attempts: {message}");
                return Err(GatewayError::Backend { attempts, message });
            };

            retries += 1;

            log::warn!(
                "Backend request failed ({message}), retry {retries}/{} in {delay:?}",
                self.retry_delays.len()
            );

            tokio::time::sleep(*delay).await;
        }
    }

    async fn attempt(&self, request: &CodeWhispererRequest) -> Result<ByteStream, AttemptError> {
        let credential = match self.tokens.get_valid_credential().await {
            Ok(credential) => credential,
            Err(error) if error.is_transient() => return Err(AttemptError::Retryable(error.to_string())),
            Err(error) => return Err(AttemptError::Fatal(error.into())),
        };

        let mut request = request.clone();
        request.profile_arn = credential.profile_arn.clone();

        let response = self
            .transport
            .send(&request, &credential)
            .await
            .map_err(|error| AttemptError::Retryable(error.to_string()))?;

        let status = response.status;

        if status.is_success() {
            log::debug!("Backend accepted the request with status {status}");
            return Ok(response.body);
        }

        let message = read_error_body(response.body).await;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AttemptError::Unauthorized { status, message });
        }

        if status.is_server_error() {
            return Err(AttemptError::Retryable(format!("{status}: {message}")));
        }

        log::debug!("Backend rejected the request with status {status}: {message}");

        Err(AttemptError::Fatal(GatewayError::BackendRejected {
            status: status.as_u16(),
            message,
        }))
    }
}

async fn read_error_body(mut body: ByteStream) -> String {
    let mut bytes = Vec::new();

    while let Some(Ok(chunk)) = body.next().await {
        bytes.extend_from_slice(&chunk);

        if bytes.len() > MAX_ERROR_BODY_CHARS * 4 {
            break;
        }
    }

    String::from_utf8_lossy(&bytes).chars().take(MAX_ERROR_BODY_CHARS).collect()
}
