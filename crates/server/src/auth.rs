//! Client API key check in front of the dialect routes.

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{body::Body, response::IntoResponse};
use gateway::GatewayError;
use http::{HeaderMap, Request, Response, header};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tower::Layer;

#[derive(Clone)]
pub(crate) struct ApiKeyLayer(Arc<ApiKeyLayerInner>);

struct ApiKeyLayerInner {
    api_key: Option<SecretString>,
}

impl ApiKeyLayer {
    pub fn new(api_key: Option<SecretString>) -> Self {
        Self(Arc::new(ApiKeyLayerInner { api_key }))
    }
}

impl<Service> Layer<Service> for ApiKeyLayer
where
    Service: Send + Clone,
{
    type Service = ApiKeyService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        ApiKeyService {
            next,
            layer: self.0.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ApiKeyService<Service> {
    next: Service,
    layer: Arc<ApiKeyLayerInner>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for ApiKeyService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let layer = self.layer.clone();

        Box::pin(async move {
            let Some(api_key) = layer.api_key.as_ref() else {
                return next.call(req).await;
            };

            match presented_key(req.headers()) {
                Some(presented) if keys_match(presented, api_key) => next.call(req).await,
                Some(_) => {
                    log::debug!("Rejecting {} {}: invalid API key", req.method(), req.uri().path());
                    Ok(unauthorized("Invalid API key"))
                }
                None => {
                    log::debug!("Rejecting {} {}: no API key", req.method(), req.uri().path());
                    Ok(unauthorized("Missing API key, send it as a Bearer token or in x-api-key"))
                }
            }
        })
    }
}

/// The key from `Authorization: Bearer` or, failing that, `x-api-key`.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|value| value.to_str().ok()))
        .map(str::trim)
}

fn keys_match(presented: &str, expected: &SecretString) -> bool {
    let expected = expected.expose_secret().as_bytes();
    presented.len() == expected.len() && bool::from(presented.as_bytes().ct_eq(expected))
}

fn unauthorized(message: &str) -> Response<Body> {
    GatewayError::Unauthorized(message.to_string()).into_response()
}
