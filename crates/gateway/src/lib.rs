//! OpenAI and Anthropic compatible endpoints in front of the Kiro backend.

use std::convert::Infallible;

use axum::{
    Router,
    extract::{Json, State},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::{StreamExt, stream};
use indexmap::IndexMap;
use messages::{
    anthropic, openai,
    unified::{self, ChatOutcome, to_anthropic::AnthropicStreamEncoder, to_openai::OpenAiStreamEncoder},
};
use serde::Serialize;

mod auth;
mod backend;
mod error;
mod http_client;
mod messages;
mod sanitizer;
mod server;
mod token_counter;

pub use backend::{InputSchema, ToolSpecification};
pub use error::{AnthropicResult, AuthError, GatewayError, GatewayResult as Result};
pub use server::{Gateway, HealthChecks, HealthReport, HealthStatus, TokenCheck};

/// Creates an axum router for the chat endpoints of the enabled dialects.
pub fn router(gateway: Gateway, config: &config::Config) -> Router {
    let protocols = &config.server.protocols;
    let mut mounts = IndexMap::new();

    if protocols.openai.enabled {
        let openai_routes = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/models", get(list_models))
            .with_state(gateway.clone());

        add_mount(&mut mounts, &protocols.openai.path, openai_routes);
    }

    if protocols.anthropic.enabled {
        let anthropic_routes = Router::new()
            .route("/v1/messages", post(anthropic_messages))
            .route("/v1/messages/count_tokens", post(count_tokens))
            .with_state(gateway.clone());

        add_mount(&mut mounts, &protocols.anthropic.path, anthropic_routes);
    }

    let router = mounts.into_iter().fold(Router::new(), |router, (path, routes)| {
        // axum cannot nest at the root.
        if path.is_empty() {
            router.merge(routes)
        } else {
            router.nest(&path, routes)
        }
    });

    router.route("/v1/tools", get(loaded_tools).with_state(gateway))
}

/// Dialects sharing a prefix are merged and nested once.
fn add_mount(mounts: &mut IndexMap<String, Router>, path: &str, routes: Router) {
    let path = path.trim_end_matches('/').to_string();

    let routes = match mounts.swap_remove(&path) {
        Some(mounted) => mounted.merge(routes),
        None => routes,
    };

    mounts.insert(path, routes);
}

/// Handle chat completion requests.
///
/// When `stream: true` is set in the request, the response is sent as
/// Server-Sent Events (SSE) terminated by `data: [DONE]`. Otherwise, a
/// standard JSON response is returned.
async fn chat_completions(
    State(gateway): State<Gateway>,
    Sonic(request): Sonic<openai::ChatCompletionRequest>,
) -> Result<Response> {
    log::debug!(
        "OpenAI chat completions handler called for model: {} ({} messages)",
        request.model,
        request.messages.len()
    );

    let request = unified::UnifiedRequest::from(request);
    let include_usage = request.include_usage;

    match server::with_id(gateway.handle_chat(request).await?, "chatcmpl-") {
        ChatOutcome::Complete(response) => {
            let response = openai::ChatCompletionResponse::from(response);
            Ok(Json(response).into_response())
        }
        ChatOutcome::Stream(response) => {
            let mut encoder = OpenAiStreamEncoder::new(response.id, response.model, response.created, include_usage);

            let event_stream = response
                .chunks
                .flat_map(move |chunk| stream::iter(encoder.encode(chunk)))
                .map(|chunk| Ok::<_, Infallible>(Event::default().data(to_json(&chunk))));

            let with_done = event_stream.chain(stream::once(async {
                Ok::<_, Infallible>(Event::default().data("[DONE]"))
            }));

            log::debug!("Returning streaming response");
            Ok(Sse::new(with_done).into_response())
        }
    }
}

async fn list_models(State(gateway): State<Gateway>) -> Json<openai::ModelsResponse> {
    let response = gateway.models();

    log::debug!("Returning {} models", response.data.len());
    Json(response)
}

/// Handle Anthropic messages requests.
///
/// Streaming responses use named SSE events and end with `message_stop`, or
/// with an `error` event when the backend fails mid-stream.
async fn anthropic_messages(
    State(gateway): State<Gateway>,
    Sonic(request): Sonic<anthropic::AnthropicChatRequest>,
) -> AnthropicResult<Response> {
    log::debug!(
        "Anthropic messages handler called for model: {} ({} messages)",
        request.model,
        request.messages.len()
    );

    let request = unified::UnifiedRequest::from(request);

    match server::with_id(gateway.handle_chat(request).await?, "msg_") {
        ChatOutcome::Complete(response) => {
            let response = anthropic::AnthropicChatResponse::from(response);
            Ok(Json(response).into_response())
        }
        ChatOutcome::Stream(response) => {
            let mut encoder = AnthropicStreamEncoder::new(response.id, response.model, response.prompt_tokens);
            let start = encoder.start();

            let events = stream::once(async move { start })
                .chain(response.chunks.flat_map(move |chunk| stream::iter(encoder.encode(chunk))))
                .map(|event| {
                    let sse = Event::default().event(event.event_name()).data(to_json(&event));
                    Ok::<_, Infallible>(sse)
                });

            log::debug!("Returning Anthropic streaming response");
            Ok(Sse::new(events).into_response())
        }
    }
}

async fn count_tokens(
    State(gateway): State<Gateway>,
    Sonic(request): Sonic<anthropic::AnthropicChatRequest>,
) -> Json<anthropic::CountTokensResponse> {
    let request = unified::UnifiedRequest::from(request);
    let input_tokens = gateway.count_tokens(&request);

    Json(anthropic::CountTokensResponse { input_tokens })
}

async fn loaded_tools(State(gateway): State<Gateway>) -> Json<Vec<ToolSpecification>> {
    Json(gateway.loaded_tool_specs().await)
}

fn to_json<T: Serialize>(value: &T) -> String {
    sonic_rs::to_string(value).unwrap_or_else(|e| {
        log::error!("Failed to serialize streaming event: {e}");
        r#"{"error":"serialization failed"}"#.to_string()
    })
}
