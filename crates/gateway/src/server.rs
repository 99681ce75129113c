use std::{collections::HashSet, sync::Arc};

use config::{BackendConfig, Config, SanitizerConfig};
use futures::{StreamExt, stream::BoxStream};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::DropGuard;

use crate::{
    auth::TokenStore,
    backend::{
        AggregatedEvent, BackendClient, BackendEvents, BackendTransport, CompletedToolCall, ReqwestTransport,
        RequestTranslator, ToolSpecification, continuation_request, decode_events,
    },
    error::{GatewayError, GatewayResult},
    messages::{
        openai::{Model, ModelsResponse, ObjectType},
        unified::{
            ChatOutcome, ChatStream, UnifiedChunk, UnifiedChunkStream, UnifiedContent, UnifiedFinishReason,
            UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedToolCall, UnifiedUsage,
            response_id, unix_timestamp,
        },
    },
    sanitizer::{self, StreamSanitizer},
    token_counter,
};

/// Context usage share above which a response without tool calls counts as cut off.
const TRUNCATION_THRESHOLD: f64 = 0.95;

/// The gateway core. Cheap to clone; all clones share one backend client,
/// credential cache and tool registry.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<GatewayInner>,
}

struct GatewayInner {
    backend: BackendConfig,
    sanitizer: SanitizerConfig,
    client: BackendClient,
    tokens: TokenStore,
    /// Latest definition of every tool seen in a request, by name.
    tool_specs: RwLock<IndexMap<String, ToolSpecification>>,
    /// Stops the background credential refresher with the last clone.
    _refresher: Option<DropGuard>,
}

/// Backend output after built-in tool filtering and continuation, before
/// sanitizing and dialect encoding.
enum Step {
    Text(String),
    ToolCall(CompletedToolCall),
    Finish { truncated: bool },
}

type Steps = BoxStream<'static, Result<Step, GatewayError>>;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub token: TokenCheck,
}

#[derive(Debug, Serialize)]
pub struct TokenCheck {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<jiff::Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Gateway {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        token_counter::preload();

        let tokens = TokenStore::new(&config.auth, config.backend.profile_arn.clone());
        let transport = ReqwestTransport::new(&config.backend)?;

        Ok(Self::with_parts(config, tokens, Arc::new(transport)))
    }

    pub(crate) fn with_parts(config: &Config, tokens: TokenStore, transport: Arc<dyn BackendTransport>) -> Self {
        let refresher = config.auth.refresh_interval.map(|interval| {
            log::info!("Refreshing the backend credential every {interval:?}");

            let shutdown = tokio_util::sync::CancellationToken::new();
            tokens.spawn_refresher(interval, shutdown.clone());

            shutdown.drop_guard()
        });

        let client = BackendClient::new(transport, tokens.clone(), config.backend.retry_delays.clone());

        Self {
            shared: Arc::new(GatewayInner {
                backend: config.backend.clone(),
                sanitizer: config.sanitizer.clone(),
                client,
                tokens,
                tool_specs: RwLock::new(IndexMap::new()),
                _refresher: refresher,
            }),
        }
    }

    /// Runs a chat request against the backend.
    ///
    /// Validation, credential and connection failures are returned as errors.
    /// Once the backend accepted the request, failures of a streamed response
    /// end the stream with [`UnifiedChunk::Error`] instead.
    pub async fn handle_chat(&self, request: UnifiedRequest) -> GatewayResult<ChatOutcome> {
        let translated = self.shared.translator().translate(&request)?;
        self.register_tools(&translated.tool_specs).await;

        let prompt_tokens = token_counter::count_request(&request);
        let model = self.public_model(&request.model);

        log::debug!(
            "Chat request for model '{model}': {} messages, {} tools, streaming: {}",
            request.messages.len(),
            translated.tool_specs.len(),
            request.stream
        );

        let body = self.shared.client.send(&translated.envelope).await?;

        let stream = request.stream;
        let steps = self.steps(request, translated.declared_tools, decode_events(body));

        if stream {
            let chunks = encode_chunks(steps, self.shared.sanitizer.enabled, prompt_tokens);

            Ok(ChatOutcome::Stream(ChatStream {
                id: String::new(),
                model,
                created: unix_timestamp(),
                prompt_tokens,
                chunks,
            }))
        } else {
            let response = self.collect(steps, model, prompt_tokens).await?;
            Ok(ChatOutcome::Complete(response))
        }
    }

    /// Tool definitions seen in requests so far, latest definition per name.
    pub async fn loaded_tool_specs(&self) -> Vec<ToolSpecification> {
        self.shared.tool_specs.read().await.values().cloned().collect()
    }

    pub fn models(&self) -> ModelsResponse {
        let created = unix_timestamp();

        let data = self
            .shared
            .backend
            .public_models()
            .into_iter()
            .map(|id| Model {
                id: id.to_string(),
                object: ObjectType::Model,
                created,
                owned_by: "anthropic".to_string(),
            })
            .collect();

        ModelsResponse {
            object: ObjectType::List,
            data,
        }
    }

    /// Prompt token estimate of a request as the client sent it.
    pub fn count_tokens(&self, request: &UnifiedRequest) -> u32 {
        token_counter::count_request(request)
    }

    /// Whether a valid backend credential can be obtained right now.
    pub async fn health(&self) -> HealthReport {
        let token = match self.shared.tokens.get_valid_credential().await {
            Ok(credential) => TokenCheck {
                status: HealthStatus::Ok,
                expires_at: Some(credential.expires_at),
                error: None,
            },
            Err(error) => {
                log::warn!("Health check could not obtain a backend credential: {error}");

                // Last known expiry, if a credential was ever cached.
                let expires_at = self
                    .shared
                    .tokens
                    .current_credential_snapshot()
                    .await
                    .map(|credential| credential.expires_at);

                TokenCheck {
                    status: HealthStatus::Error,
                    expires_at,
                    error: Some("token_refresh_failed".to_string()),
                }
            }
        };

        let status = match token.status {
            HealthStatus::Ok => HealthStatus::Ok,
            _ => HealthStatus::Degraded,
        };

        HealthReport {
            status,
            checks: HealthChecks { token },
        }
    }

    fn public_model(&self, requested: &str) -> String {
        if requested.is_empty() {
            self.shared.backend.default_model.clone()
        } else {
            requested.to_string()
        }
    }

    async fn register_tools(&self, specs: &[ToolSpecification]) {
        if specs.is_empty() {
            return;
        }

        let mut registry = self.shared.tool_specs.write().await;

        for spec in specs {
            registry.insert(spec.name.clone(), spec.clone());
        }
    }

    /// Backend events of the first response and of every continuation round,
    /// as one sequence ending in [`Step::Finish`] or an error.
    fn steps(&self, request: UnifiedRequest, declared_tools: HashSet<String>, first: BackendEvents) -> Steps {
        let shared = self.shared.clone();

        let stream = async_stream::stream! {
            let mut events = first;
            let mut text = String::new();
            let mut tool_calls = 0;
            let mut continuations = 0;

            loop {
                let mut context_usage = None;

                while let Some(event) = events.next().await {
                    match event {
                        Ok(AggregatedEvent::Text(delta)) => {
                            text.push_str(&delta);
                            yield Ok(Step::Text(delta));
                        }
                        Ok(AggregatedEvent::ToolCallComplete(call)) => {
                            if sanitizer::is_builtin_tool(&call.name) && !declared_tools.contains(&call.name) {
                                log::warn!("Dropping call to backend-only tool '{}' ({})", call.name, call.id);
                                continue;
                            }

                            if call.malformed_input {
                                log::warn!(
                                    "Tool call '{}' ({}) has input that is not valid JSON, forwarding it as raw text",
                                    call.name,
                                    call.id
                                );
                            }

                            tool_calls += 1;
                            yield Ok(Step::ToolCall(call));
                        }
                        Ok(AggregatedEvent::ContextUsage(usage)) => context_usage = Some(usage),
                        Ok(AggregatedEvent::Exception { kind, message }) => {
                            log::error!("Backend reported {kind}: {message}");
                            yield Err(GatewayError::UpstreamException { kind, message });
                            return;
                        }
                        Ok(AggregatedEvent::End) => break,
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                }

                let truncated = tool_calls == 0 && context_usage.is_some_and(is_length_limited);

                if !truncated {
                    yield Ok(Step::Finish { truncated: false });
                    return;
                }

                if continuations >= shared.backend.max_continuations {
                    log::warn!("Response still truncated after {continuations} continuations, returning it as is");
                    yield Ok(Step::Finish { truncated: true });
                    return;
                }

                continuations += 1;

                log::info!(
                    "Response cut off by the output limit, continuing ({continuations}/{})",
                    shared.backend.max_continuations
                );

                let continued = continuation_request(&request, &text);

                let body = match shared.translator().translate(&continued) {
                    Ok(translated) => shared.client.send(&translated.envelope).await,
                    Err(error) => Err(error),
                };

                match body {
                    Ok(body) => events = decode_events(body),
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }
        };

        stream.boxed()
    }

    async fn collect(&self, mut steps: Steps, model: String, prompt_tokens: u32) -> GatewayResult<UnifiedResponse> {
        let mut text = String::new();
        let mut calls = Vec::new();
        let mut truncated = false;

        while let Some(step) = steps.next().await {
            match step? {
                Step::Text(delta) => text.push_str(&delta),
                Step::ToolCall(call) => calls.push(call),
                Step::Finish { truncated: still_truncated } => truncated = still_truncated,
            }
        }

        if self.shared.sanitizer.enabled {
            text = sanitizer::sanitize_text(&text);
        }

        let mut completion_tokens = token_counter::count_text(&text);
        let mut content = Vec::with_capacity(calls.len() + 1);

        if !text.is_empty() {
            content.push(UnifiedContent::Text { text });
        }

        let finish_reason = finish_reason(!calls.is_empty(), truncated);

        for call in calls {
            let input = call.public_arguments();
            completion_tokens += token_counter::count_text(&call.name) + token_counter::count_text(&input.to_string());

            content.push(UnifiedContent::ToolUse {
                id: call.id,
                name: call.name,
                input,
            });
        }

        Ok(UnifiedResponse {
            id: String::new(),
            model,
            created: unix_timestamp(),
            message: UnifiedMessage {
                role: UnifiedRole::Assistant,
                content,
            },
            finish_reason,
            usage: UnifiedUsage::new(prompt_tokens, completion_tokens),
        })
    }
}

impl GatewayInner {
    fn translator(&self) -> RequestTranslator<'_> {
        RequestTranslator::new(&self.backend, self.sanitizer.identity_override)
    }
}

#[cfg(test)]
impl Gateway {
    /// A gateway over a scripted backend and a credential valid for an hour.
    pub(crate) fn scripted(
        config: &Config,
        responses: Vec<crate::backend::ScriptedResponse>,
    ) -> (Self, Arc<crate::backend::ScriptedTransport>) {
        use std::time::Duration;

        use jiff::{SignedDuration, Timestamp};

        use crate::auth::test_support::{MemoryCredentialStore, ScriptedProvider};

        let transport = Arc::new(crate::backend::ScriptedTransport::new(responses));

        let expires_at = Timestamp::now().checked_add(SignedDuration::from_hours(1)).unwrap();
        let store = Arc::new(MemoryCredentialStore::new("access-0", expires_at));
        let tokens = TokenStore::with_parts(store, Arc::new(ScriptedProvider::new([])), Duration::from_secs(300), None);

        (Self::with_parts(config, tokens, transport.clone()), transport)
    }
}

/// Turns steps into unified chunks, scrubbing text as it streams.
fn encode_chunks(mut steps: Steps, sanitize: bool, prompt_tokens: u32) -> UnifiedChunkStream {
    let stream = async_stream::stream! {
        let mut sanitizer = StreamSanitizer::new(sanitize);
        let mut completion_tokens = 0;
        let mut tool_calls = 0;

        while let Some(step) = steps.next().await {
            match step {
                Ok(Step::Text(delta)) => {
                    let text = sanitizer.push(&delta);

                    if !text.is_empty() {
                        completion_tokens += token_counter::count_text(&text);
                        yield UnifiedChunk::Text(text);
                    }
                }
                Ok(Step::ToolCall(call)) => {
                    if let Some(chunk) = flush(&mut sanitizer, &mut completion_tokens) {
                        yield chunk;
                    }

                    let arguments = call.public_arguments().to_string();
                    completion_tokens += token_counter::count_text(&call.name) + token_counter::count_text(&arguments);

                    yield UnifiedChunk::ToolCall(UnifiedToolCall {
                        index: tool_calls,
                        id: call.id,
                        name: call.name,
                        arguments,
                    });

                    tool_calls += 1;
                }
                Ok(Step::Finish { truncated }) => {
                    if let Some(chunk) = flush(&mut sanitizer, &mut completion_tokens) {
                        yield chunk;
                    }

                    yield UnifiedChunk::Finish {
                        finish_reason: finish_reason(tool_calls > 0, truncated),
                        usage: UnifiedUsage::new(prompt_tokens, completion_tokens),
                    };

                    return;
                }
                Err(error) => {
                    if let Some(chunk) = flush(&mut sanitizer, &mut completion_tokens) {
                        yield chunk;
                    }

                    log::error!("Streaming response failed: {error}");
                    yield UnifiedChunk::Error { message: error.client_message() };

                    return;
                }
            }
        }
    };

    Box::pin(stream)
}

fn flush(sanitizer: &mut StreamSanitizer, completion_tokens: &mut u32) -> Option<UnifiedChunk> {
    let text = sanitizer.finish();

    if text.is_empty() {
        return None;
    }

    *completion_tokens += token_counter::count_text(&text);
    Some(UnifiedChunk::Text(text))
}

fn finish_reason(has_tool_calls: bool, truncated: bool) -> UnifiedFinishReason {
    if has_tool_calls {
        UnifiedFinishReason::ToolCalls
    } else if truncated {
        UnifiedFinishReason::Length
    } else {
        UnifiedFinishReason::Stop
    }
}

/// The backend reports usage either as a fraction or as a percentage.
fn is_length_limited(usage: f64) -> bool {
    let share = if usage > 1.0 { usage / 100.0 } else { usage };
    share > TRUNCATION_THRESHOLD
}

/// Assigns the dialect-specific response id.
pub(crate) fn with_id(mut outcome: ChatOutcome, prefix: &str) -> ChatOutcome {
    let id = response_id(prefix);

    match &mut outcome {
        ChatOutcome::Complete(response) => response.id = id,
        ChatOutcome::Stream(stream) => stream.id = id,
    }

    outcome
}
