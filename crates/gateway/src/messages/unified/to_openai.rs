//! Conversions from unified types to OpenAI protocol types.

use itertools::Itertools;

use crate::messages::{openai, unified};

/// Argument strings are streamed in pieces of at most this many characters.
const ARGUMENT_CHUNK_CHARS: usize = 40;

impl From<unified::UnifiedResponse> for openai::ChatCompletionResponse {
    fn from(resp: unified::UnifiedResponse) -> Self {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in resp.message.content {
            match block {
                unified::UnifiedContent::Text { text: part } => text.push_str(&part),
                unified::UnifiedContent::ToolUse { id, name, input } => tool_calls.push(openai::ToolCall {
                    id,
                    tool_type: openai::ToolCallType::Function,
                    function: openai::FunctionCall {
                        name,
                        arguments: input.to_string(),
                    },
                }),
                unified::UnifiedContent::Image { .. } | unified::UnifiedContent::ToolResult { .. } => {}
            }
        }

        let content = if text.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(text)
        };

        Self {
            id: resp.id,
            object: openai::ObjectType::ChatCompletion,
            created: resp.created,
            model: resp.model,
            choices: vec![openai::ChatChoice {
                index: 0,
                message: openai::ResponseMessage {
                    role: openai::ChatRole::Assistant,
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: openai::FinishReason::from(resp.finish_reason),
            }],
            usage: openai::Usage::from(resp.usage),
        }
    }
}

impl From<unified::UnifiedFinishReason> for openai::FinishReason {
    fn from(reason: unified::UnifiedFinishReason) -> Self {
        match reason {
            unified::UnifiedFinishReason::Stop => openai::FinishReason::Stop,
            unified::UnifiedFinishReason::Length => openai::FinishReason::Length,
            unified::UnifiedFinishReason::ToolCalls => openai::FinishReason::ToolCalls,
        }
    }
}

impl From<unified::UnifiedUsage> for openai::Usage {
    fn from(usage: unified::UnifiedUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// Turns unified chunks into `chat.completion.chunk` objects.
///
/// One unified chunk can expand to several wire chunks: a tool call becomes a
/// start chunk plus its argument pieces, a finish may be followed by a
/// usage-only chunk.
pub(crate) struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: u64,
    include_usage: bool,
    sent_role: bool,
}

impl OpenAiStreamEncoder {
    pub fn new(id: String, model: String, created: u64, include_usage: bool) -> Self {
        Self {
            id,
            model,
            created,
            include_usage,
            sent_role: false,
        }
    }

    pub fn encode(&mut self, chunk: unified::UnifiedChunk) -> Vec<openai::ChatCompletionChunk> {
        match chunk {
            unified::UnifiedChunk::Text(text) => {
                let delta = openai::ChatMessageDelta {
                    content: Some(text),
                    ..Default::default()
                };

                vec![self.chunk(delta, None)]
            }
            unified::UnifiedChunk::ToolCall(call) => {
                let mut chunks = Vec::new();

                let start = openai::StreamingToolCall::Start {
                    index: call.index,
                    id: call.id,
                    r#type: openai::ToolCallType::Function,
                    function: openai::FunctionStart {
                        name: call.name,
                        arguments: String::new(),
                    },
                };

                chunks.push(self.chunk(tool_call_delta(start), None));

                let pieces = call.arguments.chars().chunks(ARGUMENT_CHUNK_CHARS);

                for piece in &pieces {
                    let delta = openai::StreamingToolCall::Delta {
                        index: call.index,
                        function: openai::FunctionDelta {
                            arguments: piece.collect(),
                        },
                    };

                    chunks.push(self.chunk(tool_call_delta(delta), None));
                }

                chunks
            }
            unified::UnifiedChunk::Finish { finish_reason, usage } => {
                let mut chunks = vec![self.chunk(
                    openai::ChatMessageDelta::default(),
                    Some(openai::FinishReason::from(finish_reason)),
                )];

                if self.include_usage {
                    chunks.push(openai::ChatCompletionChunk {
                        id: self.id.clone(),
                        object: openai::ObjectType::ChatCompletionChunk,
                        created: self.created,
                        model: self.model.clone(),
                        choices: Vec::new(),
                        usage: Some(openai::Usage::from(usage)),
                    });
                }

                chunks
            }
            unified::UnifiedChunk::Error { message } => {
                let delta = openai::ChatMessageDelta {
                    content: Some(format!("\n\n[Error: {message}]")),
                    ..Default::default()
                };

                vec![
                    self.chunk(delta, None),
                    self.chunk(openai::ChatMessageDelta::default(), Some(openai::FinishReason::Stop)),
                ]
            }
        }
    }

    fn chunk(
        &mut self,
        mut delta: openai::ChatMessageDelta,
        finish_reason: Option<openai::FinishReason>,
    ) -> openai::ChatCompletionChunk {
        if !self.sent_role {
            delta.role = Some(openai::ChatRole::Assistant);
            self.sent_role = true;
        }

        openai::ChatCompletionChunk {
            id: self.id.clone(),
            object: openai::ObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::ChatChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}

fn tool_call_delta(call: openai::StreamingToolCall) -> openai::ChatMessageDelta {
    openai::ChatMessageDelta {
        tool_calls: Some(vec![call]),
        ..Default::default()
    }
}
