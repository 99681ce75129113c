//! Conversions from unified types to Anthropic protocol types.

use serde_json::json;

use crate::messages::{anthropic, unified};

impl From<unified::UnifiedResponse> for anthropic::AnthropicChatResponse {
    fn from(resp: unified::UnifiedResponse) -> Self {
        let content = resp
            .message
            .content
            .into_iter()
            .filter_map(|block| match block {
                unified::UnifiedContent::Text { text } if !text.is_empty() => {
                    Some(anthropic::AnthropicResponseContent::Text { text })
                }
                unified::UnifiedContent::ToolUse { id, name, input } => {
                    Some(anthropic::AnthropicResponseContent::ToolUse { id, name, input })
                }
                _ => None,
            })
            .collect();

        Self {
            id: resp.id,
            r#type: "message".to_string(),
            role: anthropic::AnthropicRole::Assistant,
            content,
            model: resp.model,
            stop_reason: Some(anthropic::AnthropicStopReason::from(resp.finish_reason)),
            stop_sequence: None,
            usage: anthropic::AnthropicUsage::from(resp.usage),
        }
    }
}

impl From<unified::UnifiedFinishReason> for anthropic::AnthropicStopReason {
    fn from(reason: unified::UnifiedFinishReason) -> Self {
        match reason {
            unified::UnifiedFinishReason::Stop => anthropic::AnthropicStopReason::EndTurn,
            unified::UnifiedFinishReason::Length => anthropic::AnthropicStopReason::MaxTokens,
            unified::UnifiedFinishReason::ToolCalls => anthropic::AnthropicStopReason::ToolUse,
        }
    }
}

impl From<unified::UnifiedUsage> for anthropic::AnthropicUsage {
    fn from(usage: unified::UnifiedUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

/// Turns unified chunks into the Anthropic event sequence.
///
/// Text is streamed into one open text block; a tool call closes it and is sent
/// as a complete block of its own, so block indexes follow response order.
pub(crate) struct AnthropicStreamEncoder {
    id: String,
    model: String,
    input_tokens: u32,
    next_index: u32,
    open_text_block: Option<u32>,
}

impl AnthropicStreamEncoder {
    pub fn new(id: String, model: String, input_tokens: u32) -> Self {
        Self {
            id,
            model,
            input_tokens,
            next_index: 0,
            open_text_block: None,
        }
    }

    /// The `message_start` event opening the stream.
    pub fn start(&self) -> anthropic::AnthropicStreamEvent {
        anthropic::AnthropicStreamEvent::MessageStart {
            message: anthropic::AnthropicStreamMessageStart {
                id: self.id.clone(),
                message_type: "message".to_string(),
                role: anthropic::AnthropicRole::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: anthropic::AnthropicUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            },
        }
    }

    pub fn encode(&mut self, chunk: unified::UnifiedChunk) -> Vec<anthropic::AnthropicStreamEvent> {
        let mut events = Vec::new();

        match chunk {
            unified::UnifiedChunk::Text(text) => {
                let index = match self.open_text_block {
                    Some(index) => index,
                    None => {
                        let index = self.next_block();
                        self.open_text_block = Some(index);

                        events.push(anthropic::AnthropicStreamEvent::ContentBlockStart {
                            index,
                            content_block: anthropic::AnthropicResponseContent::Text { text: String::new() },
                        });

                        index
                    }
                };

                events.push(anthropic::AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: anthropic::AnthropicContentDelta::TextDelta { text },
                });
            }
            unified::UnifiedChunk::ToolCall(call) => {
                self.close_text_block(&mut events);

                let index = self.next_block();

                events.push(anthropic::AnthropicStreamEvent::ContentBlockStart {
                    index,
                    content_block: anthropic::AnthropicResponseContent::ToolUse {
                        id: call.id,
                        name: call.name,
                        input: json!({}),
                    },
                });

                events.push(anthropic::AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: anthropic::AnthropicContentDelta::InputJsonDelta {
                        partial_json: call.arguments,
                    },
                });

                events.push(anthropic::AnthropicStreamEvent::ContentBlockStop { index });
            }
            unified::UnifiedChunk::Finish { finish_reason, usage } => {
                self.close_text_block(&mut events);

                events.push(anthropic::AnthropicStreamEvent::MessageDelta {
                    delta: anthropic::AnthropicMessageDelta {
                        stop_reason: Some(anthropic::AnthropicStopReason::from(finish_reason)),
                        stop_sequence: None,
                    },
                    usage: anthropic::AnthropicUsage::from(usage),
                });

                events.push(anthropic::AnthropicStreamEvent::MessageStop);
            }
            unified::UnifiedChunk::Error { message } => {
                self.close_text_block(&mut events);

                events.push(anthropic::AnthropicStreamEvent::Error {
                    error: anthropic::AnthropicErrorDetails {
                        error_type: "api_error".to_string(),
                        message,
                    },
                });
            }
        }

        events
    }

    fn next_block(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;

        index
    }

    fn close_text_block(&mut self, events: &mut Vec<anthropic::AnthropicStreamEvent>) {
        if let Some(index) = self.open_text_block.take() {
            events.push(anthropic::AnthropicStreamEvent::ContentBlockStop { index });
        }
    }
}
