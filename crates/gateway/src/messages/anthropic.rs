use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Request body for the Anthropic Messages API.
///
/// Differs from the OpenAI dialect in a few ways that matter for translation:
/// - the system prompt is a top-level field, not a message
/// - message content is an array of typed blocks
/// - tool results are `tool_result` blocks inside user messages
///
/// The same body is accepted by `/v1/messages/count_tokens`, where `max_tokens`
/// is absent.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicChatRequest {
    #[serde(default)]
    pub model: String,

    /// Messages alternating between `user` and `assistant`.
    pub messages: Vec<AnthropicMessage>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// System prompt, as a string or an array of text blocks.
    #[serde(default)]
    pub system: Option<AnthropicSystem>,

    #[serde(default)]
    pub stream: Option<bool>,

    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,

    #[serde(default)]
    pub tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicSystemBlock>),
}

impl AnthropicSystem {
    pub fn into_text(self) -> String {
        match self {
            AnthropicSystem::Text(text) => text,
            AnthropicSystem::Blocks(blocks) => {
                let texts: Vec<String> = blocks.into_iter().map(|block| block.text).collect();
                texts.join("\n")
            }
        }
    }
}

/// A system prompt block. `cache_control` and similar hints are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicSystemBlock {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicMessage {
    pub role: AnthropicRole,
    pub content: AnthropicMessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnthropicRole {
    User,
    Assistant,
}

/// Message content: shorthand string or content blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnthropicMessageContent {
    Text(String),
    Blocks(Vec<AnthropicContent>),
}

/// Content block of an inbound message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContent {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    /// Tool use request from an earlier assistant turn.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Result of a tool execution, sent back in a user message.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<AnthropicToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    /// Thinking, document and other blocks the backend cannot take.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnthropicToolResultContent {
    Text(String),
    Blocks(Vec<AnthropicToolResultBlock>),
}

impl AnthropicToolResultContent {
    /// Text blocks joined by newlines. Images inside tool results are dropped.
    pub fn into_text(self) -> String {
        match self {
            AnthropicToolResultContent::Text(text) => text,
            AnthropicToolResultContent::Blocks(blocks) => {
                let texts: Vec<String> = blocks
                    .into_iter()
                    .filter_map(|block| match block {
                        AnthropicToolResultBlock::Text { text } => Some(text),
                        AnthropicToolResultBlock::Unsupported => None,
                    })
                    .collect();

                texts.join("\n")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicToolResultBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicTool {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// JSON Schema for the tool's input. Absent on server tools.
    #[serde(default)]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicToolChoice {
    /// Let the model decide whether to use tools.
    Auto,
    /// Force the model to use any available tool.
    Any,
    /// Force the model to use a specific tool.
    Tool { name: String },
    /// Tools are not used at all.
    None,
}

/// Response from the Messages API.
#[derive(Debug, Clone, Serialize)]
pub struct AnthropicChatResponse {
    pub id: String,

    /// Always `"message"`.
    pub r#type: String,

    pub role: AnthropicRole,

    pub content: Vec<AnthropicResponseContent>,

    pub model: String,

    pub stop_reason: Option<AnthropicStopReason>,

    pub stop_sequence: Option<String>,

    pub usage: AnthropicUsage,
}

/// Content block of a response, in batch and streaming form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicResponseContent {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnthropicStopReason {
    /// The model reached a natural stopping point.
    EndTurn,
    /// The output was still cut off after the last continuation round.
    MaxTokens,
    /// The model invoked a tool.
    ToolUse,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Streaming event types for Anthropic SSE responses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicResponseContent,
    },
    ContentBlockDelta {
        index: u32,
        delta: AnthropicContentDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: AnthropicMessageDelta,
        usage: AnthropicUsage,
    },
    MessageStop,
    Error {
        error: AnthropicErrorDetails,
    },
}

impl AnthropicStreamEvent {
    /// The SSE `event:` name, equal to the `type` tag.
    pub fn event_name(&self) -> &'static str {
        match self {
            AnthropicStreamEvent::MessageStart { .. } => "message_start",
            AnthropicStreamEvent::ContentBlockStart { .. } => "content_block_start",
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            AnthropicStreamEvent::MessageDelta { .. } => "message_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
            AnthropicStreamEvent::Error { .. } => "error",
        }
    }
}

/// Initial message metadata for streaming.
#[derive(Debug, Clone, Serialize)]
pub struct AnthropicStreamMessageStart {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: String,

    pub role: AnthropicRole,

    /// Always empty, blocks follow as separate events.
    pub content: Vec<AnthropicResponseContent>,

    pub model: String,

    pub stop_reason: Option<AnthropicStopReason>,

    pub stop_sequence: Option<String>,

    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicMessageDelta {
    pub stop_reason: Option<AnthropicStopReason>,
    pub stop_sequence: Option<String>,
}

/// Error response in Anthropic format.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Always `"error"`.
    #[serde(rename = "type")]
    pub error_type: String,

    pub error: AnthropicErrorDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicErrorDetails {
    #[serde(rename = "type")]
    pub error_type: String,

    pub message: String,
}

impl From<GatewayError> for ErrorResponse {
    fn from(error: GatewayError) -> Self {
        Self {
            error_type: "error".to_string(),
            error: AnthropicErrorDetails {
                error_type: error.error_type().to_string(),
                message: error.client_message(),
            },
        }
    }
}

/// Response of `/v1/messages/count_tokens`.
#[derive(Debug, Clone, Serialize)]
pub struct CountTokensResponse {
    pub input_tokens: u32,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_shorthand_and_block_content() {
        let request: AnthropicChatRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-6",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "Be brief.", "cache_control": {"type": "ephemeral"}}],
            "messages": [
                {"role": "user", "content": "Weather in Paris?"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "...", "signature": "abc"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "18C"}]},
                    {"type": "tool_result", "tool_use_id": "toolu_2", "content": "failed", "is_error": true}
                ]}
            ],
            "tool_choice": {"type": "any"}
        }))
        .unwrap();

        assert_eq!(request.system.unwrap().into_text(), "Be brief.");
        assert!(matches!(request.messages[0].content, AnthropicMessageContent::Text(ref text) if text == "Weather in Paris?"));
        assert!(matches!(request.tool_choice, Some(AnthropicToolChoice::Any)));

        let AnthropicMessageContent::Blocks(blocks) = &request.messages[1].content else {
            unreachable!("Expected content blocks");
        };
        assert!(matches!(blocks[0], AnthropicContent::Unsupported));
        assert!(matches!(&blocks[1], AnthropicContent::ToolUse { name, .. } if name == "get_weather"));

        let AnthropicMessageContent::Blocks(blocks) = request.messages[2].content.clone() else {
            unreachable!("Expected content blocks");
        };

        let results: Vec<_> = blocks
            .into_iter()
            .map(|block| match block {
                AnthropicContent::ToolResult { content, is_error, .. } => {
                    (content.map(AnthropicToolResultContent::into_text), is_error)
                }
                _ => unreachable!("Expected tool results"),
            })
            .collect();

        assert_eq!(
            results,
            vec![(Some("18C".to_string()), false), (Some("failed".to_string()), true)]
        );
    }

    #[test]
    fn count_tokens_body_without_max_tokens() {
        let request: AnthropicChatRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-6",
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .unwrap();

        assert!(request.max_tokens.is_none());
    }

    #[test]
    fn serialize_streaming_events() {
        let event = AnthropicStreamEvent::ContentBlockStart {
            index: 1,
            content_block: AnthropicResponseContent::ToolUse {
                id: "t1".to_string(),
                name: "lookup".to_string(),
                input: json!({}),
            },
        };

        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "content_block_start",
          "index": 1,
          "content_block": {
            "type": "tool_use",
            "id": "t1",
            "name": "lookup",
            "input": {}
          }
        }
        "#);

        let event = AnthropicStreamEvent::MessageDelta {
            delta: AnthropicMessageDelta {
                stop_reason: Some(AnthropicStopReason::EndTurn),
                stop_sequence: None,
            },
            usage: AnthropicUsage {
                input_tokens: 12,
                output_tokens: 3,
            },
        };

        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "message_delta",
          "delta": {
            "stop_reason": "end_turn",
            "stop_sequence": null
          },
          "usage": {
            "input_tokens": 12,
            "output_tokens": 3
          }
        }
        "#);

        assert_eq!(AnthropicStreamEvent::MessageStop.event_name(), "message_stop");
    }

    #[test]
    fn error_response_from_gateway_error() {
        let response = ErrorResponse::from(GatewayError::Validation("messages must not be empty".to_string()));

        insta::assert_json_snapshot!(response, @r#"
        {
          "type": "error",
          "error": {
            "type": "invalid_request_error",
            "message": "Invalid request: messages must not be empty"
          }
        }
        "#);
    }
}
