use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the OpenAI Chat Completions API.
///
/// Only the fields the gateway acts on are modelled. Sampling parameters such as
/// `temperature` are accepted and ignored, the backend does not expose them.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    /// Public model name. Empty selects the configured default model.
    #[serde(default)]
    pub model: String,

    /// The conversation so far, including system and developer messages.
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Newer clients send this instead of `max_tokens`.
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,

    /// When true, the response is sent as Server-Sent Events.
    #[serde(default)]
    pub stream: Option<bool>,

    #[serde(default)]
    pub stream_options: Option<StreamOptions>,

    #[serde(default)]
    pub tools: Option<Vec<Tool>>,

    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamOptions {
    /// Adds a usage-only chunk before the end of the stream.
    #[serde(default)]
    pub include_usage: bool,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,

    /// Plain text or an array of content parts. Absent on assistant messages
    /// that only carry tool calls.
    #[serde(default)]
    pub content: Option<MessageContent>,

    /// Tool calls made by the assistant.
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// The tool call this message answers, for `tool` messages.
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    /// Replaces `system` for newer models.
    Developer,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    /// Audio, files and other parts the backend cannot take.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    /// Either a remote URL or a `data:<mime>;base64,<data>` URL.
    pub url: String,
}

/// A tool call, in requests (assistant history) and batch responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,

    #[serde(rename = "type", default)]
    pub tool_type: ToolCallType,

    pub function: FunctionCall,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallType {
    #[default]
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,

    /// JSON-encoded arguments.
    #[serde(default)]
    pub arguments: String,
}

/// A tool the model may call.
#[derive(Debug, Clone, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default)]
    pub tool_type: ToolCallType,

    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// JSON Schema of the arguments.
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Controls how the model uses tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `"none"`, `"auto"` or `"required"`.
    Mode(ToolChoiceMode),

    /// Forces a specific function.
    Specific {
        #[serde(rename = "type", default)]
        tool_type: ToolCallType,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    None,
    Auto,
    #[serde(alias = "any")]
    Required,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectType {
    #[serde(rename = "chat.completion")]
    ChatCompletion,
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
    #[serde(rename = "model")]
    Model,
    #[serde(rename = "list")]
    List,
}

/// Response body of a non-streaming chat completion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: ObjectType,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: ChatRole,

    /// `null` when the response only carries tool calls.
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One `data:` event of a streaming chat completion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: ObjectType,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoiceDelta>,

    /// Only on the trailing usage chunk, which has no choices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoiceDelta {
    pub index: u32,
    pub delta: ChatMessageDelta,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatMessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<StreamingToolCall>>,
}

/// Tool call fragments of a streaming response.
///
/// The first fragment of a call carries its id and name, every following one
/// only the next piece of the argument string.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamingToolCall {
    Start {
        index: u32,
        id: String,
        r#type: ToolCallType,
        function: FunctionStart,
    },
    Delta {
        index: u32,
        function: FunctionDelta,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionStart {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDelta {
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: ObjectType,
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: String,
    pub object: ObjectType,
    pub created: u64,
    pub owned_by: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_text_and_part_content() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-6",
            "temperature": 0.2,
            "messages": [
                {"role": "developer", "content": "Be brief."},
                {"role": "user", "content": [
                    {"type": "text", "text": "What is this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw0KGgo=", "detail": "high"}},
                    {"type": "input_audio", "input_audio": {"data": "", "format": "wav"}}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(request.messages[0].role, ChatRole::Developer);

        let Some(MessageContent::Parts(parts)) = &request.messages[1].content else {
            unreachable!("Expected content parts");
        };

        assert!(matches!(&parts[0], ContentPart::Text { text } if text == "What is this?"));
        assert!(matches!(&parts[1], ContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:")));
        assert!(matches!(parts[2], ContentPart::Unsupported));
    }

    #[test]
    fn deserialize_assistant_tool_calls_without_content() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
            }]
        }))
        .unwrap();

        assert!(message.content.is_none());

        let calls = message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, r#"{"city":"Paris"}"#);
    }

    #[test]
    fn deserialize_tool_choice_forms() {
        let mode: ToolChoice = serde_json::from_value(json!("required")).unwrap();
        assert!(matches!(mode, ToolChoice::Mode(ToolChoiceMode::Required)));

        let specific: ToolChoice =
            serde_json::from_value(json!({"type": "function", "function": {"name": "lookup"}})).unwrap();
        assert!(matches!(specific, ToolChoice::Specific { function, .. } if function.name == "lookup"));
    }

    #[test]
    fn serialize_tool_call_chunks() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-123".to_string(),
            object: ObjectType::ChatCompletionChunk,
            created: 1_700_000_000,
            model: "claude-sonnet-4-6".to_string(),
            choices: vec![ChatChoiceDelta {
                index: 0,
                delta: ChatMessageDelta {
                    tool_calls: Some(vec![
                        StreamingToolCall::Start {
                            index: 0,
                            id: "t1".to_string(),
                            r#type: ToolCallType::Function,
                            function: FunctionStart {
                                name: "lookup".to_string(),
                                arguments: String::new(),
                            },
                        },
                        StreamingToolCall::Delta {
                            index: 0,
                            function: FunctionDelta {
                                arguments: "{\"q\":\"x\"}".to_string(),
                            },
                        },
                    ]),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
        };

        insta::assert_json_snapshot!(chunk, @r#"
        {
          "id": "chatcmpl-123",
          "object": "chat.completion.chunk",
          "created": 1700000000,
          "model": "claude-sonnet-4-6",
          "choices": [
            {
              "index": 0,
              "delta": {
                "tool_calls": [
                  {
                    "index": 0,
                    "id": "t1",
                    "type": "function",
                    "function": {
                      "name": "lookup",
                      "arguments": ""
                    }
                  },
                  {
                    "index": 0,
                    "function": {
                      "arguments": "{\"q\":\"x\"}"
                    }
                  }
                ]
              },
              "finish_reason": null
            }
          ]
        }
        "#);
    }
}
