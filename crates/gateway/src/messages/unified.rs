//! Protocol-agnostic message types shared by both public dialects.
//!
//! The conversion flow follows this pattern:
//! ```text
//! OpenAI/Anthropic request → UnifiedRequest → backend → UnifiedResponse/UnifiedChunk → OpenAI/Anthropic response
//! ```
//!
//! Each dialect has one total mapping in (`from_*`) and one out (`to_*`). The
//! core never branches on the dialect a request arrived in.

use std::pin::Pin;

use futures::Stream;
use serde_json::Value;

pub(crate) mod from_anthropic;
pub(crate) mod from_openai;
pub(crate) mod to_anthropic;
pub(crate) mod to_openai;

/// Unified request representation for both public dialects.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedRequest {
    /// Public model name, resolved to a backend model id by the request translator.
    pub model: String,

    /// Conversation messages, system prompts included as [`UnifiedRole::System`].
    pub messages: Vec<UnifiedMessage>,

    pub max_tokens: Option<u32>,

    pub stream: bool,

    /// OpenAI `stream_options.include_usage`.
    pub include_usage: bool,

    pub tools: Vec<UnifiedTool>,

    pub tool_choice: Option<UnifiedToolChoice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message with an ordered list of content blocks. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedMessage {
    pub role: UnifiedRole,
    pub content: Vec<UnifiedContent>,
}

impl UnifiedMessage {
    pub fn text(role: UnifiedRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![UnifiedContent::Text { text: text.into() }],
        }
    }

    /// All text blocks joined by newlines.
    pub fn joined_text(&self) -> String {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                UnifiedContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        texts.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnifiedContent {
    Text {
        text: String,
    },
    Image {
        source: UnifiedImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        status: UnifiedToolResultStatus,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnifiedImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedToolResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedTool {
    pub function: UnifiedFunction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnifiedToolChoice {
    Mode(UnifiedToolChoiceMode),
    Specific { function: UnifiedFunctionChoice },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedToolChoiceMode {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedFunctionChoice {
    pub name: String,
}

/// A fully assembled, non-streaming response.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedResponse {
    pub id: String,
    pub model: String,
    pub created: u64,
    /// Assistant message with text and tool use blocks.
    pub message: UnifiedMessage,
    pub finish_reason: UnifiedFinishReason,
    pub usage: UnifiedUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedFinishReason {
    Stop,
    /// Still truncated after the continuation rounds ran out.
    Length,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnifiedUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl UnifiedUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A complete tool call, as emitted on the streaming path.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedToolCall {
    /// Position among the public tool calls of this response.
    pub index: u32,
    pub id: String,
    pub name: String,
    /// Serialized JSON arguments.
    pub arguments: String,
}

/// One step of a streamed response. The stream always ends with either
/// `Finish` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum UnifiedChunk {
    Text(String),
    ToolCall(UnifiedToolCall),
    Finish {
        finish_reason: UnifiedFinishReason,
        usage: UnifiedUsage,
    },
    /// A fatal error after output already started.
    Error { message: String },
}

pub type UnifiedChunkStream = Pin<Box<dyn Stream<Item = UnifiedChunk> + Send>>;

/// A streamed response: metadata known up front plus the chunk stream.
pub struct ChatStream {
    pub id: String,
    pub model: String,
    pub created: u64,
    pub prompt_tokens: u32,
    pub chunks: UnifiedChunkStream,
}

pub enum ChatOutcome {
    Complete(UnifiedResponse),
    Stream(ChatStream),
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_timestamp() -> u64 {
    u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default()
}

/// A random 24 character hex id with the given prefix.
pub(crate) fn response_id(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &uuid[..24])
}
