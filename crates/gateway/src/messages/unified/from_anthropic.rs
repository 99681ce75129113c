//! Conversions from Anthropic protocol types to unified types.

use serde_json::json;

use crate::messages::{anthropic, unified};

impl From<anthropic::AnthropicChatRequest> for unified::UnifiedRequest {
    fn from(req: anthropic::AnthropicChatRequest) -> Self {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);

        // The backend has no system role either; keep it as a leading message
        // and let the request translator fold it into the synthetic first turn.
        if let Some(system) = req.system {
            let text = system.into_text();

            if !text.is_empty() {
                messages.push(unified::UnifiedMessage::text(unified::UnifiedRole::System, text));
            }
        }

        for message in req.messages {
            push_message(&mut messages, message);
        }

        Self {
            model: req.model,
            messages,
            max_tokens: req.max_tokens,
            stream: req.stream.unwrap_or(false),
            include_usage: false,
            tools: req
                .tools
                .unwrap_or_default()
                .into_iter()
                .map(unified::UnifiedTool::from)
                .collect(),
            tool_choice: req.tool_choice.map(unified::UnifiedToolChoice::from),
        }
    }
}

/// Tool results travel inside user messages in this dialect. They are split
/// out into a `Tool` message placed before the remaining user content.
fn push_message(messages: &mut Vec<unified::UnifiedMessage>, message: anthropic::AnthropicMessage) {
    let blocks = match message.content {
        anthropic::AnthropicMessageContent::Text(text) => vec![unified::UnifiedContent::Text { text }],
        anthropic::AnthropicMessageContent::Blocks(blocks) => blocks.into_iter().filter_map(content_block).collect(),
    };

    match message.role {
        anthropic::AnthropicRole::Assistant => messages.push(unified::UnifiedMessage {
            role: unified::UnifiedRole::Assistant,
            content: blocks,
        }),
        anthropic::AnthropicRole::User => {
            let (results, content): (Vec<_>, Vec<_>) = blocks
                .into_iter()
                .partition(|block| matches!(block, unified::UnifiedContent::ToolResult { .. }));

            if !results.is_empty() {
                messages.push(unified::UnifiedMessage {
                    role: unified::UnifiedRole::Tool,
                    content: results,
                });
            }

            if !content.is_empty() {
                messages.push(unified::UnifiedMessage {
                    role: unified::UnifiedRole::User,
                    content,
                });
            }
        }
    }
}

fn content_block(block: anthropic::AnthropicContent) -> Option<unified::UnifiedContent> {
    let content = match block {
        anthropic::AnthropicContent::Text { text } => unified::UnifiedContent::Text { text },
        anthropic::AnthropicContent::Image { source } => unified::UnifiedContent::Image {
            source: match source {
                anthropic::AnthropicImageSource::Base64 { media_type, data } => {
                    unified::UnifiedImageSource::Base64 { media_type, data }
                }
                anthropic::AnthropicImageSource::Url { url } => unified::UnifiedImageSource::Url { url },
            },
        },
        anthropic::AnthropicContent::ToolUse { id, name, input } => unified::UnifiedContent::ToolUse { id, name, input },
        anthropic::AnthropicContent::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => unified::UnifiedContent::ToolResult {
            tool_use_id,
            content: content
                .map(anthropic::AnthropicToolResultContent::into_text)
                .unwrap_or_default(),
            status: if is_error {
                unified::UnifiedToolResultStatus::Error
            } else {
                unified::UnifiedToolResultStatus::Success
            },
        },
        anthropic::AnthropicContent::Unsupported => {
            log::debug!("Dropping unsupported content block from Anthropic request");
            return None;
        }
    };

    Some(content)
}

impl From<anthropic::AnthropicTool> for unified::UnifiedTool {
    fn from(tool: anthropic::AnthropicTool) -> Self {
        Self {
            function: unified::UnifiedFunction {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                parameters: tool
                    .input_schema
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            },
        }
    }
}

impl From<anthropic::AnthropicToolChoice> for unified::UnifiedToolChoice {
    fn from(choice: anthropic::AnthropicToolChoice) -> Self {
        match choice {
            anthropic::AnthropicToolChoice::Auto => {
                unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::Auto)
            }
            anthropic::AnthropicToolChoice::Any => {
                unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::Required)
            }
            anthropic::AnthropicToolChoice::None => {
                unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::None)
            }
            anthropic::AnthropicToolChoice::Tool { name } => unified::UnifiedToolChoice::Specific {
                function: unified::UnifiedFunctionChoice { name },
            },
        }
    }
}
