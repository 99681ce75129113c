//! Conversions from OpenAI protocol types to unified types.

use serde_json::{Value, json};

use crate::messages::{openai, unified};

impl From<openai::ChatCompletionRequest> for unified::UnifiedRequest {
    fn from(req: openai::ChatCompletionRequest) -> Self {
        let include_usage = req.stream_options.is_some_and(|options| options.include_usage);

        Self {
            model: req.model,
            messages: req.messages.into_iter().map(unified::UnifiedMessage::from).collect(),
            max_tokens: req.max_completion_tokens.or(req.max_tokens),
            stream: req.stream.unwrap_or(false),
            include_usage,
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

impl From<openai::ChatRole> for unified::UnifiedRole {
    fn from(role: openai::ChatRole) -> Self {
        match role {
            openai::ChatRole::System | openai::ChatRole::Developer => unified::UnifiedRole::System,
            openai::ChatRole::User => unified::UnifiedRole::User,
            openai::ChatRole::Assistant => unified::UnifiedRole::Assistant,
            openai::ChatRole::Tool => unified::UnifiedRole::Tool,
        }
    }
}

impl From<openai::ChatMessage> for unified::UnifiedMessage {
    fn from(msg: openai::ChatMessage) -> Self {
        let role = unified::UnifiedRole::from(msg.role);

        if role == unified::UnifiedRole::Tool {
            let content = unified::UnifiedMessage {
                role,
                content: msg.content.map(content_blocks).unwrap_or_default(),
            }
            .joined_text();

            return Self {
                role,
                content: vec![unified::UnifiedContent::ToolResult {
                    tool_use_id: msg.tool_call_id.unwrap_or_default(),
                    content,
                    status: unified::UnifiedToolResultStatus::Success,
                }],
            };
        }

        let mut content = msg.content.map(content_blocks).unwrap_or_default();

        for call in msg.tool_calls.into_iter().flatten() {
            content.push(unified::UnifiedContent::ToolUse {
                input: parse_arguments(&call.function.name, &call.function.arguments),
                id: call.id,
                name: call.function.name,
            });
        }

        Self { role, content }
    }
}

fn content_blocks(content: openai::MessageContent) -> Vec<unified::UnifiedContent> {
    match content {
        openai::MessageContent::Text(text) => vec![unified::UnifiedContent::Text { text }],
        openai::MessageContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part {
                openai::ContentPart::Text { text } => Some(unified::UnifiedContent::Text { text }),
                openai::ContentPart::ImageUrl { image_url } => Some(unified::UnifiedContent::Image {
                    source: image_source(image_url.url),
                }),
                openai::ContentPart::Unsupported => {
                    log::debug!("Dropping unsupported content part from OpenAI request");
                    None
                }
            })
            .collect(),
    }
}

/// Splits `data:<mime>;base64,<data>` URLs. Anything else stays a URL.
fn image_source(url: String) -> unified::UnifiedImageSource {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, data)) = rest.split_once(',')
        && let Some(media_type) = meta.strip_suffix(";base64")
    {
        return unified::UnifiedImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }

    unified::UnifiedImageSource::Url { url }
}

fn parse_arguments(name: &str, arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }

    serde_json::from_str(arguments).unwrap_or_else(|error| {
        log::debug!("Arguments of tool call '{name}' are not valid JSON, sending an empty object: {error}");
        json!({})
    })
}

impl From<openai::Tool> for unified::UnifiedTool {
    fn from(tool: openai::Tool) -> Self {
        Self {
            function: unified::UnifiedFunction {
                name: tool.function.name,
                description: tool.function.description.unwrap_or_default(),
                parameters: tool
                    .function
                    .parameters
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            },
        }
    }
}

impl From<openai::ToolChoiceMode> for unified::UnifiedToolChoiceMode {
    fn from(mode: openai::ToolChoiceMode) -> Self {
        match mode {
            openai::ToolChoiceMode::None => unified::UnifiedToolChoiceMode::None,
            openai::ToolChoiceMode::Auto => unified::UnifiedToolChoiceMode::Auto,
            openai::ToolChoiceMode::Required => unified::UnifiedToolChoiceMode::Required,
        }
    }
}

impl From<openai::ToolChoice> for unified::UnifiedToolChoice {
    fn from(choice: openai::ToolChoice) -> Self {
        match choice {
            openai::ToolChoice::Mode(mode) => unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::from(mode)),
            openai::ToolChoice::Specific { function, .. } => unified::UnifiedToolChoice::Specific {
                function: unified::UnifiedFunctionChoice { name: function.name },
            },
        }
    }
}
