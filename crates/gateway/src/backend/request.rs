//! Translation of unified chat requests into the backend conversation envelope.
//!
//! The backend has no system role and expects strictly alternating
//! user/assistant history, with tool results attached to user turns. The
//! translator folds the unified message list into that shape:
//!
//! ```text
//! [system...]  user  assistant(tool_use)  tool  user
//!     │          │          │               └──┬──┘
//!     ▼          ▼          ▼                  ▼
//! history[0..2] history[2] history[3]    current_message (toolResults + text)
//! ```

use std::collections::HashSet;

use config::BackendConfig;
use itertools::Itertools;

use super::envelope::{
    AssistantHistoryItem, AssistantResponseMessage, BackendImage, BackendImageSource, BackendTextContent, BackendTool,
    BackendToolResult, BackendToolUse, CHAT_TRIGGER_MANUAL, CodeWhispererRequest, ConversationState, CurrentMessage,
    HistoryItem, InputSchema, ORIGIN_AI_EDITOR, ToolResultStatus, ToolSpecification, UserHistoryItem,
    UserInputMessage, UserInputMessageContext,
};
use crate::{
    error::{GatewayError, GatewayResult},
    messages::unified::{
        UnifiedContent, UnifiedImageSource, UnifiedMessage, UnifiedRequest, UnifiedRole, UnifiedTool,
        UnifiedToolChoice, UnifiedToolChoiceMode, UnifiedToolResultStatus,
    },
    sanitizer::{self, IDENTITY_ACKNOWLEDGEMENT},
};

/// Tool descriptions are cut to this many characters.
const MAX_DESCRIPTION_CHARS: usize = 10_000;

/// Tools the backend provides itself and refuses as client definitions.
const RESERVED_TOOL_NAMES: &[&str] = &["web_search", "websearch"];

/// Sent as the current message when the conversation ends with an assistant turn.
const CONTINUE_FROM_ASSISTANT: &str = "Continue from where you left off.";

/// User turn inserted in front of an assistant turn that has none.
const SYNTHETIC_USER_TURN: &str = "Continue.";

/// Instruction sent when a truncated response is continued.
pub(crate) const CONTINUATION_PROMPT: &str = "Your previous output was cut off mid-stream. \
Continue EXACTLY from the last character. Do not repeat anything. Do not add commentary. \
Just continue the code/text output until it is complete.";

/// A request ready to be sent, plus what the response side needs to know about it.
#[derive(Debug, Clone)]
pub(crate) struct TranslatedRequest {
    pub envelope: CodeWhispererRequest,
    /// Tool definitions as sent, after filtering.
    pub tool_specs: Vec<ToolSpecification>,
    /// Every tool name the client declared, filtered or not.
    pub declared_tools: HashSet<String>,
}

pub(crate) struct RequestTranslator<'a> {
    backend: &'a BackendConfig,
    identity_override: bool,
}

impl<'a> RequestTranslator<'a> {
    pub fn new(backend: &'a BackendConfig, identity_override: bool) -> Self {
        Self {
            backend,
            identity_override,
        }
    }

    pub fn translate(&self, request: &UnifiedRequest) -> GatewayResult<TranslatedRequest> {
        let model_id = self
            .backend
            .resolve_model(&request.model)
            .ok_or_else(|| GatewayError::ModelNotFound(request.model.clone()))?
            .to_string();

        let (system, conversation): (Vec<&UnifiedMessage>, Vec<&UnifiedMessage>) = request
            .messages
            .iter()
            .partition(|message| message.role == UnifiedRole::System);

        if conversation.is_empty() {
            return Err(GatewayError::Validation(
                "messages must contain at least one non-system message".to_string(),
            ));
        }

        validate_tool_results(&conversation)?;

        let declared_tools = request
            .tools
            .iter()
            .map(|tool| tool.function.name.clone())
            .collect();

        let tool_specs = match request.tool_choice {
            Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::None)) => Vec::new(),
            _ => request.tools.iter().filter_map(tool_specification).collect(),
        };

        let mut history = Vec::with_capacity(conversation.len() + 2);

        if let Some((prompt, acknowledgement)) = self.system_turn(&system, request.tool_choice.as_ref(), &tool_specs) {
            history.push(user_item(text_turn(prompt, &model_id)));
            history.push(assistant_item(acknowledgement.to_string(), Vec::new()));
        }

        // The current message is the trailing run of user and tool messages.
        let split = conversation
            .iter()
            .rposition(|message| message.role == UnifiedRole::Assistant)
            .map_or(0, |index| index + 1);

        let (past, current) = conversation.split_at(split);

        for (is_assistant, group) in &past.iter().chunk_by(|message| message.role == UnifiedRole::Assistant) {
            let group: Vec<&UnifiedMessage> = group.copied().collect();

            if is_assistant {
                if !matches!(history.last(), Some(HistoryItem::User(_))) {
                    history.push(user_item(text_turn(SYNTHETIC_USER_TURN.to_string(), &model_id)));
                }

                history.push(assistant_turn(&group));
            } else {
                history.push(user_item(user_turn(&group, &model_id)?));
            }
        }

        let mut user_input_message = if current.is_empty() {
            text_turn(CONTINUE_FROM_ASSISTANT.to_string(), &model_id)
        } else {
            user_turn(current, &model_id)?
        };

        if !tool_specs.is_empty() {
            let context = user_input_message
                .user_input_message_context
                .get_or_insert_with(UserInputMessageContext::default);

            context.tools = tool_specs
                .iter()
                .cloned()
                .map(|tool_specification| BackendTool { tool_specification })
                .collect();
        }

        let envelope = CodeWhispererRequest {
            conversation_state: ConversationState {
                chat_trigger_type: CHAT_TRIGGER_MANUAL.to_string(),
                conversation_id: uuid::Uuid::new_v4().to_string(),
                current_message: CurrentMessage { user_input_message },
                history,
            },
            profile_arn: None,
        };

        log::debug!(
            "Translated request for model '{model_id}': {} history items, {} tools",
            envelope.conversation_state.history.len(),
            tool_specs.len()
        );

        Ok(TranslatedRequest {
            envelope,
            tool_specs,
            declared_tools,
        })
    }

    /// Text of the synthetic first user turn and its acknowledgement, if any.
    fn system_turn(
        &self,
        system: &[&UnifiedMessage],
        tool_choice: Option<&UnifiedToolChoice>,
        tool_specs: &[ToolSpecification],
    ) -> Option<(String, &'static str)> {
        let user_system = system.iter().map(|message| message.joined_text()).join("\n");
        let user_system = (!user_system.is_empty()).then_some(user_system);

        let mut parts = Vec::new();

        if self.identity_override {
            parts.push(sanitizer::build_system_prompt(
                user_system.as_deref(),
                !tool_specs.is_empty(),
            ));
        } else if let Some(user_system) = user_system {
            parts.push(user_system);
        }

        if !tool_specs.is_empty() {
            match tool_choice {
                Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::Required)) => {
                    parts.push("You MUST call at least one of the provided tools in this response.".to_string());
                }
                Some(UnifiedToolChoice::Specific { function }) => {
                    parts.push(format!("You MUST call the `{}` tool in this response.", function.name));
                }
                _ => {}
            }
        }

        if parts.is_empty() {
            return None;
        }

        let acknowledgement = if self.identity_override {
            IDENTITY_ACKNOWLEDGEMENT
        } else {
            "Understood."
        };

        Some((parts.join("\n\n"), acknowledgement))
    }
}

/// The request to send when a response was cut off: the original conversation,
/// the partial answer as an assistant turn, and the instruction to continue.
pub(crate) fn continuation_request(original: &UnifiedRequest, partial_text: &str) -> UnifiedRequest {
    let mut request = original.clone();

    request
        .messages
        .push(UnifiedMessage::text(UnifiedRole::Assistant, partial_text));

    request
        .messages
        .push(UnifiedMessage::text(UnifiedRole::User, CONTINUATION_PROMPT));

    // A forced tool call would interrupt the text being continued.
    if matches!(
        request.tool_choice,
        Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::Required) | UnifiedToolChoice::Specific { .. })
    ) {
        request.tool_choice = Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::Auto));
    }

    request
}

fn tool_specification(tool: &UnifiedTool) -> Option<ToolSpecification> {
    let name = &tool.function.name;

    if name.is_empty() {
        log::debug!("Dropping tool definition without a name");
        return None;
    }

    if RESERVED_TOOL_NAMES.contains(&name.as_str()) {
        log::debug!("Dropping tool definition '{name}', the backend provides it natively");
        return None;
    }

    let description = if tool.function.description.is_empty() {
        name.clone()
    } else if tool.function.description.chars().count() > MAX_DESCRIPTION_CHARS {
        tool.function.description.chars().take(MAX_DESCRIPTION_CHARS).collect()
    } else {
        tool.function.description.clone()
    };

    Some(ToolSpecification {
        name: name.clone(),
        description,
        input_schema: InputSchema {
            json: tool.function.parameters.clone(),
        },
    })
}

/// Every tool result must answer a tool use made earlier in the conversation.
fn validate_tool_results(conversation: &[&UnifiedMessage]) -> GatewayResult<()> {
    let mut tool_uses = HashSet::new();

    for block in conversation.iter().flat_map(|message| &message.content) {
        match block {
            UnifiedContent::ToolUse { id, .. } => {
                tool_uses.insert(id.as_str());
            }
            UnifiedContent::ToolResult { tool_use_id, .. } if tool_use_id.is_empty() => {
                return Err(GatewayError::Validation(
                    "tool result message without a tool call id".to_string(),
                ));
            }
            UnifiedContent::ToolResult { tool_use_id, .. } if !tool_uses.contains(tool_use_id.as_str()) => {
                return Err(GatewayError::Validation(format!(
                    "tool result '{tool_use_id}' does not answer any earlier tool call"
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

fn text_turn(content: String, model_id: &str) -> UserInputMessage {
    UserInputMessage {
        content,
        model_id: model_id.to_string(),
        origin: ORIGIN_AI_EDITOR.to_string(),
        images: Vec::new(),
        user_input_message_context: None,
    }
}

/// Merges a run of user and tool messages into one user turn.
fn user_turn(messages: &[&UnifiedMessage], model_id: &str) -> GatewayResult<UserInputMessage> {
    let mut texts = Vec::new();
    let mut images = Vec::new();
    let mut tool_results = Vec::new();

    for message in messages {
        let text = message.joined_text();

        if !text.is_empty() {
            texts.push(text);
        }

        for block in &message.content {
            match block {
                UnifiedContent::Image { source } => images.push(backend_image(source)?),
                UnifiedContent::ToolResult {
                    tool_use_id,
                    content,
                    status,
                } => tool_results.push(BackendToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: vec![BackendTextContent { text: content.clone() }],
                    status: match status {
                        UnifiedToolResultStatus::Success => ToolResultStatus::Success,
                        UnifiedToolResultStatus::Error => ToolResultStatus::Error,
                    },
                }),
                UnifiedContent::Text { .. } | UnifiedContent::ToolUse { .. } => {}
            }
        }
    }

    let context = UserInputMessageContext {
        tools: Vec::new(),
        tool_results,
    };

    Ok(UserInputMessage {
        content: texts.join("\n"),
        model_id: model_id.to_string(),
        origin: ORIGIN_AI_EDITOR.to_string(),
        images,
        user_input_message_context: (!context.is_empty()).then_some(context),
    })
}

/// Merges a run of assistant messages into one assistant turn.
fn assistant_turn(messages: &[&UnifiedMessage]) -> HistoryItem {
    let content = messages
        .iter()
        .map(|message| message.joined_text())
        .filter(|text| !text.is_empty())
        .join("\n");

    let tool_uses = messages
        .iter()
        .flat_map(|message| &message.content)
        .filter_map(|block| match block {
            UnifiedContent::ToolUse { id, name, input } => Some(BackendToolUse {
                tool_use_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect();

    assistant_item(content, tool_uses)
}

fn backend_image(source: &UnifiedImageSource) -> GatewayResult<BackendImage> {
    match source {
        UnifiedImageSource::Base64 { media_type, data } => Ok(BackendImage {
            format: media_type
                .strip_prefix("image/")
                .unwrap_or(media_type)
                .to_ascii_lowercase(),
            source: BackendImageSource { bytes: data.clone() },
        }),
        UnifiedImageSource::Url { url } => Err(GatewayError::Validation(format!(
            "image '{url}' must be sent inline as base64 data, remote image URLs are not supported"
        ))),
    }
}

fn user_item(user_input_message: UserInputMessage) -> HistoryItem {
    HistoryItem::User(UserHistoryItem { user_input_message })
}

fn assistant_item(content: String, tool_uses: Vec<BackendToolUse>) -> HistoryItem {
    HistoryItem::Assistant(AssistantHistoryItem {
        assistant_response_message: AssistantResponseMessage { content, tool_uses },
    })
}

/// Reads an envelope back into unified messages. Used to check that
/// translation keeps role order and tool result association.
#[cfg(test)]
pub(crate) fn envelope_messages(envelope: &CodeWhispererRequest) -> Vec<UnifiedMessage> {
    fn user_messages(message: &UserInputMessage, first: bool) -> Vec<UnifiedMessage> {
        let mut messages = Vec::new();

        if let Some(context) = &message.user_input_message_context
            && !context.tool_results.is_empty()
        {
            let content = context
                .tool_results
                .iter()
                .map(|result| UnifiedContent::ToolResult {
                    tool_use_id: result.tool_use_id.clone(),
                    content: result.content.iter().map(|text| text.text.as_str()).join("\n"),
                    status: match result.status {
                        ToolResultStatus::Success => UnifiedToolResultStatus::Success,
                        ToolResultStatus::Error => UnifiedToolResultStatus::Error,
                    },
                })
                .collect();

            messages.push(UnifiedMessage {
                role: UnifiedRole::Tool,
                content,
            });
        }

        if !message.content.is_empty() {
            let role = if first { UnifiedRole::System } else { UnifiedRole::User };
            messages.push(UnifiedMessage::text(role, message.content.clone()));
        }

        messages
    }

    let state = &envelope.conversation_state;
    let mut messages = Vec::new();

    for (index, item) in state.history.iter().enumerate() {
        match item {
            HistoryItem::User(user) => messages.extend(user_messages(&user.user_input_message, index == 0)),
            // The acknowledgement of the synthetic first turn has no counterpart.
            HistoryItem::Assistant(_) if index == 1 => {}
            HistoryItem::Assistant(assistant) => {
                let message = &assistant.assistant_response_message;
                let mut content = Vec::new();

                if !message.content.is_empty() {
                    content.push(UnifiedContent::Text {
                        text: message.content.clone(),
                    });
                }

                content.extend(message.tool_uses.iter().map(|tool_use| UnifiedContent::ToolUse {
                    id: tool_use.tool_use_id.clone(),
                    name: tool_use.name.clone(),
                    input: tool_use.input.clone(),
                }));

                messages.push(UnifiedMessage {
                    role: UnifiedRole::Assistant,
                    content,
                });
            }
        }
    }

    messages.extend(user_messages(&state.current_message.user_input_message, false));
    messages
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::messages::unified::{UnifiedFunction, UnifiedFunctionChoice};

    fn backend() -> BackendConfig {
        toml::from_str(indoc! {r#"
            default_model = "claude-sonnet-4-6"

            [models]
            "claude-sonnet-4-6" = "claude-sonnet-4.6"
        "#})
        .unwrap()
    }

    fn request(messages: Vec<UnifiedMessage>) -> UnifiedRequest {
        UnifiedRequest {
            model: "claude-sonnet-4-6".to_string(),
            messages,
            max_tokens: None,
            stream: false,
            include_usage: false,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    fn tool(name: &str, description: &str) -> UnifiedTool {
        UnifiedTool {
            function: UnifiedFunction {
                name: name.to_string(),
                description: description.to_string(),
                parameters: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            },
        }
    }

    fn tool_use(id: &str, name: &str, input: serde_json::Value) -> UnifiedContent {
        UnifiedContent::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    fn tool_result(id: &str, content: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: UnifiedRole::Tool,
            content: vec![UnifiedContent::ToolResult {
                tool_use_id: id.to_string(),
                content: content.to_string(),
                status: UnifiedToolResultStatus::Success,
            }],
        }
    }

    fn weather_conversation() -> Vec<UnifiedMessage> {
        vec![
            UnifiedMessage::text(UnifiedRole::System, "You are terse."),
            UnifiedMessage::text(UnifiedRole::User, "Weather in Paris?"),
            UnifiedMessage {
                role: UnifiedRole::Assistant,
                content: vec![
                    UnifiedContent::Text {
                        text: "Checking.".to_string(),
                    },
                    tool_use("t1", "get_weather", json!({"city": "Paris"})),
                ],
            },
            tool_result("t1", "18C"),
        ]
    }

    fn translate(request: &UnifiedRequest, identity_override: bool) -> GatewayResult<TranslatedRequest> {
        let backend = backend();
        RequestTranslator::new(&backend, identity_override).translate(request)
    }

    #[test]
    fn round_trip_keeps_roles_and_tool_results() {
        let original = weather_conversation();
        let translated = translate(&request(original.clone()), false).unwrap();

        assert_eq!(envelope_messages(&translated.envelope), original);
    }

    #[test]
    fn envelope_shape() {
        let mut translated = translate(&request(weather_conversation()), false).unwrap();
        translated.envelope.conversation_state.conversation_id = "00000000-0000-4000-8000-000000000000".to_string();

        insta::assert_json_snapshot!(translated.envelope, @r#"
        {
          "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": "00000000-0000-4000-8000-000000000000",
            "currentMessage": {
              "userInputMessage": {
                "content": "",
                "modelId": "claude-sonnet-4.6",
                "origin": "AI_EDITOR",
                "userInputMessageContext": {
                  "toolResults": [
                    {
                      "toolUseId": "t1",
                      "content": [
                        {
                          "text": "18C"
                        }
                      ],
                      "status": "success"
                    }
                  ]
                }
              }
            },
            "history": [
              {
                "userInputMessage": {
                  "content": "You are terse.",
                  "modelId": "claude-sonnet-4.6",
                  "origin": "AI_EDITOR"
                }
              },
              {
                "assistantResponseMessage": {
                  "content": "Understood."
                }
              },
              {
                "userInputMessage": {
                  "content": "Weather in Paris?",
                  "modelId": "claude-sonnet-4.6",
                  "origin": "AI_EDITOR"
                }
              },
              {
                "assistantResponseMessage": {
                  "content": "Checking.",
                  "toolUses": [
                    {
                      "toolUseId": "t1",
                      "name": "get_weather",
                      "input": {
                        "city": "Paris"
                      }
                    }
                  ]
                }
              }
            ]
          }
        }
        "#);
    }

    #[test]
    fn identity_override_is_always_injected() {
        let translated = translate(
            &request(vec![UnifiedMessage::text(UnifiedRole::User, "Hi")]),
            true,
        )
        .unwrap();

        let history = &translated.envelope.conversation_state.history;
        assert_eq!(history.len(), 2);

        let HistoryItem::User(first) = &history[0] else {
            unreachable!("Expected synthetic user turn");
        };
        assert!(first.user_input_message.content.starts_with("[SYSTEM IDENTITY OVERRIDE]"));

        let HistoryItem::Assistant(second) = &history[1] else {
            unreachable!("Expected acknowledgement");
        };
        assert_eq!(second.assistant_response_message.content, IDENTITY_ACKNOWLEDGEMENT);
    }

    #[test]
    fn no_system_turn_without_override_or_system_prompt() {
        let translated = translate(
            &request(vec![UnifiedMessage::text(UnifiedRole::User, "2+2?")]),
            false,
        )
        .unwrap();

        let state = &translated.envelope.conversation_state;
        assert!(state.history.is_empty());
        assert_eq!(state.current_message.user_input_message.content, "2+2?");
        assert_eq!(state.chat_trigger_type, "MANUAL");
    }

    #[test]
    fn trailing_tool_results_are_collected_together() {
        let mut messages = vec![
            UnifiedMessage::text(UnifiedRole::User, "Compare Paris and Rome."),
            UnifiedMessage {
                role: UnifiedRole::Assistant,
                content: vec![
                    tool_use("t1", "get_weather", json!({"city": "Paris"})),
                    tool_use("t2", "get_weather", json!({"city": "Rome"})),
                ],
            },
            tool_result("t1", "18C"),
            tool_result("t2", "24C"),
        ];
        messages.push(UnifiedMessage::text(UnifiedRole::User, "Which is warmer?"));

        let translated = translate(&request(messages), false).unwrap();
        let current = &translated.envelope.conversation_state.current_message.user_input_message;

        let results: Vec<_> = current
            .user_input_message_context
            .as_ref()
            .unwrap()
            .tool_results
            .iter()
            .map(|result| result.tool_use_id.as_str())
            .collect();

        assert_eq!(results, vec!["t1", "t2"]);
        assert_eq!(current.content, "Which is warmer?");
        assert_eq!(translated.envelope.conversation_state.history.len(), 2);
    }

    #[test]
    fn consecutive_messages_are_merged() {
        let messages = vec![
            UnifiedMessage::text(UnifiedRole::Assistant, "Hello, how can I help?"),
            UnifiedMessage::text(UnifiedRole::User, "First."),
            UnifiedMessage::text(UnifiedRole::User, "Second."),
            UnifiedMessage::text(UnifiedRole::Assistant, "One."),
            UnifiedMessage::text(UnifiedRole::Assistant, "Two."),
        ];

        let translated = translate(&request(messages), false).unwrap();
        let state = &translated.envelope.conversation_state;

        let turns: Vec<String> = state
            .history
            .iter()
            .map(|item| match item {
                HistoryItem::User(user) => format!("user: {}", user.user_input_message.content),
                HistoryItem::Assistant(assistant) => {
                    format!("assistant: {}", assistant.assistant_response_message.content)
                }
            })
            .collect();

        insta::assert_debug_snapshot!(turns, @r#"
        [
            "user: Continue.",
            "assistant: Hello, how can I help?",
            "user: First.\nSecond.",
            "assistant: One.\nTwo.",
        ]
        "#);

        assert_eq!(state.current_message.user_input_message.content, CONTINUE_FROM_ASSISTANT);
    }

    #[test]
    fn tool_definitions_are_filtered() {
        let long_description = "é".repeat(MAX_DESCRIPTION_CHARS + 50);

        let mut request = request(vec![UnifiedMessage::text(UnifiedRole::User, "Hi")]);
        request.tools = vec![
            tool("lookup", ""),
            tool("web_search", "Search the web"),
            tool("", "Nameless"),
            tool("summarize", &long_description),
        ];

        let translated = translate(&request, false).unwrap();

        let names: Vec<_> = translated.tool_specs.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, vec!["lookup", "summarize"]);
        assert_eq!(translated.tool_specs[0].description, "lookup");
        assert_eq!(translated.tool_specs[1].description.chars().count(), MAX_DESCRIPTION_CHARS);
        assert!(translated.declared_tools.contains("web_search"));

        let context = translated
            .envelope
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .unwrap();
        assert_eq!(context.tools.len(), 2);
    }

    #[test]
    fn tool_choice_none_sends_no_tools() {
        let mut request = request(vec![UnifiedMessage::text(UnifiedRole::User, "Hi")]);
        request.tools = vec![tool("lookup", "Look up")];
        request.tool_choice = Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::None));

        let translated = translate(&request, false).unwrap();

        assert!(translated.tool_specs.is_empty());
        assert!(
            translated
                .envelope
                .conversation_state
                .current_message
                .user_input_message
                .user_input_message_context
                .is_none()
        );
    }

    #[test]
    fn specific_tool_choice_adds_instruction() {
        let mut request = request(vec![UnifiedMessage::text(UnifiedRole::User, "Hi")]);
        request.tools = vec![tool("lookup", "Look up")];
        request.tool_choice = Some(UnifiedToolChoice::Specific {
            function: UnifiedFunctionChoice {
                name: "lookup".to_string(),
            },
        });

        let translated = translate(&request, false).unwrap();
        let state = &translated.envelope.conversation_state;

        let HistoryItem::User(first) = &state.history[0] else {
            unreachable!("Expected synthetic user turn");
        };

        assert_eq!(first.user_input_message.content, "You MUST call the `lookup` tool in this response.");
        assert_eq!(state.chat_trigger_type, CHAT_TRIGGER_MANUAL);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut request = request(vec![UnifiedMessage::text(UnifiedRole::User, "Hi")]);
        request.model = "gpt-4o".to_string();

        let error = translate(&request, false).unwrap_err();
        insta::assert_snapshot!(error, @"Model 'gpt-4o' not found");
    }

    #[test]
    fn orphan_tool_result_is_rejected() {
        let request = request(vec![tool_result("t9", "18C")]);

        let error = translate(&request, false).unwrap_err();
        insta::assert_snapshot!(error, @"Invalid request: tool result 't9' does not answer any earlier tool call");
    }

    #[test]
    fn remote_images_are_rejected() {
        let request = request(vec![UnifiedMessage {
            role: UnifiedRole::User,
            content: vec![UnifiedContent::Image {
                source: UnifiedImageSource::Url {
                    url: "https://example.com/cat.png".to_string(),
                },
            }],
        }]);

        let error = translate(&request, false).unwrap_err();
        assert!(matches!(error, GatewayError::Validation(_)));
    }

    #[test]
    fn inline_images_keep_their_format() {
        let request = request(vec![UnifiedMessage {
            role: UnifiedRole::User,
            content: vec![
                UnifiedContent::Text {
                    text: "What is this?".to_string(),
                },
                UnifiedContent::Image {
                    source: UnifiedImageSource::Base64 {
                        media_type: "image/png".to_string(),
                        data: "iVBORw0KGgo=".to_string(),
                    },
                },
            ],
        }]);

        let translated = translate(&request, false).unwrap();
        let images = &translated.envelope.conversation_state.current_message.user_input_message.images;

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].format, "png");
        assert_eq!(images[0].source.bytes, "iVBORw0KGgo=");
    }

    #[test]
    fn continuation_appends_partial_answer() {
        let mut original = request(vec![UnifiedMessage::text(UnifiedRole::User, "Write a long poem.")]);
        original.tool_choice = Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::Required));

        let continued = continuation_request(&original, "Roses are red,\nviolets");

        assert_eq!(continued.messages.len(), 3);
        assert_eq!(continued.messages[1], UnifiedMessage::text(UnifiedRole::Assistant, "Roses are red,\nviolets"));
        assert_eq!(continued.messages[2].joined_text(), CONTINUATION_PROMPT);
        assert_eq!(
            continued.tool_choice,
            Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::Auto))
        );
    }
}
