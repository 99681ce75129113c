//! Typed events decoded from EventStream frames.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use super::eventstream::Frame;
use crate::{error::ProtocolError, messages::unified::response_id};

/// One backend event, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamEvent {
    TextDelta(String),
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta { id: String, fragment: String },
    ToolUseStop { id: String },
    /// Share of the context window in use, as reported by the backend.
    ContextUsage(f64),
    Exception { kind: String, message: String },
    End,
}

#[derive(Debug, Deserialize)]
struct ContentEvent {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseEvent {
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    stop: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextUsageEvent {
    context_usage_percentage: f64,
}

/// Maps frames to [`StreamEvent`]s, tracking which tool uses are open so that
/// the first fragment of an id also announces its start.
#[derive(Debug, Default)]
pub(crate) struct EventMapper {
    open_tools: HashSet<String>,
    current_tool: Option<String>,
}

impl EventMapper {
    pub fn map(&mut self, frame: &Frame) -> Result<Vec<StreamEvent>, ProtocolError> {
        let message_type = frame.header_str(":message-type").unwrap_or("event");

        if matches!(message_type, "exception" | "error") {
            return Ok(vec![exception(frame)]);
        }

        let Some(event_type) = frame.header_str(":event-type") else {
            log::debug!("Ignoring backend frame without an event type");
            return Ok(Vec::new());
        };

        let events = match event_type {
            "assistantResponseEvent" | "codeEvent" => {
                let event: ContentEvent = parse(event_type, &frame.payload)?;

                if event.content.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::TextDelta(event.content)]
                }
            }
            "toolUseEvent" => {
                let event: ToolUseEvent = parse(event_type, &frame.payload)?;
                self.tool_use(event)?
            }
            "toolUse" => {
                let event: ToolUseEvent = parse(event_type, &frame.payload)?;
                self.complete_tool_use(event)
            }
            "contextUsageEvent" => {
                let event: ContextUsageEvent = parse(event_type, &frame.payload)?;
                vec![StreamEvent::ContextUsage(event.context_usage_percentage)]
            }
            other => {
                log::debug!("Ignoring backend event '{other}'");
                Vec::new()
            }
        };

        Ok(events)
    }

    fn tool_use(&mut self, event: ToolUseEvent) -> Result<Vec<StreamEvent>, ProtocolError> {
        let Some(id) = event.tool_use_id.or_else(|| self.current_tool.clone()) else {
            return Err(ProtocolError::MalformedPayload {
                event: "toolUseEvent".to_string(),
                reason: "missing toolUseId outside of an open tool use".to_string(),
            });
        };

        let mut events = Vec::with_capacity(3);

        if !self.open_tools.contains(&id)
            && let Some(name) = event.name
        {
            self.open_tools.insert(id.clone());
            self.current_tool = Some(id.clone());

            events.push(StreamEvent::ToolUseStart { id: id.clone(), name });
        }

        match event.input {
            Some(Value::String(fragment)) if !fragment.is_empty() => {
                events.push(StreamEvent::ToolUseInputDelta { id: id.clone(), fragment });
            }
            Some(Value::String(_)) | Some(Value::Null) | None => {}
            Some(value) => {
                events.push(StreamEvent::ToolUseInputDelta {
                    id: id.clone(),
                    fragment: value.to_string(),
                });
            }
        }

        if event.stop {
            self.open_tools.remove(&id);

            if self.current_tool.as_ref() == Some(&id) {
                self.current_tool = None;
            }

            events.push(StreamEvent::ToolUseStop { id });
        }

        Ok(events)
    }

    /// Legacy events carry the whole tool call in one payload.
    fn complete_tool_use(&mut self, event: ToolUseEvent) -> Vec<StreamEvent> {
        let id = event.tool_use_id.unwrap_or_else(generated_tool_id);
        let name = event.name.unwrap_or_default();

        let mut events = vec![StreamEvent::ToolUseStart { id: id.clone(), name }];

        match event.input {
            None | Some(Value::Null) => {}
            Some(Value::String(fragment)) => {
                events.push(StreamEvent::ToolUseInputDelta { id: id.clone(), fragment });
            }
            Some(value) => {
                events.push(StreamEvent::ToolUseInputDelta {
                    id: id.clone(),
                    fragment: value.to_string(),
                });
            }
        }

        events.push(StreamEvent::ToolUseStop { id });
        events
    }
}

fn exception(frame: &Frame) -> StreamEvent {
    let kind = frame
        .header_str(":exception-type")
        .or_else(|| frame.header_str(":error-code"))
        .unwrap_or("exception")
        .to_string();

    let message = serde_json::from_slice::<Value>(&frame.payload)
        .ok()
        .and_then(|payload| {
            payload
                .get("message")
                .or_else(|| payload.get("Message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).into_owned());

    StreamEvent::Exception { kind, message }
}

fn parse<'a, T: Deserialize<'a>>(event: &str, payload: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|error| ProtocolError::MalformedPayload {
        event: event.to_string(),
        reason: error.to_string(),
    })
}

fn generated_tool_id() -> String {
    response_id("call_")
}
