//! Reassembly of tool calls that the backend streams as input fragments.

use serde_json::Value;

use super::events::StreamEvent;
use crate::error::ProtocolError;

/// Backend events after tool-use fragments have been folded into whole calls.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AggregatedEvent {
    Text(String),
    ToolCallComplete(CompletedToolCall),
    ContextUsage(f64),
    Exception { kind: String, message: String },
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompletedToolCall {
    pub id: String,
    pub name: String,
    /// Parsed input, or the raw buffer as a JSON string when it did not parse.
    pub arguments: Value,
    pub raw_input: String,
    pub fragment_count: usize,
    pub malformed_input: bool,
}

impl CompletedToolCall {
    /// Arguments as they are handed to clients. Unparseable input is wrapped
    /// as `{"raw": ...}` so that clients always receive an object.
    pub fn public_arguments(&self) -> Value {
        if self.malformed_input {
            serde_json::json!({ "raw": self.raw_input })
        } else {
            self.arguments.clone()
        }
    }
}

#[derive(Debug)]
struct ToolCallBuilder {
    id: String,
    name: String,
    input_buffer: String,
    fragment_count: usize,
}

impl ToolCallBuilder {
    fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            input_buffer: String::new(),
            fragment_count: 0,
        }
    }

    fn finish(self) -> CompletedToolCall {
        if self.input_buffer.trim().is_empty() {
            return CompletedToolCall {
                id: self.id,
                name: self.name,
                arguments: Value::Object(Default::default()),
                raw_input: self.input_buffer,
                fragment_count: self.fragment_count,
                malformed_input: false,
            };
        }

        match serde_json::from_str(&self.input_buffer) {
            Ok(arguments) => CompletedToolCall {
                id: self.id,
                name: self.name,
                arguments,
                raw_input: self.input_buffer,
                fragment_count: self.fragment_count,
                malformed_input: false,
            },
            Err(error) => {
                log::warn!(
                    "Tool call '{}' ({}) has input that is not valid JSON after {} fragments: {error}",
                    self.name,
                    self.id,
                    self.fragment_count
                );

                CompletedToolCall {
                    id: self.id,
                    name: self.name,
                    arguments: Value::String(self.input_buffer.clone()),
                    raw_input: self.input_buffer,
                    fragment_count: self.fragment_count,
                    malformed_input: true,
                }
            }
        }
    }
}

/// Folds `ToolUseStart`/`ToolUseInputDelta`/`ToolUseStop` into
/// [`AggregatedEvent::ToolCallComplete`]. Scoped to a single response stream.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAggregator {
    builders: Vec<ToolCallBuilder>,
}

impl ToolCallAggregator {
    pub fn push(&mut self, event: StreamEvent) -> Result<Vec<AggregatedEvent>, ProtocolError> {
        let events = match event {
            StreamEvent::TextDelta(text) => vec![AggregatedEvent::Text(text)],
            StreamEvent::ToolUseStart { id, name } => {
                if let Some(position) = self.position(&id) {
                    log::warn!("Tool use '{id}' restarted before it was stopped, discarding its buffered input");
                    self.builders.remove(position);
                }

                self.builders.push(ToolCallBuilder::new(id, name));

                Vec::new()
            }
            StreamEvent::ToolUseInputDelta { id, fragment } => {
                let Some(position) = self.position(&id) else {
                    return Err(ProtocolError::UnknownToolUse(id));
                };

                let builder = &mut self.builders[position];
                builder.input_buffer.push_str(&fragment);
                builder.fragment_count += 1;

                Vec::new()
            }
            StreamEvent::ToolUseStop { id } => {
                let Some(position) = self.position(&id) else {
                    return Err(ProtocolError::UnknownToolUse(id));
                };

                let builder = self.builders.remove(position);

                vec![AggregatedEvent::ToolCallComplete(builder.finish())]
            }
            StreamEvent::ContextUsage(usage) => vec![AggregatedEvent::ContextUsage(usage)],
            StreamEvent::Exception { kind, message } => vec![AggregatedEvent::Exception { kind, message }],
            StreamEvent::End => {
                let mut events: Vec<_> = self
                    .builders
                    .drain(..)
                    .map(|builder| {
                        log::warn!(
                            "Backend stream ended before tool use '{}' ({}) was stopped",
                            builder.name,
                            builder.id
                        );

                        AggregatedEvent::ToolCallComplete(builder.finish())
                    })
                    .collect();

                events.push(AggregatedEvent::End);
                events
            }
        };

        Ok(events)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.builders.iter().position(|builder| builder.id == id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn start(id: &str, name: &str) -> StreamEvent {
        StreamEvent::ToolUseStart {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn delta(id: &str, fragment: &str) -> StreamEvent {
        StreamEvent::ToolUseInputDelta {
            id: id.to_string(),
            fragment: fragment.to_string(),
        }
    }

    fn stop(id: &str) -> StreamEvent {
        StreamEvent::ToolUseStop { id: id.to_string() }
    }

    fn run(events: Vec<StreamEvent>) -> Result<Vec<AggregatedEvent>, ProtocolError> {
        let mut aggregator = ToolCallAggregator::default();
        let mut output = Vec::new();

        for event in events {
            output.extend(aggregator.push(event)?);
        }

        Ok(output)
    }

    fn completed(events: &[AggregatedEvent]) -> Vec<&CompletedToolCall> {
        events
            .iter()
            .filter_map(|event| match event {
                AggregatedEvent::ToolCallComplete(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fragments_concatenate_in_order() {
        let input = r#"{"query":"rust eventstream","limit":10,"filters":{"lang":["en","de"]}}"#;

        for fragment_len in 1..=input.len() {
            let mut events = vec![start("t1", "search")];

            let chars: Vec<char> = input.chars().collect();
            for fragment in chars.chunks(fragment_len) {
                events.push(delta("t1", &fragment.iter().collect::<String>()));
            }

            events.push(stop("t1"));

            let output = run(events).unwrap();
            let calls = completed(&output);

            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].raw_input, input);
            assert_eq!(calls[0].arguments, serde_json::from_str::<Value>(input).unwrap());
            assert_eq!(calls[0].fragment_count, input.len().div_ceil(fragment_len));
            assert!(!calls[0].malformed_input);
        }
    }

    #[test]
    fn lookup_scenario() {
        let output = run(vec![
            start("t1", "lookup"),
            delta("t1", "{\"q\":"),
            delta("t1", "\"x\"}"),
            stop("t1"),
            StreamEvent::End,
        ])
        .unwrap();

        insta::assert_debug_snapshot!(output, @r#"
        [
            ToolCallComplete(
                CompletedToolCall {
                    id: "t1",
                    name: "lookup",
                    arguments: Object {
                        "q": String("x"),
                    },
                    raw_input: "{\"q\":\"x\"}",
                    fragment_count: 2,
                    malformed_input: false,
                },
            ),
            End,
        ]
        "#);
    }

    #[test]
    fn empty_input_becomes_empty_object() {
        let output = run(vec![start("t1", "now"), stop("t1")]).unwrap();

        assert_eq!(completed(&output)[0].arguments, json!({}));
    }

    #[test]
    fn malformed_input_is_kept_raw() {
        let output = run(vec![start("t1", "write"), delta("t1", "{\"path\": \"a.txt\", "), stop("t1")]).unwrap();
        let call = completed(&output)[0];

        assert!(call.malformed_input);
        assert_eq!(call.arguments, Value::String("{\"path\": \"a.txt\", ".to_string()));
        assert_eq!(call.public_arguments(), json!({"raw": "{\"path\": \"a.txt\", "}));
    }

    #[test]
    fn delta_without_start_is_a_protocol_error() {
        let error = run(vec![delta("ghost", "{}")]).unwrap_err();

        assert_eq!(error, ProtocolError::UnknownToolUse("ghost".to_string()));
    }

    #[test]
    fn stop_without_start_is_a_protocol_error() {
        let error = run(vec![start("t1", "a"), stop("t1"), stop("t1")]).unwrap_err();

        assert_eq!(error, ProtocolError::UnknownToolUse("t1".to_string()));
    }

    #[test]
    fn second_start_restarts_the_builder() {
        let output = run(vec![
            start("t1", "a"),
            delta("t1", "{\"stale\":"),
            start("t1", "b"),
            delta("t1", "{\"fresh\":true}"),
            stop("t1"),
        ])
        .unwrap();

        let calls = completed(&output);

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "b");
        assert_eq!(calls[0].arguments, json!({"fresh": true}));
    }

    #[test]
    fn text_and_tool_calls_keep_backend_order() {
        let output = run(vec![
            StreamEvent::TextDelta("Let me check.".to_string()),
            start("t1", "lookup"),
            delta("t1", "{}"),
            StreamEvent::ContextUsage(3.0),
            stop("t1"),
            StreamEvent::TextDelta("Done".to_string()),
            StreamEvent::End,
        ])
        .unwrap();

        let kinds: Vec<_> = output
            .iter()
            .map(|event| match event {
                AggregatedEvent::Text(_) => "text",
                AggregatedEvent::ToolCallComplete(_) => "tool",
                AggregatedEvent::ContextUsage(_) => "usage",
                AggregatedEvent::Exception { .. } => "exception",
                AggregatedEvent::End => "end",
            })
            .collect();

        assert_eq!(kinds, vec!["text", "usage", "tool", "text", "end"]);
    }

    #[test]
    fn unstopped_calls_are_flushed_at_end() {
        let output = run(vec![start("t1", "lookup"), delta("t1", "{\"q\":1}"), StreamEvent::End]).unwrap();

        assert_eq!(completed(&output)[0].arguments, json!({"q": 1}));
        assert_eq!(output.last(), Some(&AggregatedEvent::End));
    }
}
