//! The backend conversation API: request envelope, HTTP client and the
//! decoding pipeline from response bytes to aggregated events.
//!
//! ```text
//! bytes ─► FrameDecoder ─► EventMapper ─► ToolCallAggregator ─► AggregatedEvent
//! ```

mod aggregator;
mod client;
mod envelope;
mod events;
mod eventstream;
mod request;

use futures::{StreamExt, stream::BoxStream};

pub(crate) use aggregator::{AggregatedEvent, CompletedToolCall};
pub(crate) use client::{BackendClient, BackendTransport, ByteStream, ReqwestTransport};
pub use envelope::{InputSchema, ToolSpecification};
pub(crate) use request::{RequestTranslator, continuation_request};

#[cfg(test)]
pub(crate) use client::scripted::{ScriptedResponse, ScriptedTransport};
#[cfg(test)]
pub(crate) use eventstream::{encode_event, encode_frame};
#[cfg(test)]
pub(crate) use request::CONTINUATION_PROMPT;

use aggregator::ToolCallAggregator;
use events::{EventMapper, StreamEvent};
use eventstream::FrameDecoder;

use crate::error::{GatewayError, ProtocolError};

/// Aggregated events of one backend response, in emission order, always
/// terminated by [`AggregatedEvent::End`] unless an error ends it first.
pub(crate) type BackendEvents = BoxStream<'static, Result<AggregatedEvent, GatewayError>>;

/// Per-response decoding state.
#[derive(Debug, Default)]
struct EventPipeline {
    decoder: FrameDecoder,
    mapper: EventMapper,
    aggregator: ToolCallAggregator,
}

impl EventPipeline {
    fn push(&mut self, chunk: &[u8]) {
        self.decoder.push(chunk);
    }

    /// Decodes the next buffered frame, if one is complete.
    fn next_frame(&mut self) -> Result<Option<Vec<AggregatedEvent>>, ProtocolError> {
        let Some(frame) = self.decoder.next_frame()? else {
            return Ok(None);
        };

        let mut events = Vec::new();

        for event in self.mapper.map(&frame)? {
            events.extend(self.aggregator.push(event)?);
        }

        Ok(Some(events))
    }

    fn finish(&mut self) -> Result<Vec<AggregatedEvent>, ProtocolError> {
        self.decoder.finish()?;
        self.aggregator.push(StreamEvent::End)
    }
}

/// Turns a response body into aggregated events.
///
/// The body is pulled one network chunk at a time; dropping the returned
/// stream drops the body and aborts the HTTP call.
pub(crate) fn decode_events(mut body: ByteStream) -> BackendEvents {
    let stream = async_stream::stream! {
        let mut pipeline = EventPipeline::default();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => pipeline.push(&chunk),
                Err(error) => {
                    let error = ProtocolError::Interrupted(error.to_string());
                    log::error!("Backend stream failed: {error}");
                    yield Err(GatewayError::from(error));
                    return;
                }
            }

            // Events of every frame decoded so far go out before a later frame can fail.
            loop {
                match pipeline.next_frame() {
                    Ok(Some(events)) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        log::error!("Backend stream failed: {error}");
                        yield Err(GatewayError::from(error));
                        return;
                    }
                }
            }
        }

        match pipeline.finish() {
            Ok(events) => {
                for event in events {
                    yield Ok(event);
                }
            }
            Err(error) => {
                log::error!("Backend stream failed: {error}");
                yield Err(GatewayError::from(error));
            }
        }
    };

    stream.boxed()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{StreamExt, TryStreamExt, stream};
    use serde_json::json;

    use super::*;
    use crate::backend::client::TransportError;

    fn body(bytes: Vec<u8>, chunk_size: usize) -> ByteStream {
        let chunks: Vec<_> = bytes
            .chunks(chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        stream::iter(chunks).boxed()
    }

    fn lookup_call() -> Vec<u8> {
        let mut bytes = Vec::new();

        bytes.extend(encode_event(
            "toolUseEvent",
            json!({"toolUseId": "t1", "name": "lookup", "input": "{\"q\":"}),
        ));
        bytes.extend(encode_event(
            "toolUseEvent",
            json!({"toolUseId": "t1", "name": "lookup", "input": "\"x\"}"}),
        ));
        bytes.extend(encode_event(
            "toolUseEvent",
            json!({"toolUseId": "t1", "name": "lookup", "stop": true}),
        ));

        bytes
    }

    #[tokio::test]
    async fn tool_call_survives_any_chunking() {
        let bytes = lookup_call();

        for chunk_size in [1, 7, 64, bytes.len()] {
            let events: Vec<_> = decode_events(body(bytes.clone(), chunk_size))
                .try_collect()
                .await
                .unwrap();

            let [AggregatedEvent::ToolCallComplete(call), AggregatedEvent::End] = events.as_slice() else {
                unreachable!("Unexpected events for chunk size {chunk_size}: {events:?}");
            };

            assert_eq!(call.name, "lookup");
            assert_eq!(call.arguments, json!({"q": "x"}));
            assert_eq!(call.fragment_count, 2);
        }
    }

    #[tokio::test]
    async fn text_and_context_usage() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "4"}));
        bytes.extend(encode_event("contextUsageEvent", json!({"contextUsagePercentage": 12.5})));

        let events: Vec<_> = decode_events(body(bytes, 5)).try_collect().await.unwrap();

        insta::assert_debug_snapshot!(events, @r#"
        [
            Text(
                "4",
            ),
            ContextUsage(
                12.5,
            ),
            End,
        ]
        "#);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "4"}));
        let second = encode_event("assistantResponseEvent", json!({"content": "5"}));
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let results: Vec<_> = decode_events(body(bytes, 16)).collect().await;

        assert!(matches!(results[0], Ok(AggregatedEvent::Text(ref text)) if text == "4"));
        assert!(matches!(
            results[1],
            Err(GatewayError::Protocol(ProtocolError::TruncatedFrame))
        ));
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_frame_stops_the_stream() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "4"}));
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        bytes.extend(encode_event("assistantResponseEvent", json!({"content": "5"})));

        let results: Vec<_> = decode_events(body(bytes, 1024)).collect().await;

        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(GatewayError::Protocol(ProtocolError::CrcMismatch("message")))
        ));
    }

    #[tokio::test]
    async fn frames_before_a_corrupt_frame_are_kept() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "kept"}));
        let mut corrupt = encode_event("assistantResponseEvent", json!({"content": "lost"}));
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        bytes.extend(corrupt);

        let results: Vec<_> = decode_events(body(bytes, usize::MAX)).collect().await;

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Ok(AggregatedEvent::Text(ref text)) if text == "kept"));
        assert!(matches!(
            results[1],
            Err(GatewayError::Protocol(ProtocolError::CrcMismatch("message")))
        ));
    }

    #[tokio::test]
    async fn frames_before_a_malformed_payload_are_kept() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "kept"}));
        bytes.extend(encode_frame(
            &[(":message-type", "event"), (":event-type", "assistantResponseEvent")],
            b"{not json",
        ));

        let results: Vec<_> = decode_events(body(bytes, usize::MAX)).collect().await;

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Ok(AggregatedEvent::Text(ref text)) if text == "kept"));
        assert!(matches!(
            results[1],
            Err(GatewayError::Protocol(ProtocolError::MalformedPayload { .. }))
        ));
    }

    #[tokio::test]
    async fn interrupted_body_is_an_error() {
        let chunks = vec![
            Ok(Bytes::from(encode_event("assistantResponseEvent", json!({"content": "4"})))),
            Err(TransportError::Network("connection reset".to_string())),
        ];

        let results: Vec<_> = decode_events(stream::iter(chunks).boxed()).collect().await;

        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Err(GatewayError::Protocol(ProtocolError::Interrupted(_)))
        ));
    }
}
