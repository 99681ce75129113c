//! Decoder for the binary EventStream framing used by the backend.
//!
//! Every frame is laid out in network byte order:
//!
//! ```text
//! prelude:  total_length:u32 | headers_length:u32 | prelude_crc32:u32
//! headers:  repeated { name_len:u8, name, value_type:u8, value }
//! payload:  total_length - headers_length - 16 bytes
//! trailer:  message_crc32:u32
//! ```
//!
//! The decoder is fed arbitrary-sized chunks and yields a frame only once all
//! of its bytes arrived and both checksums match.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
const MIN_FRAME_LEN: u32 = 16;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One decoded frame: typed headers and the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub headers: Vec<Header>,
    pub payload: Bytes,
}

impl Frame {
    /// Value of a string-typed header. Headers of other types are ignored.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|header| match &header.value {
            HeaderValue::String(value) if header.name == name => Some(value.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Header {
    pub name: String,
    pub value: HeaderValue,
}

// Only `String` values are consulted by the event mapper.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
    String(String),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    AwaitingPrelude,
    AwaitingHeadersAndPayload { total_length: usize, headers_length: usize },
}

/// Pull-based frame decoder over a growing byte buffer.
#[derive(Debug)]
pub(crate) struct FrameDecoder {
    buffer: BytesMut,
    state: DecoderState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: DecoderState::AwaitingPrelude,
        }
    }

    /// Append bytes received from the network.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes of an incomplete
    /// frame stay in the buffer, so calling this again after [`push`](Self::push)
    /// resumes exactly where the previous call stopped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                DecoderState::AwaitingPrelude => {
                    if self.buffer.len() < PRELUDE_LEN {
                        return Ok(None);
                    }

                    let mut prelude = &self.buffer[..PRELUDE_LEN];
                    let total_length = prelude.get_u32();
                    let headers_length = prelude.get_u32();
                    let prelude_crc = prelude.get_u32();

                    if crc32fast::hash(&self.buffer[..8]) != prelude_crc {
                        return Err(ProtocolError::CrcMismatch("prelude"));
                    }

                    if total_length > MAX_FRAME_LEN {
                        return Err(ProtocolError::FrameTooLarge(total_length));
                    }

                    if total_length < MIN_FRAME_LEN || headers_length > total_length - MIN_FRAME_LEN {
                        return Err(ProtocolError::InvalidLength {
                            total: total_length,
                            headers: headers_length,
                        });
                    }

                    self.state = DecoderState::AwaitingHeadersAndPayload {
                        total_length: total_length as usize,
                        headers_length: headers_length as usize,
                    };
                }
                DecoderState::AwaitingHeadersAndPayload {
                    total_length,
                    headers_length,
                } => {
                    if self.buffer.len() < total_length {
                        return Ok(None);
                    }

                    let frame = self.buffer.split_to(total_length).freeze();
                    self.state = DecoderState::AwaitingPrelude;

                    let crc_offset = total_length - CRC_LEN;
                    let message_crc = (&frame[crc_offset..]).get_u32();

                    if crc32fast::hash(&frame[..crc_offset]) != message_crc {
                        return Err(ProtocolError::CrcMismatch("message"));
                    }

                    let headers_end = PRELUDE_LEN + headers_length;
                    let headers = parse_headers(&frame[PRELUDE_LEN..headers_end])?;
                    let payload = frame.slice(headers_end..crc_offset);

                    return Ok(Some(Frame { headers, payload }));
                }
            }
        }
    }

    /// Check that the byte source did not stop in the middle of a frame.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedFrame)
        }
    }
}

fn parse_headers(mut data: &[u8]) -> Result<Vec<Header>, ProtocolError> {
    let mut headers = Vec::new();

    while !data.is_empty() {
        let name_len = take(&mut data, 1)?[0] as usize;
        let name = std::str::from_utf8(take(&mut data, name_len)?)
            .map_err(|_| ProtocolError::MalformedHeader("header name is not UTF-8".to_string()))?
            .to_string();

        let value_type = take(&mut data, 1)?[0];

        let value = match value_type {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(take(&mut data, 1)?.get_i8()),
            3 => HeaderValue::Short(take(&mut data, 2)?.get_i16()),
            4 => HeaderValue::Int(take(&mut data, 4)?.get_i32()),
            5 => HeaderValue::Long(take(&mut data, 8)?.get_i64()),
            6 => {
                let len = take(&mut data, 2)?.get_u16() as usize;
                HeaderValue::Bytes(Bytes::copy_from_slice(take(&mut data, len)?))
            }
            7 => {
                let len = take(&mut data, 2)?.get_u16() as usize;
                let value = std::str::from_utf8(take(&mut data, len)?)
                    .map_err(|_| ProtocolError::MalformedHeader(format!("value of '{name}' is not UTF-8")))?;

                HeaderValue::String(value.to_string())
            }
            8 => HeaderValue::Timestamp(take(&mut data, 8)?.get_i64()),
            9 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(take(&mut data, 16)?);
                HeaderValue::Uuid(uuid)
            }
            other => {
                return Err(ProtocolError::MalformedHeader(format!(
                    "unknown value type {other} for '{name}'"
                )));
            }
        };

        headers.push(Header { name, value });
    }

    Ok(headers)
}

fn take<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8], ProtocolError> {
    let Some((head, rest)) = data.split_at_checked(len) else {
        return Err(ProtocolError::MalformedHeader(format!(
            "header block ends {} bytes early",
            len - data.len()
        )));
    };

    *data = rest;

    Ok(head)
}

/// Encode a frame with string headers, the way the backend does.
#[cfg(test)]
pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    use bytes::BufMut;

    let mut header_block = Vec::new();

    for (name, value) in headers {
        header_block.put_u8(name.len() as u8);
        header_block.put_slice(name.as_bytes());
        header_block.put_u8(7);
        header_block.put_u16(value.len() as u16);
        header_block.put_slice(value.as_bytes());
    }

    let total_length = (PRELUDE_LEN + header_block.len() + payload.len() + CRC_LEN) as u32;

    let mut frame = Vec::with_capacity(total_length as usize);
    frame.put_u32(total_length);
    frame.put_u32(header_block.len() as u32);
    let prelude_crc = crc32fast::hash(&frame[..8]);
    frame.put_u32(prelude_crc);
    frame.put_slice(&header_block);
    frame.put_slice(payload);
    let message_crc = crc32fast::hash(&frame);
    frame.put_u32(message_crc);

    frame
}

/// Encode a regular `event` message carrying a JSON payload.
#[cfg(test)]
pub(crate) fn encode_event(event_type: &str, payload: serde_json::Value) -> Vec<u8> {
    encode_frame(
        &[
            (":message-type", "event"),
            (":event-type", event_type),
            (":content-type", "application/json"),
        ],
        payload.to_string().as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use serde_json::json;

    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let mut decoder = FrameDecoder::new();
        decoder.push(bytes);

        let mut frames = Vec::new();

        while let Some(frame) = decoder.next_frame()? {
            frames.push(frame);
        }

        decoder.finish()?;

        Ok(frames)
    }

    #[test]
    fn decodes_single_event() {
        let bytes = encode_event("assistantResponseEvent", json!({"content": "Hello"}));
        let frames = decode_all(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header_str(":event-type"), Some("assistantResponseEvent"));
        assert_eq!(frames[0].header_str(":message-type"), Some("event"));
        assert_eq!(&frames[0].payload[..], br#"{"content":"Hello"}"#);
    }

    #[test]
    fn resumes_across_arbitrary_chunk_boundaries() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "Hel"}));
        bytes.extend(encode_event("assistantResponseEvent", json!({"content": "lo"})));

        for chunk_size in [1, 2, 3, 7, 11, 12, 13, 50] {
            let mut decoder = FrameDecoder::new();
            let mut payloads = Vec::new();

            for chunk in bytes.chunks(chunk_size) {
                decoder.push(chunk);

                while let Some(frame) = decoder.next_frame().unwrap() {
                    payloads.push(String::from_utf8(frame.payload.to_vec()).unwrap());
                }
            }

            decoder.finish().unwrap();

            assert_eq!(
                payloads,
                vec![r#"{"content":"Hel"}"#, r#"{"content":"lo"}"#],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn frame_without_headers_or_payload() {
        let bytes = encode_frame(&[], b"");
        let frames = decode_all(&bytes).unwrap();

        assert_eq!(bytes.len(), 16);
        assert!(frames[0].headers.is_empty());
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn any_single_bit_flip_in_crc_regions_is_rejected() {
        let bytes = encode_event("assistantResponseEvent", json!({"content": "4"}));
        let message_crc_start = bytes.len() - 4;

        let crc_bytes = (8..12).chain(message_crc_start..bytes.len());

        for index in crc_bytes {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[index] ^= 1 << bit;

                let mut decoder = FrameDecoder::new();
                decoder.push(&corrupted);

                let error = decoder.next_frame().unwrap_err();
                assert!(
                    matches!(error, ProtocolError::CrcMismatch(_)),
                    "byte {index} bit {bit}: {error:?}"
                );
            }
        }
    }

    #[test]
    fn corrupted_payload_fails_message_crc() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "4"}));
        let payload_byte = bytes.len() - 6;
        bytes[payload_byte] ^= 0x01;

        let error = decode_all(&bytes).unwrap_err();
        insta::assert_snapshot!(error, @"crc mismatch (message)");
    }

    #[test]
    fn corrupted_length_fails_prelude_crc() {
        let mut bytes = encode_event("assistantResponseEvent", json!({"content": "4"}));
        bytes[3] ^= 0x10;

        let error = decode_all(&bytes).unwrap_err();
        insta::assert_snapshot!(error, @"crc mismatch (prelude)");
    }

    #[test]
    fn incomplete_frame_is_truncated() {
        let bytes = encode_event("assistantResponseEvent", json!({"content": "Hello"}));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes[..bytes.len() - 1]);

        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.finish().unwrap_err(), ProtocolError::TruncatedFrame);
    }

    #[test]
    fn rejects_lengths_below_minimum() {
        let mut bytes = Vec::new();
        bytes.put_u32(8);
        bytes.put_u32(0);
        let crc = crc32fast::hash(&bytes);
        bytes.put_u32(crc);

        let error = decode_all(&bytes).unwrap_err();
        insta::assert_snapshot!(error, @"invalid frame length: total 8, headers 0");
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut bytes = Vec::new();
        bytes.put_u32(MAX_FRAME_LEN + 1);
        bytes.put_u32(0);
        let crc = crc32fast::hash(&bytes);
        bytes.put_u32(crc);

        let error = decode_all(&bytes).unwrap_err();
        insta::assert_snapshot!(error, @"frame of 16777217 bytes exceeds the 16 MiB limit");
    }

    #[test]
    fn decodes_every_header_type() {
        let mut block = Vec::new();

        let put_name = |block: &mut Vec<u8>, name: &str, value_type: u8| {
            block.put_u8(name.len() as u8);
            block.put_slice(name.as_bytes());
            block.put_u8(value_type);
        };

        put_name(&mut block, "t", 0);
        put_name(&mut block, "f", 1);
        put_name(&mut block, "b", 2);
        block.put_i8(-1);
        put_name(&mut block, "s", 3);
        block.put_i16(300);
        put_name(&mut block, "i", 4);
        block.put_i32(70_000);
        put_name(&mut block, "l", 5);
        block.put_i64(1 << 40);
        put_name(&mut block, "y", 6);
        block.put_u16(2);
        block.put_slice(&[0xde, 0xad]);
        put_name(&mut block, "str", 7);
        block.put_u16(2);
        block.put_slice(b"ok");
        put_name(&mut block, "ts", 8);
        block.put_i64(1_700_000_000_000);
        put_name(&mut block, "u", 9);
        block.put_slice(&[7u8; 16]);

        let headers = parse_headers(&block).unwrap();
        let values: Vec<_> = headers.into_iter().map(|header| header.value).collect();

        assert_eq!(
            values,
            vec![
                HeaderValue::Bool(true),
                HeaderValue::Bool(false),
                HeaderValue::Byte(-1),
                HeaderValue::Short(300),
                HeaderValue::Int(70_000),
                HeaderValue::Long(1 << 40),
                HeaderValue::Bytes(Bytes::from_static(&[0xde, 0xad])),
                HeaderValue::String("ok".to_string()),
                HeaderValue::Timestamp(1_700_000_000_000),
                HeaderValue::Uuid([7u8; 16]),
            ]
        );
    }

    #[test]
    fn short_header_block_is_malformed() {
        let mut block = Vec::new();
        block.put_u8(3);
        block.put_slice(b"abc");
        block.put_u8(7);
        block.put_u16(10);
        block.put_slice(b"short");

        let error = parse_headers(&block).unwrap_err();
        insta::assert_snapshot!(error, @"malformed header: header block ends 5 bytes early");
    }
}
