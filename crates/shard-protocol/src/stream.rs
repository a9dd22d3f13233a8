//! Framing for the ordered streaming channel.
//!
//! A frame is laid out as:
//!
//! ```text
//! +------+------+--------+------------+---------+
//! | RSF1 | type | status | len (u32be)| payload |
//! +------+------+--------+------------+---------+
//! ```
//!
//! The payload is the JSON encoding of a [`StreamingMessage`]. The header
//! duplicates its type and status so a reader can route frames without
//! parsing them. A response that does not start with the magic bytes is a
//! plain JSON error envelope written by the dispatcher.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::records::ChunkRecord;
use crate::response::{EnhancedErrorInfo, ReceivedArtifact, StillRenderedPayload};

pub const MAGIC: &[u8; 4] = b"RSF1";
const HEADER_LEN: usize = 10;
/// Largest payload accepted by [`StreamFrameCodec`].
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamMessageType {
    RenderIdDetermined = 1,
    ErrorOccurred = 2,
    StillRendered = 3,
    FramesRendered = 4,
    ChunkRendered = 5,
    ArtifactEmitted = 6,
}

impl StreamMessageType {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self, ProtocolError> {
        Ok(match id {
            1 => Self::RenderIdDetermined,
            2 => Self::ErrorOccurred,
            3 => Self::StillRendered,
            4 => Self::FramesRendered,
            5 => Self::ChunkRendered,
            6 => Self::ArtifactEmitted,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RenderIdDetermined => "render-id-determined",
            Self::ErrorOccurred => "error-occurred",
            Self::StillRendered => "still-rendered",
            Self::FramesRendered => "frames-rendered",
            Self::ChunkRendered => "chunk-rendered",
            Self::ArtifactEmitted => "artifact-emitted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamStatus {
    Success = 0,
    Error = 1,
}

impl StreamStatus {
    pub fn from_id(id: u8) -> Result<Self, ProtocolError> {
        match id {
            0 => Ok(Self::Success),
            1 => Ok(Self::Error),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Typed body of a stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum StreamingPayload {
    #[serde(rename_all = "camelCase")]
    RenderIdDetermined { render_id: String },
    #[serde(rename_all = "camelCase")]
    ErrorOccurred {
        error: String,
        should_retry: bool,
        error_info: EnhancedErrorInfo,
    },
    StillRendered(StillRenderedPayload),
    #[serde(rename_all = "camelCase")]
    FramesRendered { rendered: u32, encoded: u32 },
    ChunkRendered(ChunkRecord),
    ArtifactEmitted(ReceivedArtifact),
}

impl StreamingPayload {
    pub fn message_type(&self) -> StreamMessageType {
        match self {
            Self::RenderIdDetermined { .. } => StreamMessageType::RenderIdDetermined,
            Self::ErrorOccurred { .. } => StreamMessageType::ErrorOccurred,
            Self::StillRendered(_) => StreamMessageType::StillRendered,
            Self::FramesRendered { .. } => StreamMessageType::FramesRendered,
            Self::ChunkRendered(_) => StreamMessageType::ChunkRendered,
            Self::ArtifactEmitted(_) => StreamMessageType::ArtifactEmitted,
        }
    }

    /// Whether the message ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ErrorOccurred { .. } | Self::StillRendered(_) | Self::ChunkRendered(_)
        )
    }
}

/// `{successType, message: {type, payload}}` as carried in each frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingMessage {
    pub success_type: StreamStatus,
    pub message: StreamingPayload,
}

impl StreamingMessage {
    pub fn new(message: StreamingPayload) -> Self {
        let success_type = match message {
            StreamingPayload::ErrorOccurred { .. } => StreamStatus::Error,
            _ => StreamStatus::Success,
        };
        Self {
            success_type,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub status: StreamStatus,
    pub message_type: StreamMessageType,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn decode_message(&self) -> Result<StreamingMessage, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Serialize a message into a frame ready for [`StreamFrameCodec`].
pub fn make_stream_payload(message: &StreamingMessage) -> Result<StreamFrame, ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    Ok(StreamFrame {
        status: message.success_type,
        message_type: message.message.message_type(),
        payload: Bytes::from(payload),
    })
}

/// Whether a response body carries stream frames rather than a JSON envelope.
pub fn is_stream_frame(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFrameCodec;

impl Decoder for StreamFrameCodec {
    type Item = StreamFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let magic_len = src.len().min(MAGIC.len());
        if src[..magic_len] != MAGIC[..magic_len] {
            return Err(ProtocolError::BadMagic);
        }
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let message_type = StreamMessageType::from_id(src[4])?;
        let status = StreamStatus::from_id(src[5])?;
        let len = u32::from_be_bytes([src[6], src[7], src[8], src[9]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(StreamFrame {
            status,
            message_type,
            payload,
        }))
    }
}

impl Encoder<StreamFrame> for StreamFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: StreamFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_slice(MAGIC);
        dst.put_u8(item.message_type.id());
        dst.put_u8(item.status as u8);
        dst.put_u32(len as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_id_message() -> StreamingMessage {
        StreamingMessage::new(StreamingPayload::RenderIdDetermined {
            render_id: "abc123".to_string(),
        })
    }

    #[test]
    fn test_message_envelope_shape() {
        let value = serde_json::to_value(render_id_message()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "successType": "success",
                "message": {"type": "render-id-determined", "payload": {"renderId": "abc123"}}
            })
        );
    }

    #[test]
    fn test_codec_handles_partial_input() {
        let frame = make_stream_payload(&render_id_message()).unwrap();
        let mut encoded = BytesMut::new();
        StreamFrameCodec.encode(frame.clone(), &mut encoded).unwrap();
        assert!(is_stream_frame(&encoded));

        let mut codec = StreamFrameCodec;
        let mut partial = BytesMut::from(&encoded[..7]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[7..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(partial.is_empty());
        assert_eq!(decoded.decode_message().unwrap(), render_id_message());
    }

    #[test]
    fn test_codec_rejects_json_body() {
        let mut body = BytesMut::from(&br#"{"type":"error"}"#[..]);
        assert!(!is_stream_frame(&body));
        assert!(matches!(
            StreamFrameCodec.decode(&mut body),
            Err(ProtocolError::BadMagic)
        ));
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(matches!(
            StreamFrameCodec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_error_message_is_error_status() {
        let message = StreamingMessage::new(StreamingPayload::ErrorOccurred {
            error: "Target closed".to_string(),
            should_retry: true,
            error_info: EnhancedErrorInfo {
                attempt: 1,
                total_attempts: 2,
                chunk: Some(0),
                frame: None,
                is_fatal: false,
                will_retry: true,
                error_type: "renderer".to_string(),
                name: "Error".to_string(),
                message: "Target closed".to_string(),
                stack: String::new(),
                explanation: None,
            },
        });
        assert_eq!(message.success_type, StreamStatus::Error);
        assert!(message.message.is_terminal());
    }
}
