//! Routine payloads, discriminated by their `type` field.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{
    AudioCodec, Codec, CompositionInfo, DeleteAfter, FrameRange, ImageFormat, LogLevel, OutName,
    Privacy, WebhookOption,
};

/// Every routine a worker can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Routine {
    Start,
    Launch,
    Renderer,
    Status,
    Still,
    Info,
    Compositions,
}

impl Routine {
    pub const ALL: [Routine; 7] = [
        Self::Start,
        Self::Launch,
        Self::Renderer,
        Self::Status,
        Self::Still,
        Self::Info,
        Self::Compositions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Launch => "launch",
            Self::Renderer => "renderer",
            Self::Status => "status",
            Self::Still => "still",
            Self::Info => "info",
            Self::Compositions => "compositions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }

    /// `info` is the only routine callable without a matching version, so
    /// clients can discover what a deployed function runs.
    pub fn requires_version(&self) -> bool {
        !matches!(self, Self::Info)
    }

    /// Routines whose response is delivered over the framed stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Renderer | Self::Still)
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_every_nth_frame() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    1
}

fn default_attempt() -> u32 {
    1
}

fn default_scale() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_jpeg_quality() -> u8 {
    80
}

fn empty_props() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub version: String,
    pub serve_url: String,
    pub composition: String,
    #[serde(default = "empty_props")]
    pub input_props: Value,
    pub codec: Codec,
    #[serde(default)]
    pub audio_codec: Option<AudioCodec>,
    #[serde(default)]
    pub image_format: ImageFormat,
    #[serde(default)]
    pub crf: Option<u32>,
    #[serde(default)]
    pub frames_per_lambda: Option<u32>,
    #[serde(default)]
    pub frame_range: Option<FrameRange>,
    #[serde(default = "default_every_nth_frame")]
    pub every_nth_frame: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub privacy: Privacy,
    #[serde(default)]
    pub out_name: Option<OutName>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_in_milliseconds: u64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub concurrency_per_lambda: Option<u32>,
    #[serde(default)]
    pub webhook: Option<WebhookOption>,
    #[serde(default)]
    pub delete_after: Option<String>,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub renderer_function_name: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub force_width: Option<u32>,
    #[serde(default)]
    pub force_height: Option<u32>,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    #[serde(default)]
    pub muted: bool,
}

/// Internal fan-out request sent by `start` to a second invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchPayload {
    pub version: String,
    pub render_id: String,
    pub bucket_name: String,
    #[serde(default)]
    pub webhook: Option<WebhookOption>,
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Work order for a single chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererPayload {
    pub version: String,
    pub render_id: String,
    pub bucket_name: String,
    pub chunk: u32,
    pub frame_range: FrameRange,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub max_retries: u32,
    pub serve_url: String,
    pub composition: String,
    pub resolved_composition: CompositionInfo,
    #[serde(default = "empty_props")]
    pub input_props: Value,
    pub codec: Codec,
    #[serde(default)]
    pub audio_codec: Option<AudioCodec>,
    #[serde(default)]
    pub image_format: ImageFormat,
    #[serde(default = "default_every_nth_frame")]
    pub every_nth_frame: u32,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub concurrency_per_lambda: Option<u32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_in_milliseconds: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    #[serde(default)]
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub version: String,
    pub render_id: String,
    pub bucket_name: String,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StillPayload {
    pub version: String,
    pub serve_url: String,
    pub composition: String,
    #[serde(default = "empty_props")]
    pub input_props: Value,
    #[serde(default)]
    pub image_format: ImageFormat,
    #[serde(default)]
    pub frame: i64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub privacy: Privacy,
    #[serde(default)]
    pub out_name: Option<OutName>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_in_milliseconds: u64,
    #[serde(default)]
    pub delete_after: Option<String>,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    #[serde(default)]
    pub force_width: Option<u32>,
    #[serde(default)]
    pub force_height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoPayload {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionsPayload {
    pub version: String,
    pub serve_url: String,
    #[serde(default = "empty_props")]
    pub input_props: Value,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
}

/// A decoded invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoutinePayload {
    Start(StartPayload),
    Launch(LaunchPayload),
    Renderer(RendererPayload),
    Status(StatusPayload),
    Still(StillPayload),
    Info(InfoPayload),
    Compositions(CompositionsPayload),
}

impl RoutinePayload {
    pub fn routine(&self) -> Routine {
        match self {
            Self::Start(_) => Routine::Start,
            Self::Launch(_) => Routine::Launch,
            Self::Renderer(_) => Routine::Renderer,
            Self::Status(_) => Routine::Status,
            Self::Still(_) => Routine::Still,
            Self::Info(_) => Routine::Info,
            Self::Compositions(_) => Routine::Compositions,
        }
    }

    pub fn render_id(&self) -> Option<&str> {
        match self {
            Self::Launch(p) => Some(&p.render_id),
            Self::Renderer(p) => Some(&p.render_id),
            Self::Status(p) => Some(&p.render_id),
            _ => None,
        }
    }

    pub fn chunk(&self) -> Option<u32> {
        match self {
            Self::Renderer(p) => Some(p.chunk),
            _ => None,
        }
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Start(p) => p.log_level,
            Self::Launch(p) => p.log_level,
            Self::Renderer(p) => p.log_level,
            Self::Status(p) => p.log_level,
            Self::Still(p) => p.log_level,
            Self::Info(p) => p.log_level,
            Self::Compositions(p) => p.log_level,
        }
    }
}

/// Decode an invocation payload and check its version against the running build.
///
/// The discriminant and version are inspected before the typed decode so a
/// caller on a different release receives a version error rather than a
/// field-level parse failure.
pub fn decode_payload(bytes: &[u8], running_version: &str) -> Result<RoutinePayload, ProtocolError> {
    let value: Value = serde_json::from_slice(bytes)?;

    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingRoutineType)?;
    let routine =
        Routine::parse(type_name).ok_or_else(|| ProtocolError::UnknownRoutine(type_name.to_string()))?;

    if routine.requires_version() {
        let received = value.get("version").and_then(Value::as_str);
        if received != Some(running_version) {
            return Err(ProtocolError::version_mismatch(
                routine,
                running_version,
                received.map(str::to_string),
            ));
        }
    }

    Ok(serde_json::from_value(value)?)
}

pub fn encode_payload(payload: &RoutinePayload) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn status_json(version: &str) -> String {
        format!(
            r#"{{"type":"status","version":"{version}","renderId":"abc","bucketName":"bucket"}}"#
        )
    }

    #[test]
    fn test_decode_status() {
        let payload = decode_payload(status_json("1.0.0").as_bytes(), "1.0.0").unwrap();
        match payload {
            RoutinePayload::Status(p) => {
                assert_eq!(p.render_id, "abc");
                assert_eq!(p.bucket_name, "bucket");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_version_mismatch_names_both_versions() {
        let err = decode_payload(status_json("0.9.0").as_bytes(), "1.0.0").unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
        assert!(message.contains("1.0.0"));
        assert!(message.contains("0.9.0"));
        assert!(message.contains(crate::UPGRADE_URL));
    }

    #[test]
    fn test_missing_version_is_mismatch() {
        let err = decode_payload(
            br#"{"type":"status","renderId":"abc","bucketName":"b"}"#,
            "1.0.0",
        )
        .unwrap_err();
        assert!(err.to_string().contains("did not carry a version"));
    }

    #[test]
    fn test_info_skips_version_check() {
        let payload = decode_payload(br#"{"type":"info"}"#, "1.0.0").unwrap();
        assert_eq!(payload.routine(), Routine::Info);
    }

    #[rstest]
    #[case(br#"{"type":"teleport","version":"1.0.0"}"#.as_slice(), "UnknownRoutine")]
    #[case(br#"{"version":"1.0.0"}"#.as_slice(), "MissingRoutineType")]
    #[case(b"not json".as_slice(), "Malformed")]
    fn test_rejected_payloads(#[case] input: &[u8], #[case] expected: &str) {
        let err = decode_payload(input, "1.0.0").unwrap_err();
        assert!(format!("{err:?}").starts_with(expected), "{err:?}");
        assert!(err.is_caller_defect());
    }

    #[test]
    fn test_start_defaults() {
        let json = r#"{
            "type": "start",
            "version": "1.0.0",
            "serveUrl": "https://example.com/site",
            "composition": "main",
            "codec": "h264"
        }"#;
        let RoutinePayload::Start(p) = decode_payload(json.as_bytes(), "1.0.0").unwrap() else {
            panic!("expected start payload");
        };
        assert_eq!(p.every_nth_frame, 1);
        assert_eq!(p.max_retries, 1);
        assert_eq!(p.privacy, Privacy::Private);
        assert!(p.webhook.is_none());
        assert!(p.input_props.is_object());
    }

    #[test]
    fn test_encode_then_decode_keeps_discriminant() {
        let payload = RoutinePayload::Launch(LaunchPayload {
            version: "1.0.0".to_string(),
            render_id: "r1".to_string(),
            bucket_name: "b".to_string(),
            webhook: None,
            log_level: LogLevel::Info,
        });
        let bytes = encode_payload(&payload).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "launch");
        assert_eq!(decode_payload(&bytes, "1.0.0").unwrap(), payload);
    }
}
