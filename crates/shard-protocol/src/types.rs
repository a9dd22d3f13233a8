//! Value types shared between payloads, records and responses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Video or audio container codec requested for a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
    Prores,
    Gif,
    Mp3,
    Aac,
    Wav,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Prores => "prores",
            Self::Gif => "gif",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Wav => "wav",
        }
    }

    /// File extension of the stitched output.
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::H264 | Self::H265 => "mp4",
            Self::Vp8 | Self::Vp9 => "webm",
            Self::Prores => "mov",
            Self::Gif => "gif",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Wav => "wav",
        }
    }

    pub fn is_audio_only(&self) -> bool {
        matches!(self, Self::Mp3 | Self::Aac | Self::Wav)
    }

    /// Whether frames can be skipped with `everyNthFrame > 1`.
    pub fn supports_frame_skipping(&self) -> bool {
        matches!(self, Self::Gif)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
    #[serde(rename = "pcm-16")]
    Pcm16,
}

/// Image format used for intermediate frames or for still output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    #[default]
    Jpeg,
    Webp,
    Pdf,
    None,
}

impl ImageFormat {
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
            Self::Pdf => "pdf",
            Self::None => "bin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Privacy {
    Public,
    #[default]
    Private,
    NoAcl,
}

/// Lifecycle bucket a render's storage is deleted after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteAfter {
    #[serde(rename = "1-day")]
    OneDay,
    #[serde(rename = "3-days")]
    ThreeDays,
    #[serde(rename = "7-days")]
    SevenDays,
    #[serde(rename = "30-days")]
    ThirtyDays,
}

impl DeleteAfter {
    pub const ALL: [DeleteAfter; 4] = [
        Self::OneDay,
        Self::ThreeDays,
        Self::SevenDays,
        Self::ThirtyDays,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneDay => "1-day",
            Self::ThreeDays => "3-days",
            Self::SevenDays => "7-days",
            Self::ThirtyDays => "30-days",
        }
    }
}

impl fmt::Display for DeleteAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeleteAfter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "deleteAfter must be one of {}, got `{s}`",
                    Self::ALL.map(|d| d.as_str()).join(", ")
                )
            })
    }
}

/// Inclusive frame range `[start, end]`, serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange(pub u32, pub u32);

impl FrameRange {
    pub fn start(&self) -> u32 {
        self.0
    }

    pub fn end(&self) -> u32 {
        self.1
    }

    pub fn len(&self) -> u32 {
        self.1.saturating_sub(self.0) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.1 < self.0
    }

    pub fn contains(&self, frame: u32) -> bool {
        frame >= self.0 && frame <= self.1
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Verbose,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn is_verbose(&self) -> bool {
        *self <= Self::Verbose
    }
}

/// Webhook the launch routine calls once a render reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOption {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub custom_data: Option<serde_json::Value>,
}

/// Where the final output should be written.
///
/// A plain name is placed under the render's own prefix; a custom target
/// names both bucket and key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutName {
    Plain(String),
    #[serde(rename_all = "camelCase")]
    Custom { bucket_name: String, key: String },
}

impl OutName {
    pub fn key(&self) -> &str {
        match self {
            Self::Plain(name) => name,
            Self::Custom { key, .. } => key,
        }
    }
}

/// Metadata describing one composition of a project, as produced by the
/// composition-resolution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionInfo {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_in_frames: u32,
    #[serde(default)]
    pub default_codec: Option<Codec>,
    #[serde(default)]
    pub props: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_range_serializes_as_array() {
        let json = serde_json::to_string(&FrameRange(3, 9)).unwrap();
        assert_eq!(json, "[3,9]");
        assert_eq!(FrameRange(3, 9).len(), 7);
    }

    #[test]
    fn test_delete_after_parse() {
        assert_eq!("7-days".parse::<DeleteAfter>(), Ok(DeleteAfter::SevenDays));
        let err = "2-days".parse::<DeleteAfter>().unwrap_err();
        assert!(err.contains("1-day"));
    }

    #[test]
    fn test_out_name_untagged() {
        let plain: OutName = serde_json::from_str("\"video.mp4\"").unwrap();
        assert_eq!(plain, OutName::Plain("video.mp4".to_string()));

        let custom: OutName =
            serde_json::from_str(r#"{"bucketName":"b","key":"k/out.mp4"}"#).unwrap();
        assert_eq!(custom.key(), "k/out.mp4");
    }

    #[test]
    fn test_codec_extensions() {
        assert_eq!(Codec::H264.file_extension(), "mp4");
        assert_eq!(Codec::Vp9.file_extension(), "webm");
        assert!(Codec::Gif.supports_frame_skipping());
        assert!(Codec::Wav.is_audio_only());
    }
}
