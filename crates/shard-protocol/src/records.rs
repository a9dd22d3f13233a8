//! Durable records exchanged through the object store.
//!
//! Workers never talk to each other; these records are the only shared state.
//! The job record is written once by `start`, every chunk index has exactly one
//! writer, and the post-render record marks a render as finished.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::response::{CostsInfo, EnhancedErrorInfo, ReceivedArtifact};
use crate::types::{
    AudioCodec, Codec, DeleteAfter, Dimensions, FrameRange, ImageFormat, OutName, Privacy,
};

fn default_frame_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Video,
    Still,
}

/// Immutable metadata describing one render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub render_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub total_chunks: u32,
    pub frames_per_lambda: u32,
    pub frame_range: FrameRange,
    pub every_nth_frame: u32,
    pub codec: Option<Codec>,
    #[serde(default)]
    pub audio_codec: Option<AudioCodec>,
    pub image_format: ImageFormat,
    pub dimensions: Dimensions,
    pub fps: f64,
    pub region: String,
    pub memory_size_in_mb: u32,
    pub timeout_in_milliseconds: u64,
    /// Epoch milliseconds at which `start` persisted this record.
    pub started_date: i64,
    pub estimated_total_lambda_invocations: u32,
    pub estimated_render_lambda_invocations: u32,
    pub composition_id: String,
    pub serve_url: String,
    #[serde(default)]
    pub input_props: Value,
    pub max_retries: u32,
    pub privacy: Privacy,
    #[serde(default)]
    pub out_name: Option<OutName>,
    #[serde(default)]
    pub delete_after: Option<DeleteAfter>,
    pub bucket_name: String,
    pub function_name: String,
    pub renderer_function_name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    pub scale: f64,
    #[serde(default)]
    pub concurrency_per_lambda: Option<u32>,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub crf: Option<u32>,
    /// Per-frame render timeout handed to chunk workers.
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_in_milliseconds: u64,
    /// Duration of the whole composition, not just the rendered range.
    #[serde(default)]
    pub duration_in_frames: u32,
    /// Epoch millisecond at which the composition was resolved against the bundle.
    #[serde(default)]
    pub composition_validated: Option<i64>,
    #[serde(default)]
    pub serve_url_opened: Option<i64>,
}

impl JobRecord {
    /// Number of frames the render produces after `everyNthFrame` is applied.
    pub fn total_frame_count(&self) -> u32 {
        let n = self.every_nth_frame.max(1);
        let FrameRange(start, end) = self.frame_range;
        if end < start {
            return 0;
        }
        // frames f in [start, end] with f % n == 0
        let below_end = end / n + 1;
        let below_start = if start == 0 { 0 } else { (start - 1) / n + 1 };
        below_end - below_start
    }

    /// Epoch millisecond at which the timeout detector starts flagging stalled chunks.
    pub fn timeout_timestamp(&self) -> i64 {
        let timeout = i64::try_from(self.timeout_in_milliseconds).unwrap_or(i64::MAX);
        self.started_date.saturating_add(timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Rendering,
    Done,
    Failed,
}

/// Epoch millisecond marks recorded by a chunk worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTimings {
    pub start: i64,
    #[serde(default)]
    pub rendered: Option<i64>,
    #[serde(default)]
    pub encoded: Option<i64>,
    pub last_update: i64,
}

impl ChunkTimings {
    /// Milliseconds the chunk spent rendering, if it finished.
    pub fn duration(&self) -> Option<i64> {
        self.rendered
            .or(self.encoded)
            .map(|end| (end - self.start).max(0))
    }
}

/// Progress and outcome of one chunk. Overwritten in place by its single writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub chunk: u32,
    pub frame_range: FrameRange,
    pub frames_rendered: u32,
    pub frames_encoded: u32,
    pub attempt: u32,
    pub status: ChunkStatus,
    pub timings: ChunkTimings,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub output_size: Option<u64>,
    #[serde(default)]
    pub artifacts: Vec<ReceivedArtifact>,
}

impl ChunkRecord {
    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Renderer,
    Stitcher,
    Launch,
    Still,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Renderer => "renderer",
            Self::Stitcher => "stitcher",
            Self::Launch => "launch",
            Self::Still => "still",
        }
    }
}

/// A raw failure as recorded by the worker that observed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    #[serde(default)]
    pub chunk: Option<u32>,
    #[serde(default)]
    pub frame: Option<u32>,
    pub attempt: u32,
    pub total_attempts: u32,
    pub will_retry: bool,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
    pub source: ErrorSource,
    pub timestamp: i64,
}

/// Written by `launch` as soon as it starts fanning out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRecord {
    pub function_launched: i64,
}

/// Progress of the stitching phase, written by `launch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombineProgress {
    pub combined_frames: u32,
    pub last_update: i64,
    #[serde(default)]
    pub time_to_combine: Option<i64>,
}

/// A chunk that was invoked again after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub chunk: u32,
    pub attempt: u32,
    pub time: i64,
}

/// Terminal record. Its presence is what makes a render `done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRenderData {
    pub output_file: String,
    pub out_key: String,
    pub out_bucket: String,
    pub render_size: u64,
    pub output_size: u64,
    pub cost: CostsInfo,
    pub time_to_finish: i64,
    pub time_to_render_chunks: i64,
    /// Until the last chunk finished rendering frames, before encoding.
    #[serde(default)]
    pub time_to_render_frames: Option<i64>,
    pub time_to_combine: Option<i64>,
    pub errors: Vec<EnhancedErrorInfo>,
    pub retries_info: Vec<RetryRecord>,
    pub estimated_billing_duration_in_milliseconds: i64,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub artifacts: Vec<ReceivedArtifact>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(frame_range: FrameRange, every_nth_frame: u32) -> JobRecord {
        JobRecord {
            render_id: "abc".to_string(),
            job_type: JobType::Video,
            total_chunks: 1,
            frames_per_lambda: 20,
            frame_range,
            every_nth_frame,
            codec: Some(Codec::Gif),
            audio_codec: None,
            image_format: ImageFormat::Png,
            dimensions: Dimensions {
                width: 100,
                height: 100,
            },
            fps: 30.0,
            region: "local-1".to_string(),
            memory_size_in_mb: 2048,
            timeout_in_milliseconds: 60_000,
            started_date: 0,
            estimated_total_lambda_invocations: 2,
            estimated_render_lambda_invocations: 1,
            composition_id: "main".to_string(),
            serve_url: "https://example.com".to_string(),
            input_props: Value::Null,
            max_retries: 1,
            privacy: Privacy::Private,
            out_name: None,
            delete_after: None,
            bucket_name: "bucket".to_string(),
            function_name: "fn".to_string(),
            renderer_function_name: "fn".to_string(),
            version: "1.0.0".to_string(),
            metadata: None,
            scale: 1.0,
            concurrency_per_lambda: None,
            env_variables: HashMap::new(),
            muted: false,
            crf: None,
            frame_timeout_in_milliseconds: 30_000,
            duration_in_frames: 100,
            composition_validated: None,
            serve_url_opened: None,
        }
    }

    #[test]
    fn test_total_frame_count() {
        assert_eq!(job(FrameRange(0, 99), 1).total_frame_count(), 100);
        // 0, 3, 6, 9
        assert_eq!(job(FrameRange(0, 9), 3).total_frame_count(), 4);
        // 3, 6, 9
        assert_eq!(job(FrameRange(1, 10), 3).total_frame_count(), 3);
        assert_eq!(job(FrameRange(5, 5), 2).total_frame_count(), 0);
    }

    #[test]
    fn test_job_type_field_name() {
        let value = serde_json::to_value(job(FrameRange(0, 9), 1)).unwrap();
        assert_eq!(value["type"], "video");
        assert_eq!(value["frameRange"], serde_json::json!([0, 9]));
    }

    #[test]
    fn test_chunk_timings_duration() {
        let timings = ChunkTimings {
            start: 1_000,
            rendered: Some(4_500),
            encoded: None,
            last_update: 4_500,
        };
        assert_eq!(timings.duration(), Some(3_500));
        assert_eq!(ChunkTimings::default().duration(), None);
    }
}
