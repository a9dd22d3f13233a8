//! rendershard library crate.
//!
//! Splits a render into frame-range chunks, fans them out to short-lived
//! function invocations and tracks their progress through a shared object
//! store.

pub mod artifacts;
pub mod classify;
pub mod client;
pub mod config;
pub mod context;
pub mod cost;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod logging;
pub mod naming;
pub mod plan;
pub mod pool;
pub mod progress;
pub mod routines;
pub mod services;
pub mod store;
pub mod stream;
pub mod timeout;
pub mod transport;
pub mod validate;
pub mod webhook;

pub use error::{Error, ErrorKind, Result};

#[cfg(test)]
pub(crate) mod testing {
    use serde_json::Value;
    use shard_protocol::{
        ChunkRecord, ChunkStatus, ChunkTimings, Codec, Dimensions, FrameRange, ImageFormat,
        JobRecord, JobType, Privacy, VERSION,
    };

    /// Video job started at 0 with a 60s function timeout.
    pub fn job_record(render_id: &str, total_chunks: u32, frame_range: FrameRange) -> JobRecord {
        JobRecord {
            render_id: render_id.to_string(),
            job_type: JobType::Video,
            total_chunks,
            frames_per_lambda: frame_range.len().div_ceil(total_chunks.max(1)),
            frame_range,
            every_nth_frame: 1,
            codec: Some(Codec::H264),
            audio_codec: None,
            image_format: ImageFormat::Jpeg,
            dimensions: Dimensions {
                width: 1920,
                height: 1080,
            },
            fps: 30.0,
            region: "us-east-1".to_string(),
            memory_size_in_mb: 2048,
            timeout_in_milliseconds: 60_000,
            started_date: 0,
            estimated_total_lambda_invocations: total_chunks + 1,
            estimated_render_lambda_invocations: total_chunks,
            composition_id: "main".to_string(),
            serve_url: "https://example.com/site".to_string(),
            input_props: Value::Null,
            max_retries: 1,
            privacy: Privacy::Private,
            out_name: None,
            delete_after: None,
            bucket_name: "bucket".to_string(),
            function_name: "rendershard-main".to_string(),
            renderer_function_name: "rendershard-main".to_string(),
            version: VERSION.to_string(),
            metadata: None,
            scale: 1.0,
            concurrency_per_lambda: None,
            env_variables: Default::default(),
            muted: false,
            crf: None,
            frame_timeout_in_milliseconds: 30_000,
            duration_in_frames: frame_range.end() + 1,
            composition_validated: None,
            serve_url_opened: None,
        }
    }

    /// Chunk that started at 0 and, unless still rendering, finished at 1000.
    pub fn chunk_record(chunk: u32, frame_range: FrameRange, status: ChunkStatus) -> ChunkRecord {
        let finished = status != ChunkStatus::Rendering;
        ChunkRecord {
            chunk,
            frame_range,
            frames_rendered: frame_range.len(),
            frames_encoded: frame_range.len(),
            attempt: 1,
            status,
            timings: ChunkTimings {
                start: 0,
                rendered: finished.then_some(1_000),
                encoded: finished.then_some(1_000),
                last_update: 1_000,
            },
            output_key: None,
            output_size: (status == ChunkStatus::Done).then_some(u64::from(frame_range.len())),
            artifacts: Vec::new(),
        }
    }
}
