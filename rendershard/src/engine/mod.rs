//! Collaborators that do the actual media work.
//!
//! The orchestrator never looks inside frames. It hands a frame range to a
//! [`FrameRenderer`], concatenates chunk outputs through a [`Stitcher`] and
//! learns composition metadata from a [`CompositionResolver`].

mod synthetic;

pub use synthetic::{ConcatStitcher, StaticCompositions, SyntheticRenderer};

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use shard_protocol::{Codec, CompositionInfo, FrameRange, ImageFormat};
use tokio::sync::mpsc;

use crate::Result;

/// Progress reported by a renderer while it works.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    /// Cumulative counts for the current job.
    FramesRendered { rendered: u32, encoded: u32 },
    /// A named side output. Emitting the same filename twice is allowed.
    Artifact { filename: String, content: Bytes },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkJob {
    pub render_id: String,
    pub chunk: u32,
    pub attempt: u32,
    pub frame_range: FrameRange,
    pub every_nth_frame: u32,
    pub composition: CompositionInfo,
    pub input_props: Value,
    pub codec: Codec,
    pub image_format: ImageFormat,
    pub scale: f64,
    pub timeout_in_milliseconds: u64,
    pub muted: bool,
}

impl ChunkJob {
    /// Frames of this chunk selected by `every_nth_frame`.
    pub fn frames(&self) -> impl Iterator<Item = u32> + use<> {
        let n = self.every_nth_frame.max(1);
        (self.frame_range.start()..=self.frame_range.end()).filter(move |f| f % n == 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedChunk {
    pub media: Bytes,
    pub frames: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StillJob {
    pub render_id: String,
    pub frame: u32,
    pub attempt: u32,
    pub composition: CompositionInfo,
    pub input_props: Value,
    pub image_format: ImageFormat,
    pub scale: f64,
    pub jpeg_quality: u8,
    pub timeout_in_milliseconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStill {
    pub image: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombineJob {
    pub render_id: String,
    pub codec: Codec,
    pub fps: f64,
    pub total_frames: u32,
    /// Rendered frames of each chunk, in chunk order.
    pub frames_per_chunk: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombinedOutput {
    pub body: Bytes,
}

#[async_trait]
pub trait FrameRenderer: Send + Sync {
    async fn render_frames(
        &self,
        job: &ChunkJob,
        scratch_dir: &Path,
        events: mpsc::Sender<RenderEvent>,
    ) -> Result<RenderedChunk>;

    async fn render_still(
        &self,
        job: &StillJob,
        scratch_dir: &Path,
        events: mpsc::Sender<RenderEvent>,
    ) -> Result<RenderedStill>;
}

#[async_trait]
pub trait Stitcher: Send + Sync {
    /// Combine chunk outputs in order. Reports the cumulative number of
    /// combined frames on `progress`.
    async fn combine(
        &self,
        job: &CombineJob,
        chunks: Vec<Bytes>,
        scratch_dir: &Path,
        progress: mpsc::Sender<u32>,
    ) -> Result<CombinedOutput>;
}

#[async_trait]
pub trait CompositionResolver: Send + Sync {
    async fn resolve(
        &self,
        serve_url: &str,
        composition_id: &str,
        input_props: &Value,
    ) -> Result<CompositionInfo>;

    async fn list(&self, serve_url: &str, input_props: &Value) -> Result<Vec<CompositionInfo>>;
}
