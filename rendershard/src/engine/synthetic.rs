//! Deterministic stand-ins for the media collaborators.
//!
//! They produce placeholder bytes only, which is enough to drive the
//! orchestration end to end locally and in tests.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use shard_protocol::{Codec, CompositionInfo};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChunkJob, CombineJob, CombinedOutput, CompositionResolver, FrameRenderer, RenderEvent,
    RenderedChunk, RenderedStill, StillJob, Stitcher,
};
use crate::validate::validate_serve_url;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct InjectedFailure {
    failing_attempts: u32,
    message: String,
}

/// Renders one text line per frame.
#[derive(Debug, Default)]
pub struct SyntheticRenderer {
    frame_delay: Duration,
    failures: parking_lot::Mutex<HashMap<u32, InjectedFailure>>,
    artifact: Option<(String, Bytes)>,
}

impl SyntheticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Emit this artifact from every chunk and still.
    pub fn with_artifact(mut self, filename: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.artifact = Some((filename.into(), content.into()));
        self
    }

    /// Make the first `failing_attempts` attempts of `chunk` fail with `message`.
    /// Stills count as chunk 0.
    pub fn fail_chunk(&self, chunk: u32, failing_attempts: u32, message: impl Into<String>) {
        self.failures.lock().insert(
            chunk,
            InjectedFailure {
                failing_attempts,
                message: message.into(),
            },
        );
    }

    fn injected_failure(&self, chunk: u32, attempt: u32) -> Option<Error> {
        self.failures
            .lock()
            .get(&chunk)
            .filter(|f| attempt <= f.failing_attempts)
            .map(|f| Error::render(f.message.clone()))
    }

    async fn emit_artifact(&self, events: &mpsc::Sender<RenderEvent>) {
        let Some((filename, content)) = &self.artifact else {
            return;
        };
        // Emitted twice; receivers deduplicate by filename.
        for _ in 0..2 {
            let event = RenderEvent::Artifact {
                filename: filename.clone(),
                content: content.clone(),
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl FrameRenderer for SyntheticRenderer {
    async fn render_frames(
        &self,
        job: &ChunkJob,
        scratch_dir: &Path,
        events: mpsc::Sender<RenderEvent>,
    ) -> Result<RenderedChunk> {
        if let Some(err) = self.injected_failure(job.chunk, job.attempt) {
            return Err(err);
        }

        let mut media = BytesMut::new();
        let mut frames = 0u32;
        for frame in job.frames() {
            media.put_slice(
                format!(
                    "{} {} frame={} {}x{}\n",
                    job.render_id,
                    job.codec,
                    frame,
                    job.composition.width,
                    job.composition.height
                )
                .as_bytes(),
            );
            frames += 1;
            if !self.frame_delay.is_zero() {
                tokio::time::sleep(self.frame_delay).await;
            }
            // Progress is best effort; a closed channel does not stop rendering.
            let _ = events
                .send(RenderEvent::FramesRendered {
                    rendered: frames,
                    encoded: frames,
                })
                .await;
        }
        self.emit_artifact(&events).await;

        let media = media.freeze();
        let path = scratch_dir.join(format!("chunk-{}.{}", job.chunk, job.codec.file_extension()));
        tokio::fs::write(&path, &media).await?;
        debug!(chunk = job.chunk, frames, path = %path.display(), "Synthetic chunk rendered");

        Ok(RenderedChunk { media, frames })
    }

    async fn render_still(
        &self,
        job: &StillJob,
        scratch_dir: &Path,
        events: mpsc::Sender<RenderEvent>,
    ) -> Result<RenderedStill> {
        if let Some(err) = self.injected_failure(0, job.attempt) {
            return Err(err);
        }
        let image = Bytes::from(format!(
            "{} still frame={} format={} quality={}\n",
            job.render_id,
            job.frame,
            job.image_format.file_extension(),
            job.jpeg_quality
        ));
        let _ = events
            .send(RenderEvent::FramesRendered {
                rendered: 1,
                encoded: 1,
            })
            .await;
        self.emit_artifact(&events).await;

        tokio::fs::write(scratch_dir.join("still.bin"), &image).await?;
        Ok(RenderedStill { image })
    }
}

/// Concatenates chunk outputs in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatStitcher;

#[async_trait]
impl Stitcher for ConcatStitcher {
    async fn combine(
        &self,
        job: &CombineJob,
        chunks: Vec<Bytes>,
        scratch_dir: &Path,
        progress: mpsc::Sender<u32>,
    ) -> Result<CombinedOutput> {
        if chunks.len() != job.frames_per_chunk.len() {
            return Err(Error::render(format!(
                "Expected {} chunk outputs to combine, got {}",
                job.frames_per_chunk.len(),
                chunks.len()
            )));
        }

        let mut body = BytesMut::new();
        let mut combined = 0u32;
        for (chunk, frames) in chunks.iter().zip(&job.frames_per_chunk) {
            body.put_slice(chunk);
            combined = combined.saturating_add(*frames).min(job.total_frames);
            let _ = progress.send(combined).await;
        }

        let body = body.freeze();
        tokio::fs::write(scratch_dir.join(format!("out.{}", job.codec.file_extension())), &body)
            .await?;
        Ok(CombinedOutput { body })
    }
}

/// Serves a fixed list of compositions for any valid serve URL.
#[derive(Debug, Clone)]
pub struct StaticCompositions {
    compositions: Vec<CompositionInfo>,
}

impl StaticCompositions {
    pub fn new(compositions: Vec<CompositionInfo>) -> Self {
        Self { compositions }
    }
}

impl Default for StaticCompositions {
    fn default() -> Self {
        Self::new(vec![
            CompositionInfo {
                id: "main".to_string(),
                width: 1920,
                height: 1080,
                fps: 30.0,
                duration_in_frames: 300,
                default_codec: Some(Codec::H264),
                props: Value::Object(Default::default()),
            },
            CompositionInfo {
                id: "teaser".to_string(),
                width: 1080,
                height: 1080,
                fps: 30.0,
                duration_in_frames: 90,
                default_codec: Some(Codec::Gif),
                props: Value::Object(Default::default()),
            },
        ])
    }
}

fn merge_props(defaults: &Value, input: &Value) -> Value {
    match (defaults, input) {
        (Value::Object(defaults), Value::Object(input)) => {
            let mut merged = defaults.clone();
            merged.extend(input.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        (defaults, Value::Null) => defaults.clone(),
        (_, input) => input.clone(),
    }
}

#[async_trait]
impl CompositionResolver for StaticCompositions {
    async fn resolve(
        &self,
        serve_url: &str,
        composition_id: &str,
        input_props: &Value,
    ) -> Result<CompositionInfo> {
        validate_serve_url(serve_url)?;
        let Some(found) = self.compositions.iter().find(|c| c.id == composition_id) else {
            let available: Vec<&str> = self.compositions.iter().map(|c| c.id.as_str()).collect();
            return Err(Error::validation(format!(
                "No composition with the ID \"{composition_id}\" found. Available compositions: {}",
                available.join(", ")
            )));
        };
        let mut composition = found.clone();
        composition.props = merge_props(&found.props, input_props);
        Ok(composition)
    }

    async fn list(&self, serve_url: &str, input_props: &Value) -> Result<Vec<CompositionInfo>> {
        validate_serve_url(serve_url)?;
        Ok(self
            .compositions
            .iter()
            .map(|c| CompositionInfo {
                props: merge_props(&c.props, input_props),
                ..c.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_protocol::{FrameRange, ImageFormat};

    fn chunk_job(chunk: u32, attempt: u32, every_nth_frame: u32) -> ChunkJob {
        ChunkJob {
            render_id: "abc".to_string(),
            chunk,
            attempt,
            frame_range: FrameRange(0, 9),
            every_nth_frame,
            composition: StaticCompositions::default().compositions[0].clone(),
            input_props: Value::Null,
            codec: Codec::Gif,
            image_format: ImageFormat::Png,
            scale: 1.0,
            timeout_in_milliseconds: 30_000,
            muted: false,
        }
    }

    #[tokio::test]
    async fn test_renders_selected_frames_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = SyntheticRenderer::new().with_artifact("notes.txt", "hello");
        let (tx, mut rx) = mpsc::channel(64);

        let chunk = renderer
            .render_frames(&chunk_job(0, 1, 3), dir.path(), tx)
            .await
            .unwrap();
        assert_eq!(chunk.frames, 4);
        assert_eq!(chunk.media.iter().filter(|b| **b == b'\n').count(), 4);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events[3],
            RenderEvent::FramesRendered {
                rendered: 4,
                encoded: 4
            }
        );
        let artifacts = events
            .iter()
            .filter(|e| matches!(e, RenderEvent::Artifact { .. }))
            .count();
        assert_eq!(artifacts, 2);
        assert!(dir.path().join("chunk-0.gif").exists());
    }

    #[tokio::test]
    async fn test_injected_failures_stop_after_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = SyntheticRenderer::new();
        renderer.fail_chunk(2, 1, "Target closed");
        let (tx, _rx) = mpsc::channel(64);

        let err = renderer
            .render_frames(&chunk_job(2, 1, 1), dir.path(), tx.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Target closed"));
        assert!(
            renderer
                .render_frames(&chunk_job(2, 2, 1), dir.path(), tx)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_concat_reports_cumulative_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let job = CombineJob {
            render_id: "abc".to_string(),
            codec: Codec::H264,
            fps: 30.0,
            total_frames: 30,
            frames_per_chunk: vec![20, 10],
        };
        let out = ConcatStitcher
            .combine(
                &job,
                vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
                dir.path(),
                tx,
            )
            .await
            .unwrap();
        assert_eq!(out.body, Bytes::from_static(b"ab"));
        assert_eq!(rx.recv().await, Some(20));
        assert_eq!(rx.recv().await, Some(30));

        let (tx, _rx) = mpsc::channel(8);
        assert!(
            ConcatStitcher
                .combine(&job, vec![Bytes::new()], dir.path(), tx)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_resolve_composition() {
        let resolver = StaticCompositions::default();
        let props = serde_json::json!({"title": "Hello"});
        let comp = resolver
            .resolve("https://example.com/site", "main", &props)
            .await
            .unwrap();
        assert_eq!(comp.duration_in_frames, 300);
        assert_eq!(comp.props["title"], "Hello");

        let err = resolver
            .resolve("https://example.com/site", "missing", &props)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("main, teaser"));
        assert!(resolver.list("not a url", &Value::Null).await.is_err());
    }
}
