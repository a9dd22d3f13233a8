use std::path::Path;
use std::sync::Arc;

use shard_protocol::{
    ChunkRecord, ChunkStatus, ChunkTimings, ErrorSource, RendererPayload, StreamingPayload,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::EventRelay;
use crate::Result;
use crate::classify::{enhance, error_record};
use crate::context::ExecutionContext;
use crate::engine::{ChunkJob, RenderEvent};
use crate::services::ServiceContainer;
use crate::stream::ResponseStream;

fn chunk_job(payload: &RendererPayload) -> ChunkJob {
    ChunkJob {
        render_id: payload.render_id.clone(),
        chunk: payload.chunk,
        attempt: payload.attempt,
        frame_range: payload.frame_range,
        every_nth_frame: payload.every_nth_frame,
        composition: payload.resolved_composition.clone(),
        input_props: payload.input_props.clone(),
        codec: payload.codec,
        image_format: payload.image_format,
        scale: payload.scale,
        timeout_in_milliseconds: payload.timeout_in_milliseconds,
        muted: payload.muted,
    }
}

/// Render the frames of one chunk and stream the result back.
///
/// Failures of the render itself are recorded and reported on the stream, so
/// this only returns an error when nothing could be reported.
pub async fn render_chunk(
    services: &Arc<ServiceContainer>,
    ctx: &ExecutionContext,
    payload: RendererPayload,
    scratch_dir: &Path,
    response: &ResponseStream,
) -> Result<()> {
    let store = services.progress_store(&payload.bucket_name, &payload.render_id);
    let job = chunk_job(&payload);
    let started = ctx.now_ms();

    // Frame counts of a chunk never go down across attempts.
    let (floor_rendered, floor_encoded) = match store.read_chunk(payload.chunk).await? {
        Some(previous) => (previous.frames_rendered, previous.frames_encoded),
        None => (0, 0),
    };

    let mut record = ChunkRecord {
        chunk: payload.chunk,
        frame_range: payload.frame_range,
        frames_rendered: floor_rendered,
        frames_encoded: floor_encoded,
        attempt: payload.attempt,
        status: ChunkStatus::Rendering,
        timings: ChunkTimings {
            start: started,
            rendered: None,
            encoded: None,
            last_update: started,
        },
        output_key: None,
        output_size: None,
        artifacts: Vec::new(),
    };
    store.write_chunk(&record).await?;
    debug!(chunk = payload.chunk, frames = %payload.frame_range, "Rendering chunk");

    let (tx, mut rx) = mpsc::channel(32);
    let write_interval = services.config.progress_write_interval();
    let mut relay = EventRelay::new(&store, response);
    let mut progress = record.clone();

    let consume = async {
        let mut last_write = Instant::now();
        while let Some(event) = rx.recv().await {
            match event {
                RenderEvent::FramesRendered { rendered, encoded } => {
                    relay.frames(rendered, encoded).await;
                    progress.frames_rendered = rendered.max(floor_rendered);
                    progress.frames_encoded = encoded.max(floor_encoded);
                    if last_write.elapsed() >= write_interval {
                        progress.timings.last_update = ctx.now_ms();
                        if let Err(e) = store.write_chunk(&progress).await {
                            warn!(chunk = progress.chunk, error = %e, "Failed to write chunk progress");
                        }
                        last_write = Instant::now();
                    }
                }
                RenderEvent::Artifact { filename, content } => {
                    relay.artifact(filename, content).await;
                }
            }
        }
    };
    let (rendered, ()) = tokio::join!(
        services.renderer.render_frames(&job, scratch_dir, tx),
        consume
    );

    let now = ctx.now_ms();
    record.artifacts = relay.into_artifacts();
    record.frames_rendered = progress.frames_rendered;
    record.frames_encoded = progress.frames_encoded;
    record.timings.last_update = now;

    match rendered {
        Ok(output) => {
            let output_size = output.media.len() as u64;
            let output_key = store.write_chunk_media(payload.chunk, output.media).await?;
            record.status = ChunkStatus::Done;
            record.frames_rendered = output.frames.max(floor_rendered);
            record.frames_encoded = output.frames.max(floor_encoded);
            record.timings.rendered = Some(now);
            record.timings.encoded = Some(now);
            record.output_key = Some(output_key);
            record.output_size = Some(output_size);
            store.write_chunk(&record).await?;

            info!(
                chunk = payload.chunk,
                attempt = payload.attempt,
                frames = output.frames,
                size = output_size,
                elapsed_ms = now - started,
                "Chunk rendered"
            );
            response
                .send(StreamingPayload::ChunkRendered(record))
                .await
        }
        Err(e) => {
            let failure = error_record(
                &e,
                ErrorSource::Renderer,
                Some(payload.chunk),
                None,
                payload.attempt,
                payload.max_retries.saturating_add(1),
                now,
            );
            let info = enhance(&failure);
            warn!(
                chunk = payload.chunk,
                attempt = payload.attempt,
                will_retry = info.will_retry,
                error = %e,
                "Chunk render failed"
            );
            store.write_error(&failure).await?;
            record.status = ChunkStatus::Failed;
            store.write_chunk(&record).await?;

            response
                .send(StreamingPayload::ErrorOccurred {
                    error: failure.message.clone(),
                    should_retry: info.will_retry,
                    error_info: info,
                })
                .await
        }
    }
}
