use std::path::Path;
use std::sync::Arc;

use shard_protocol::{
    Dimensions, ErrorSource, FrameRange, ImageFormat, JobRecord, JobType, StillPayload,
    StillRenderedPayload, StreamingPayload,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::EventRelay;
use crate::classify::{enhance, error_record};
use crate::context::ExecutionContext;
use crate::cost::{CostInput, estimate_price, format_costs_info};
use crate::engine::{RenderEvent, StillJob};
use crate::naming::{expected_output, parse_delete_after, random_render_id, validate_out_name};
use crate::services::ServiceContainer;
use crate::store::ProgressStore;
use crate::stream::ResponseStream;
use crate::validate::{validate_dimension, validate_scale, validate_serve_url, validate_timeout};
use crate::{Error, Result};

fn validate(payload: &StillPayload) -> Result<()> {
    validate_serve_url(&payload.serve_url)?;
    validate_out_name(payload.out_name.as_ref(), None)?;
    validate_scale(payload.scale)?;
    validate_dimension("forceWidth", payload.force_width)?;
    validate_dimension("forceHeight", payload.force_height)?;
    validate_timeout(payload.timeout_in_milliseconds)?;
    if payload.image_format == ImageFormat::None {
        return Err(Error::validation(
            "imageFormat \"none\" cannot be used for stills",
        ));
    }
    if payload.jpeg_quality > 100 {
        return Err(Error::validation(format!(
            "jpegQuality must be between 0 and 100, got {}",
            payload.jpeg_quality
        )));
    }
    Ok(())
}

/// Negative frames count back from the last frame.
fn resolve_frame(frame: i64, duration_in_frames: u32) -> Result<u32> {
    let duration = i64::from(duration_in_frames);
    let resolved = if frame < 0 { duration + frame } else { frame };
    if resolved < 0 || resolved >= duration {
        return Err(Error::validation(format!(
            "Cannot render frame {frame}: the composition has {duration_in_frames} frames"
        )));
    }
    u32::try_from(resolved).map_err(|_| Error::validation(format!("Invalid frame {frame}")))
}

/// Render a single frame and stream the result.
///
/// The render id is streamed before anything else so the caller can start
/// polling. Failures are recorded and streamed as a terminal error.
pub async fn render_still(
    services: &Arc<ServiceContainer>,
    ctx: &ExecutionContext,
    payload: StillPayload,
    scratch_dir: &Path,
    response: &ResponseStream,
) -> Result<()> {
    validate(&payload)?;
    let delete_after = parse_delete_after(payload.delete_after.as_deref())?;
    let render_id = random_render_id(delete_after);
    let bucket_name = ctx.bucket_or_default(payload.bucket_name.as_deref());
    let store = services.progress_store(&bucket_name, &render_id);

    response
        .send(StreamingPayload::RenderIdDetermined {
            render_id: render_id.clone(),
        })
        .await?;

    let total_attempts = payload.max_retries.saturating_add(1);
    let mut attempt = payload.attempt.max(1);
    loop {
        match run(services, ctx, &store, &payload, attempt, scratch_dir, response).await {
            Ok(rendered) => {
                return response
                    .send(StreamingPayload::StillRendered(rendered))
                    .await;
            }
            Err(e) => {
                let record = error_record(
                    &e,
                    ErrorSource::Still,
                    Some(0),
                    None,
                    attempt,
                    total_attempts,
                    ctx.now_ms(),
                );
                if let Err(write_err) = store.write_error(&record).await {
                    warn!(render_id = %render_id, error = %write_err, "Failed to record still error");
                }
                let error_info = enhance(&record);
                if error_info.will_retry {
                    warn!(render_id = %render_id, attempt, error = %e, "Still render failed, retrying");
                    attempt += 1;
                    continue;
                }
                warn!(render_id = %render_id, attempt, error = %e, "Still render failed");
                return response
                    .send(StreamingPayload::ErrorOccurred {
                        error: record.message,
                        should_retry: false,
                        error_info,
                    })
                    .await;
            }
        }
    }
}

async fn run(
    services: &Arc<ServiceContainer>,
    ctx: &ExecutionContext,
    store: &ProgressStore,
    payload: &StillPayload,
    attempt: u32,
    scratch_dir: &Path,
    response: &ResponseStream,
) -> Result<StillRenderedPayload> {
    let started = ctx.now_ms();
    let composition = services
        .compositions
        .resolve(&payload.serve_url, &payload.composition, &payload.input_props)
        .await?;
    let composition_validated = ctx.now_ms();
    let frame = resolve_frame(payload.frame, composition.duration_in_frames)?;

    let job = JobRecord {
        render_id: store.render_id().to_string(),
        job_type: JobType::Still,
        total_chunks: 1,
        frames_per_lambda: 1,
        frame_range: FrameRange(frame, frame),
        every_nth_frame: 1,
        codec: None,
        audio_codec: None,
        image_format: payload.image_format,
        dimensions: Dimensions {
            width: payload.force_width.unwrap_or(composition.width),
            height: payload.force_height.unwrap_or(composition.height),
        },
        fps: composition.fps,
        region: ctx.region.clone(),
        memory_size_in_mb: ctx.memory_size_in_mb,
        timeout_in_milliseconds: ctx.function_timeout_ms,
        started_date: started,
        estimated_total_lambda_invocations: 1,
        estimated_render_lambda_invocations: 1,
        composition_id: composition.id.clone(),
        serve_url: payload.serve_url.clone(),
        input_props: composition.props.clone(),
        max_retries: payload.max_retries,
        privacy: payload.privacy,
        out_name: payload.out_name.clone(),
        delete_after: parse_delete_after(payload.delete_after.as_deref())?,
        bucket_name: store.bucket().to_string(),
        function_name: ctx.function_name.clone(),
        renderer_function_name: ctx.function_name.clone(),
        version: ctx.version.clone(),
        metadata: None,
        scale: payload.scale,
        concurrency_per_lambda: None,
        env_variables: payload.env_variables.clone(),
        muted: true,
        crf: None,
        frame_timeout_in_milliseconds: payload.timeout_in_milliseconds,
        duration_in_frames: composition.duration_in_frames,
        composition_validated: Some(composition_validated),
        serve_url_opened: Some(started),
    };
    store.write_job(&job).await?;

    let still_job = StillJob {
        render_id: job.render_id.clone(),
        frame,
        attempt,
        composition,
        input_props: job.input_props.clone(),
        image_format: payload.image_format,
        scale: payload.scale,
        jpeg_quality: payload.jpeg_quality,
        timeout_in_milliseconds: payload.timeout_in_milliseconds,
    };

    let (tx, mut rx) = mpsc::channel(8);
    let mut relay = EventRelay::new(store, response);
    let consume = async {
        while let Some(event) = rx.recv().await {
            match event {
                RenderEvent::FramesRendered { rendered, encoded } => {
                    relay.frames(rendered, encoded).await;
                }
                RenderEvent::Artifact { filename, content } => {
                    relay.artifact(filename, content).await;
                }
            }
        }
    };
    let (rendered, ()) = tokio::join!(
        services.renderer.render_still(&still_job, scratch_dir, tx),
        consume
    );
    let rendered = rendered?;

    let location = expected_output(
        &job.render_id,
        &job.bucket_name,
        job.out_name.as_ref(),
        payload.image_format.file_extension(),
    );
    let size_in_bytes = rendered.image.len() as u64;
    let output_url = store.write_output(&location, rendered.image).await?;

    let price = estimate_price(
        &ctx.prices,
        &CostInput {
            duration_ms: (ctx.now_ms() - started).max(0),
            memory_size_in_mb: job.memory_size_in_mb,
            region: &job.region,
            invocations: 1,
            disk_size_in_mb: ctx.ephemeral_storage_in_mb,
        },
    );

    info!(
        render_id = %job.render_id,
        frame,
        size = size_in_bytes,
        output = %output_url,
        "Still rendered"
    );

    Ok(StillRenderedPayload {
        output_url,
        out_key: location.key,
        size_in_bytes,
        bucket_name: location.bucket,
        estimated_price: format_costs_info(price),
        render_id: job.render_id,
        received_artifacts: relay.into_artifacts(),
    })
}
