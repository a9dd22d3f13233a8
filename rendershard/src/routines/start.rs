use std::sync::Arc;

use bytes::Bytes;
use shard_protocol::{
    Dimensions, JobRecord, JobType, LaunchPayload, RoutinePayload, StartPayload, StartResponse,
    SuccessTag, encode_payload,
};
use tracing::info;

use crate::Result;
use crate::context::ExecutionContext;
use crate::naming::{parse_delete_after, random_render_id, validate_out_name};
use crate::plan::{plan_chunks, resolve_frame_range};
use crate::services::ServiceContainer;
use crate::validate::{
    validate_concurrency_per_lambda, validate_dimension, validate_every_nth_frame, validate_scale,
    validate_serve_url, validate_timeout, validate_webhook,
};

fn validate(payload: &StartPayload) -> Result<()> {
    validate_serve_url(&payload.serve_url)?;
    validate_every_nth_frame(payload.every_nth_frame, payload.codec)?;
    validate_webhook(payload.webhook.as_ref())?;
    validate_out_name(payload.out_name.as_ref(), Some(payload.codec))?;
    validate_scale(payload.scale)?;
    validate_dimension("forceWidth", payload.force_width)?;
    validate_dimension("forceHeight", payload.force_height)?;
    validate_timeout(payload.timeout_in_milliseconds)?;
    validate_concurrency_per_lambda(payload.concurrency_per_lambda)?;
    Ok(())
}

/// Validate a render request, persist its job record and hand the fan-out to
/// a `launch` invocation without waiting for it.
pub async fn start(
    services: &Arc<ServiceContainer>,
    ctx: &ExecutionContext,
    payload: StartPayload,
) -> Result<StartResponse> {
    validate(&payload)?;
    let delete_after = parse_delete_after(payload.delete_after.as_deref())?;

    let serve_url_opened = ctx.now_ms();
    let composition = services
        .compositions
        .resolve(&payload.serve_url, &payload.composition, &payload.input_props)
        .await?;
    let composition_validated = ctx.now_ms();

    let frame_range = resolve_frame_range(payload.frame_range, composition.duration_in_frames)?;
    let plan = plan_chunks(frame_range, payload.every_nth_frame, payload.frames_per_lambda)?;

    let render_id = random_render_id(delete_after);
    let bucket_name = ctx.bucket_or_default(payload.bucket_name.as_deref());
    let renderer_function_name = payload
        .renderer_function_name
        .clone()
        .unwrap_or_else(|| ctx.renderer_function_name.clone());

    let job = JobRecord {
        render_id: render_id.clone(),
        job_type: JobType::Video,
        total_chunks: plan.total_chunks(),
        frames_per_lambda: plan.frames_per_lambda,
        frame_range,
        every_nth_frame: payload.every_nth_frame,
        codec: Some(payload.codec),
        audio_codec: payload.audio_codec,
        image_format: payload.image_format,
        dimensions: Dimensions {
            width: payload.force_width.unwrap_or(composition.width),
            height: payload.force_height.unwrap_or(composition.height),
        },
        fps: composition.fps,
        region: ctx.region.clone(),
        memory_size_in_mb: ctx.memory_size_in_mb,
        timeout_in_milliseconds: ctx.function_timeout_ms,
        started_date: ctx.now_ms(),
        estimated_total_lambda_invocations: plan.total_chunks() + 1,
        estimated_render_lambda_invocations: plan.total_chunks(),
        composition_id: composition.id.clone(),
        serve_url: payload.serve_url.clone(),
        input_props: composition.props.clone(),
        max_retries: payload.max_retries,
        privacy: payload.privacy,
        out_name: payload.out_name.clone(),
        delete_after,
        bucket_name: bucket_name.clone(),
        function_name: ctx.function_name.clone(),
        renderer_function_name,
        version: ctx.version.clone(),
        metadata: payload.metadata.clone(),
        scale: payload.scale,
        concurrency_per_lambda: payload.concurrency_per_lambda,
        env_variables: payload.env_variables.clone(),
        muted: payload.muted,
        crf: payload.crf,
        frame_timeout_in_milliseconds: payload.timeout_in_milliseconds,
        duration_in_frames: composition.duration_in_frames,
        composition_validated: Some(composition_validated),
        serve_url_opened: Some(serve_url_opened),
    };

    services
        .progress_store(&bucket_name, &render_id)
        .write_job(&job)
        .await?;
    info!(
        render_id = %render_id,
        bucket = %bucket_name,
        total_chunks = job.total_chunks,
        frames_per_lambda = job.frames_per_lambda,
        frame_range = %frame_range,
        "Render planned"
    );

    let launch = RoutinePayload::Launch(LaunchPayload {
        version: ctx.version.clone(),
        render_id: render_id.clone(),
        bucket_name: bucket_name.clone(),
        webhook: payload.webhook,
        log_level: payload.log_level,
    });
    let body = encode_payload(&launch)?;
    services
        .invoker
        .invoke_event(&ctx.function_name, Bytes::from(body))
        .await?;

    Ok(StartResponse {
        tag: SuccessTag::Success,
        render_id,
        bucket_name,
    })
}
