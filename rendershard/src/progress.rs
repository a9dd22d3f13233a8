//! Aggregation of every record of a render into one progress snapshot.
//!
//! The snapshot is recomputed on every `status` call from whatever is
//! currently visible in storage. A partial view is normal while a render is
//! in flight; nothing here fails because a record is missing.

use std::collections::BTreeSet;

use shard_protocol::{
    ChunkRecord, EncodingStatus, JobRecord, PostRenderData, RenderProgress,
};
use tracing::debug;

use crate::Result;
use crate::artifacts::ArtifactCollector;
use crate::classify::{fatal_error_encountered, inspect_errors};
use crate::context::ExecutionContext;
use crate::cost::{CostInput, estimate_price, format_costs_info, zero_costs};
use crate::store::ProgressStore;
use crate::timeout::{detect_timeout, make_timeout_error};

/// Weights of the invoking, rendering, encoding and combining phases.
pub const PHASE_WEIGHTS: PhaseWeights = PhaseWeights {
    invoking: 0.10,
    rendering: 0.50,
    encoding: 0.25,
    combining: 0.15,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseWeights {
    pub invoking: f64,
    pub rendering: f64,
    pub encoding: f64,
    pub combining: f64,
}

/// Completion ratio of each phase, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseRatios {
    pub invoking: f64,
    pub rendering: f64,
    pub encoding: f64,
    pub combining: f64,
}

impl PhaseRatios {
    fn all_complete(&self) -> bool {
        self.invoking >= 1.0 && self.rendering >= 1.0 && self.encoding >= 1.0 && self.combining >= 1.0
    }
}

fn ratio(value: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (value as f64 / total as f64).clamp(0.0, 1.0)
}

/// Blend phase ratios into one number. Exactly 1 only when every phase is complete.
pub fn overall_progress(ratios: &PhaseRatios, weights: &PhaseWeights) -> f64 {
    if ratios.all_complete() {
        return 1.0;
    }
    let total = weights.invoking + weights.rendering + weights.encoding + weights.combining;
    let blended = (ratios.invoking.clamp(0.0, 1.0) * weights.invoking
        + ratios.rendering.clamp(0.0, 1.0) * weights.rendering
        + ratios.encoding.clamp(0.0, 1.0) * weights.encoding
        + ratios.combining.clamp(0.0, 1.0) * weights.combining)
        / total;
    blended.clamp(0.0, 1.0 - f64::EPSILON)
}

/// Chunk indices in `0..total_chunks` without a completed record.
pub fn missing_chunks(total_chunks: u32, chunks: &[ChunkRecord]) -> Vec<u32> {
    let done: BTreeSet<u32> = chunks
        .iter()
        .filter(|c| c.is_done())
        .map(|c| c.chunk)
        .collect();
    (0..total_chunks).filter(|i| !done.contains(i)).collect()
}

fn empty_snapshot(render_id: &str, bucket_name: &str, now: i64) -> RenderProgress {
    RenderProgress {
        render_id: render_id.to_string(),
        bucket_name: bucket_name.to_string(),
        done: false,
        overall_progress: 0.0,
        chunks: 0,
        missing_chunks: Vec::new(),
        frames_rendered: 0,
        frames_encoded: 0,
        combined_frames: 0,
        lambdas_invoked: 0,
        errors: Vec::new(),
        fatal_error_encountered: false,
        costs: zero_costs(),
        output_file: None,
        out_key: None,
        out_bucket: None,
        output_size_in_bytes: None,
        render_size: 0,
        timeout_timestamp: None,
        composition_validated: None,
        function_launched: None,
        serve_url_opened: None,
        encoding_status: None,
        time_to_finish: None,
        time_to_finish_chunks: None,
        time_to_render_frames: None,
        estimated_billing_duration_in_milliseconds: None,
        current_time: now,
        render_metadata: None,
        retries_info: Vec::new(),
        artifacts: Vec::new(),
    }
}

fn finished_snapshot(
    job: JobRecord,
    post: PostRenderData,
    function_launched: Option<i64>,
    now: i64,
) -> RenderProgress {
    let total_frames = job.total_frame_count();
    let mut snapshot = empty_snapshot(&job.render_id, &job.bucket_name, now);

    snapshot.done = true;
    snapshot.overall_progress = 1.0;
    snapshot.chunks = job.total_chunks;
    snapshot.frames_rendered = total_frames;
    snapshot.frames_encoded = total_frames;
    snapshot.combined_frames = total_frames;
    snapshot.lambdas_invoked = job.estimated_render_lambda_invocations;
    snapshot.fatal_error_encountered = fatal_error_encountered(&post.errors);
    snapshot.errors = post.errors;
    snapshot.costs = post.cost;
    snapshot.output_file = Some(post.output_file);
    snapshot.out_key = Some(post.out_key);
    snapshot.out_bucket = Some(post.out_bucket);
    snapshot.output_size_in_bytes = Some(post.output_size);
    snapshot.render_size = post.render_size;
    snapshot.timeout_timestamp = Some(job.timeout_timestamp());
    snapshot.composition_validated = job.composition_validated;
    snapshot.function_launched = function_launched;
    snapshot.serve_url_opened = job.serve_url_opened;
    snapshot.encoding_status = Some(EncodingStatus {
        frames_encoded: total_frames,
        combined_frames: total_frames,
        time_to_combine: post.time_to_combine,
    });
    snapshot.time_to_finish = Some(post.time_to_finish);
    snapshot.time_to_finish_chunks = Some(post.time_to_render_chunks);
    snapshot.time_to_render_frames = post.time_to_render_frames;
    snapshot.estimated_billing_duration_in_milliseconds =
        Some(post.estimated_billing_duration_in_milliseconds);
    snapshot.retries_info = post.retries_info;
    snapshot.artifacts = post.artifacts;
    snapshot.render_metadata = Some(job);
    snapshot
}

/// Milliseconds billed so far across chunk invocations. Chunks still in flight
/// count up to their last recorded update.
pub fn billed_chunk_duration(chunks: &[ChunkRecord]) -> i64 {
    chunks
        .iter()
        .map(|c| {
            c.timings
                .duration()
                .unwrap_or_else(|| (c.timings.last_update - c.timings.start).max(0))
        })
        .sum()
}

/// Compute the progress snapshot of the render behind `store`.
pub async fn aggregate(store: &ProgressStore, ctx: &ExecutionContext) -> Result<RenderProgress> {
    let now = ctx.now_ms();
    let render_id = store.render_id();

    let Some(job) = store.read_job().await? else {
        debug!(render_id, "Job record not visible yet");
        return Ok(empty_snapshot(render_id, store.bucket(), now));
    };

    let function_launched = store.read_launch().await?.map(|l| l.function_launched);

    if let Some(post) = store.read_post_render().await? {
        return Ok(finished_snapshot(job, post, function_launched, now));
    }

    let chunks: Vec<ChunkRecord> = store
        .read_chunks()
        .await?
        .into_iter()
        .filter(|c| c.chunk < job.total_chunks)
        .collect();
    let missing = missing_chunks(job.total_chunks, &chunks);
    let done_chunks: Vec<&ChunkRecord> = chunks.iter().filter(|c| c.is_done()).collect();

    let total_frames = job.total_frame_count();
    let frames_rendered = chunks
        .iter()
        .map(|c| c.frames_rendered)
        .sum::<u32>()
        .min(total_frames);
    let frames_encoded = chunks
        .iter()
        .map(|c| c.frames_encoded)
        .sum::<u32>()
        .min(total_frames);
    let combine = store.read_combine().await?;
    let combined_frames = combine
        .map(|c| c.combined_frames)
        .unwrap_or(0)
        .min(total_frames);
    let lambdas_invoked = chunks.len() as u32;

    let ratios = PhaseRatios {
        invoking: ratio(lambdas_invoked, job.estimated_render_lambda_invocations),
        rendering: ratio(frames_rendered, total_frames),
        encoding: ratio(frames_encoded, total_frames),
        combining: ratio(combined_frames, total_frames),
    };

    let mut errors = inspect_errors(&store.read_errors().await?);
    if let Some(kind) = detect_timeout(job.started_date, job.timeout_in_milliseconds, &missing, now) {
        errors.push(make_timeout_error(&job, &missing, kind, &ctx.log_locator));
    }

    let billed = billed_chunk_duration(&chunks);
    let invocations = lambdas_invoked + u32::from(function_launched.is_some());
    let price = estimate_price(
        &ctx.prices,
        &CostInput {
            duration_ms: billed,
            memory_size_in_mb: job.memory_size_in_mb,
            region: &job.region,
            invocations,
            disk_size_in_mb: ctx.ephemeral_storage_in_mb,
        },
    );

    let time_to_finish_chunks = if missing.is_empty() {
        done_chunks
            .iter()
            .filter_map(|c| c.timings.encoded.or(c.timings.rendered))
            .max()
            .map(|end| end - job.started_date)
    } else {
        None
    };
    let time_to_render_frames = if missing.is_empty() {
        done_chunks
            .iter()
            .filter_map(|c| c.timings.rendered)
            .max()
            .map(|end| end - job.started_date)
    } else {
        None
    };

    let mut artifacts = ArtifactCollector::new();
    for chunk in &chunks {
        artifacts.extend(chunk.artifacts.iter().cloned());
    }

    let mut snapshot = empty_snapshot(&job.render_id, &job.bucket_name, now);
    snapshot.overall_progress = overall_progress(&ratios, &PHASE_WEIGHTS);
    snapshot.chunks = done_chunks.len() as u32;
    snapshot.missing_chunks = missing;
    snapshot.frames_rendered = frames_rendered;
    snapshot.frames_encoded = frames_encoded;
    snapshot.combined_frames = combined_frames;
    snapshot.lambdas_invoked = lambdas_invoked;
    snapshot.fatal_error_encountered = fatal_error_encountered(&errors);
    snapshot.errors = errors;
    snapshot.costs = format_costs_info(price);
    snapshot.render_size = done_chunks.iter().filter_map(|c| c.output_size).sum();
    snapshot.timeout_timestamp = Some(job.timeout_timestamp());
    snapshot.composition_validated = job.composition_validated;
    snapshot.function_launched = function_launched;
    snapshot.serve_url_opened = job.serve_url_opened;
    snapshot.encoding_status = (frames_encoded > 0 || combine.is_some()).then(|| EncodingStatus {
        frames_encoded,
        combined_frames,
        time_to_combine: combine.and_then(|c| c.time_to_combine),
    });
    snapshot.time_to_finish_chunks = time_to_finish_chunks;
    snapshot.time_to_render_frames = time_to_render_frames;
    snapshot.estimated_billing_duration_in_milliseconds = Some(billed);
    snapshot.retries_info = store.read_retries().await?;
    snapshot.artifacts = artifacts.into_vec();
    snapshot.render_metadata = Some(job);
    Ok(snapshot)
}
