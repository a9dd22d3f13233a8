//! Partitioning of a frame range into chunks.

use shard_protocol::FrameRange;

use crate::{Error, Result};

/// Smallest `framesPerLambda` a caller may request.
pub const MIN_FRAMES_PER_LAMBDA: u32 = 4;
/// Upper bound on chunk invocations for a single render.
pub const MAX_FUNCTIONS_PER_RENDER: u32 = 200;
/// Floor of the automatically chosen `framesPerLambda`.
const MIN_DEFAULT_FRAMES_PER_LAMBDA: f64 = 20.0;

/// Number of frames `f` in `range` with `f % every_nth_frame == 0`.
pub fn frames_to_render_count(range: FrameRange, every_nth_frame: u32) -> u32 {
    let n = every_nth_frame.max(1);
    let FrameRange(start, end) = range;
    if end < start {
        return 0;
    }
    let up_to_end = end / n + 1;
    let below_start = if start == 0 { 0 } else { (start - 1) / n + 1 };
    up_to_end - below_start
}

/// Pick a chunk size when the caller did not.
///
/// Concurrency grows linearly from 75 at zero frames to 150 at ten minutes of
/// 30 fps video, then the chunk size is evened out so chunks are balanced.
pub fn default_frames_per_lambda(frame_count: u32) -> u32 {
    if frame_count == 0 {
        return MIN_DEFAULT_FRAMES_PER_LAMBDA as u32;
    }
    let frames = frame_count as f64;
    let concurrency = 75.0 + (frames / 18_000.0).min(1.0) * 75.0;
    let per_lambda = (frames / concurrency).max(MIN_DEFAULT_FRAMES_PER_LAMBDA);
    let lambdas_needed = (frames / per_lambda).ceil();
    (frames / lambdas_needed).ceil() as u32
}

/// Resolve the requested range against the composition duration.
pub fn resolve_frame_range(requested: Option<FrameRange>, duration_in_frames: u32) -> Result<FrameRange> {
    if duration_in_frames == 0 {
        return Err(Error::validation("The composition has a duration of 0 frames"));
    }
    let last = duration_in_frames - 1;
    match requested {
        None => Ok(FrameRange(0, last)),
        Some(FrameRange(start, end)) if start > end => Err(Error::validation(format!(
            "The start of frameRange ({start}) must not be after its end ({end})"
        ))),
        Some(FrameRange(_, end)) if end > last => Err(Error::validation(format!(
            "frameRange ends at frame {end} but the composition only has frames 0 to {last}"
        ))),
        Some(range) => Ok(range),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub frames_per_lambda: u32,
    pub frame_count: u32,
    pub chunks: Vec<FrameRange>,
}

impl ChunkPlan {
    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }
}

/// Split `range` into chunks of `frames_per_lambda` rendered frames each.
pub fn plan_chunks(
    range: FrameRange,
    every_nth_frame: u32,
    frames_per_lambda: Option<u32>,
) -> Result<ChunkPlan> {
    if every_nth_frame == 0 {
        return Err(Error::validation("everyNthFrame must be at least 1"));
    }

    let frame_count = frames_to_render_count(range, every_nth_frame);
    if frame_count == 0 {
        return Err(Error::validation(format!(
            "No frames to render: frameRange {range} with everyNthFrame {every_nth_frame} selects no frames"
        )));
    }

    let fpl = match frames_per_lambda {
        Some(fpl) if fpl < MIN_FRAMES_PER_LAMBDA => {
            return Err(Error::validation(format!(
                "framesPerLambda must be at least {MIN_FRAMES_PER_LAMBDA}, got {fpl}"
            )));
        }
        Some(fpl) => fpl,
        None => default_frames_per_lambda(frame_count),
    };

    let chunk_count = frame_count.div_ceil(fpl);
    if chunk_count > MAX_FUNCTIONS_PER_RENDER {
        return Err(Error::validation(format!(
            "Too many functions: this render would spawn {chunk_count} functions. The limit is {MAX_FUNCTIONS_PER_RENDER} functions per render. Increase framesPerLambda to at least {}.",
            frame_count.div_ceil(MAX_FUNCTIONS_PER_RENDER)
        )));
    }

    let first = range.start();
    let last = range.end();
    let span = u64::from(fpl) * u64::from(every_nth_frame);
    let chunks = (0..u64::from(chunk_count))
        .map(|i| {
            let start = u64::from(first) + i * span;
            let end = (u64::from(first) + (i + 1) * span - 1).min(u64::from(last));
            FrameRange(start as u32, end as u32)
        })
        .collect();

    Ok(ChunkPlan {
        frames_per_lambda: fpl,
        frame_count,
        chunks,
    })
}
