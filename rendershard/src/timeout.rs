//! Detection of renders whose workers stopped reporting.
//!
//! Workers cannot be inspected directly, so a render is declared timed out
//! purely from its start time, its declared function timeout and which chunks
//! are still missing.

use shard_protocol::{EnhancedErrorInfo, JobRecord, JobType};

use crate::context::LogLocator;
use crate::error::ErrorKind;

/// Buffer added to the declared timeout to absorb clock and scheduling skew.
pub const TIMEOUT_GRACE_MS: i64 = 20_000;

/// Missing chunks listed individually in a timeout message.
pub const MAX_MISSING_CHUNKS_IN_MESSAGE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Chunks are still missing after the function timeout elapsed.
    StalledChunks,
    /// Every chunk arrived but combining never finished.
    StuckMerge,
}

/// Decide whether a render has timed out at `now`.
pub fn detect_timeout(
    started_date: i64,
    timeout_in_milliseconds: u64,
    missing_chunks: &[u32],
    now: i64,
) -> Option<TimeoutKind> {
    let timeout = i64::try_from(timeout_in_milliseconds).unwrap_or(i64::MAX);
    let stalled_after = started_date
        .saturating_add(timeout)
        .saturating_add(TIMEOUT_GRACE_MS);
    let stuck_after = started_date
        .saturating_add(timeout.saturating_mul(2))
        .saturating_add(TIMEOUT_GRACE_MS);

    if !missing_chunks.is_empty() && now > stalled_after {
        return Some(TimeoutKind::StalledChunks);
    }
    if now > stuck_after {
        return Some(TimeoutKind::StuckMerge);
    }
    None
}

/// Inclusive frame range reported for a missing chunk.
pub fn missing_chunk_frames(job: &JobRecord, chunk: u32) -> (u32, u32) {
    let fpl = job.frames_per_lambda;
    let last_frame = job.frame_range.end();
    let start = chunk.saturating_mul(fpl);
    if job.job_type == JobType::Still {
        return (start, 0);
    }
    let end = chunk
        .saturating_add(1)
        .saturating_mul(fpl)
        .saturating_sub(1)
        .min(last_frame);
    (start, end)
}

fn missing_chunks_message(
    job: &JobRecord,
    missing_chunks: &[u32],
    function_name: &str,
    locator: &LogLocator,
) -> String {
    if missing_chunks.is_empty() {
        return "All chunks have been successfully rendered, but the main function has timed out."
            .to_string();
    }

    let mut lines = vec![format!(
        "The following chunks are missing (showing {} out of {}):",
        missing_chunks.len().min(MAX_MISSING_CHUNKS_IN_MESSAGE),
        missing_chunks.len()
    )];
    for &chunk in missing_chunks.iter().take(MAX_MISSING_CHUNKS_IN_MESSAGE) {
        let (start, end) = missing_chunk_frames(job, chunk);
        lines.push(format!("Chunk {chunk} (Frames {start} - {end})"));
        lines.push(format!(
            "▸ Logs for chunk {chunk}: {}",
            locator.chunk_logs(function_name, &job.render_id, chunk)
        ));
    }
    lines.join("\n")
}

pub fn make_timeout_message(
    job: &JobRecord,
    missing_chunks: &[u32],
    kind: TimeoutKind,
    locator: &LogLocator,
) -> String {
    let waited = match kind {
        TimeoutKind::StalledChunks => job.timeout_in_milliseconds,
        TimeoutKind::StuckMerge => job.timeout_in_milliseconds.saturating_mul(2),
    };

    [
        format!("The main function timed out after {waited}ms."),
        missing_chunks_message(job, missing_chunks, &job.renderer_function_name, locator),
        String::new(),
        "Consider increasing the timeout of your function.".to_string(),
        "▸ Raise `function_timeout_ms` in the deployment config or RENDERSHARD_TIMEOUT_MS in the environment.".to_string(),
        String::new(),
        "▸ Visit the logs for the main function:".to_string(),
        locator.main_logs(&job.function_name, &job.render_id),
        "▸ Visit the logs for the renderer functions:".to_string(),
        locator.main_logs(&job.renderer_function_name, &job.render_id),
    ]
    .join("\n")
}

/// Synthetic fatal error appended to a snapshot once a timeout is detected.
pub fn make_timeout_error(
    job: &JobRecord,
    missing_chunks: &[u32],
    kind: TimeoutKind,
    locator: &LogLocator,
) -> EnhancedErrorInfo {
    let message = make_timeout_message(job, missing_chunks, kind, locator);
    EnhancedErrorInfo {
        attempt: 1,
        total_attempts: 1,
        chunk: None,
        frame: None,
        is_fatal: true,
        will_retry: false,
        error_type: "stitcher".to_string(),
        name: ErrorKind::Timeout.name().to_string(),
        stack: format!("{}: {}", ErrorKind::Timeout.name(), message),
        message,
        explanation: None,
    }
}
