//! Classification of raw failures into fatal and retryable errors.

use shard_protocol::{EnhancedErrorInfo, ErrorRecord, ErrorSource};

use crate::error::{Error, ErrorKind};

/// Where to go when invocations are being throttled.
pub const RATE_LIMIT_URL: &str = "https://rendershard.dev/docs/concurrency-limits";

/// Extra attempts granted to flaky failures beyond the configured retries.
pub const FLAKY_RETRY_ALLOWANCE: u32 = 2;

/// Messages of failures known to go away when the work is simply run again.
pub const FLAKY_SIGNATURES: &[&str] = &[
    "Target closed",
    "Session closed",
    "Compositor panicked",
    "zygote_communication_linux",
    "socket hang up",
    "ECONNRESET",
    "but the server sent no data",
    "Protocol error (Target.setDiscoverTargets)",
    "waitForFunction timed out",
];

pub fn is_flaky_error(message: &str) -> bool {
    FLAKY_SIGNATURES.iter().any(|sig| message.contains(sig))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub is_fatal: bool,
    pub will_retry: bool,
    pub explanation: Option<String>,
}

/// Classify a failure observed on `attempt` out of `total_attempts`.
///
/// Flaky failures are retried even when no configured attempt remains, but
/// only for [`FLAKY_RETRY_ALLOWANCE`] extra attempts, so a worker that crashes
/// on every run still ends in a fatal error.
pub fn classify(kind: ErrorKind, message: &str, attempt: u32, total_attempts: u32) -> Classification {
    let kind = match kind {
        ErrorKind::Render | ErrorKind::Internal if is_flaky_error(message) => ErrorKind::FlakyInfra,
        other => other,
    };

    let will_retry = match kind {
        k if k.is_never_retried() => false,
        ErrorKind::FlakyInfra => attempt < total_attempts.saturating_add(FLAKY_RETRY_ALLOWANCE),
        _ => attempt < total_attempts,
    };

    Classification {
        kind,
        is_fatal: !will_retry,
        will_retry,
        explanation: explain(kind, message),
    }
}

pub fn classify_error(err: &Error, attempt: u32, total_attempts: u32) -> Classification {
    classify(err.kind(), &err.to_string(), attempt, total_attempts)
}

fn explain(kind: ErrorKind, message: &str) -> Option<String> {
    if kind == ErrorKind::RateLimit {
        return Some(format!(
            "Too many functions were invoked at the same time. Lower the concurrency of your renders or raise the concurrency limit of your account. See: {RATE_LIMIT_URL}"
        ));
    }
    if kind == ErrorKind::VersionMismatch {
        return Some(format!(
            "Deploy a function whose version matches the client. See: {}",
            shard_protocol::UPGRADE_URL
        ));
    }
    if message.contains("ENOSPC") {
        return Some(
            "The function ran out of ephemeral disk space. Increase the disk size of the function or lower framesPerLambda.".to_string(),
        );
    }
    if message.contains("Out of memory") || message.contains("SIGKILL") {
        return Some(
            "The function ran out of memory. Increase the memory size of the function or lower concurrencyPerLambda.".to_string(),
        );
    }
    if message.contains("Navigation timeout") || message.contains("delayRender") {
        return Some(
            "A frame did not become ready within timeoutInMilliseconds. Increase the timeout or make sure every delayRender() handle is released.".to_string(),
        );
    }
    None
}

/// Build the durable record of a failure.
pub fn error_record(
    err: &Error,
    source: ErrorSource,
    chunk: Option<u32>,
    frame: Option<u32>,
    attempt: u32,
    total_attempts: u32,
    timestamp: i64,
) -> ErrorRecord {
    let classification = classify_error(err, attempt, total_attempts);
    ErrorRecord {
        chunk,
        frame,
        attempt,
        total_attempts,
        will_retry: classification.will_retry,
        name: classification.kind.name().to_string(),
        message: err.to_string(),
        stack: err.stack(),
        source,
        timestamp,
    }
}

/// Classify a stored failure for presentation.
pub fn enhance(record: &ErrorRecord) -> EnhancedErrorInfo {
    let kind = ErrorKind::from_name(&record.name).unwrap_or(ErrorKind::Render);
    let classification = classify(kind, &record.message, record.attempt, record.total_attempts);
    let will_retry = classification.will_retry && record.will_retry;

    EnhancedErrorInfo {
        attempt: record.attempt,
        total_attempts: record.total_attempts,
        chunk: record.chunk,
        frame: record.frame,
        is_fatal: !will_retry,
        will_retry,
        error_type: record.source.as_str().to_string(),
        name: record.name.clone(),
        message: record.message.clone(),
        stack: record.stack.clone(),
        explanation: classification.explanation,
    }
}

/// Classify every stored failure, oldest first.
pub fn inspect_errors(records: &[ErrorRecord]) -> Vec<EnhancedErrorInfo> {
    let mut sorted: Vec<&ErrorRecord> = records.iter().collect();
    sorted.sort_by_key(|r| (r.timestamp, r.chunk, r.attempt));
    sorted.into_iter().map(enhance).collect()
}

pub fn fatal_error_encountered(errors: &[EnhancedErrorInfo]) -> bool {
    errors.iter().any(|e| e.is_fatal && !e.will_retry)
}
