//! Fan-out of chunk renders, then the combine of their outputs.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use shard_protocol::{
    ChunkRecord, CombineProgress, CompositionInfo, CostsInfo, EnhancedErrorInfo, ErrorSource,
    JobRecord, JobType, LaunchPayload, LaunchRecord, LaunchResponse, LogLevel, PostRenderData,
    RendererPayload, RetryRecord, RoutinePayload, StreamingPayload, SuccessTag, WebhookOption,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactCollector;
use crate::classify::{error_record, fatal_error_encountered, inspect_errors};
use crate::context::ExecutionContext;
use crate::cost::{CostInput, estimate_price, format_costs_info};
use crate::engine::CombineJob;
use crate::naming::{OutputLocation, expected_output};
use crate::plan::plan_chunks;
use crate::pool::FanOutPool;
use crate::progress::{aggregate, billed_chunk_duration, missing_chunks};
use crate::services::ServiceContainer;
use crate::store::ProgressStore;
use crate::timeout::{TimeoutKind, make_timeout_error};
use crate::transport::{TransportError, stream_routine};
use crate::webhook::{WebhookKind, WebhookPayload};
use crate::{Error, ErrorKind, Result};

/// Reads of a record that may not be visible yet before it counts as absent.
const VISIBILITY_ATTEMPTS: u32 = 10;

/// Polls after every chunk invocation returned before missing chunks are
/// declared lost.
const SETTLE_POLLS: u32 = 3;

enum Outcome {
    Rendered(Vec<ChunkRecord>),
    Fatal,
    Incomplete(Vec<u32>),
    TimedOut(Vec<u32>),
}

/// Decrements the number of outstanding chunk invocations when dropped, also
/// when the pool discards a task before running it.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn until_visible<T, F, Fut>(interval: Duration, mut read: F) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 0..VISIBILITY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(interval).await;
        }
        if let Some(value) = read().await? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn composition_of(job: &JobRecord) -> CompositionInfo {
    CompositionInfo {
        id: job.composition_id.clone(),
        width: job.dimensions.width,
        height: job.dimensions.height,
        fps: job.fps,
        duration_in_frames: job.duration_in_frames,
        default_codec: job.codec,
        props: job.input_props.clone(),
    }
}

fn chunk_payloads(
    job: &JobRecord,
    ctx: &ExecutionContext,
    log_level: LogLevel,
) -> Result<Vec<RendererPayload>> {
    let codec = job
        .codec
        .ok_or_else(|| Error::validation("Video render has no codec"))?;
    let plan = plan_chunks(job.frame_range, job.every_nth_frame, Some(job.frames_per_lambda))?;
    if plan.total_chunks() != job.total_chunks {
        return Err(Error::Other(format!(
            "Job record declares {} chunks but its frame range splits into {}",
            job.total_chunks,
            plan.total_chunks()
        )));
    }

    let composition = composition_of(job);
    Ok(plan
        .chunks
        .into_iter()
        .enumerate()
        .map(|(chunk, frame_range)| RendererPayload {
            version: ctx.version.clone(),
            render_id: job.render_id.clone(),
            bucket_name: job.bucket_name.clone(),
            chunk: chunk as u32,
            frame_range,
            attempt: 1,
            max_retries: job.max_retries,
            serve_url: job.serve_url.clone(),
            composition: job.composition_id.clone(),
            resolved_composition: composition.clone(),
            input_props: job.input_props.clone(),
            codec,
            audio_codec: job.audio_codec,
            image_format: job.image_format,
            every_nth_frame: job.every_nth_frame,
            scale: job.scale,
            concurrency_per_lambda: job.concurrency_per_lambda,
            timeout_in_milliseconds: job.frame_timeout_in_milliseconds,
            log_level,
            env_variables: job.env_variables.clone(),
            muted: job.muted,
        })
        .collect())
}

/// Invoke one chunk until it renders or fails for good.
async fn run_chunk(
    services: Arc<ServiceContainer>,
    store: ProgressStore,
    function_name: String,
    mut payload: RendererPayload,
    token: CancellationToken,
) {
    let chunk = payload.chunk;
    let total_attempts = payload.max_retries.saturating_add(1);

    loop {
        if token.is_cancelled() {
            debug!(chunk, "Fan-out cancelled");
            return;
        }

        let request = RoutinePayload::Renderer(payload.clone());
        let result = stream_routine(
            services.invoker.as_ref(),
            &services.retry,
            &token,
            &function_name,
            &request,
        )
        .await;

        let retry = match result {
            Ok(messages) => match messages.into_iter().map(|m| m.message).find(|m| m.is_terminal()) {
                Some(StreamingPayload::ChunkRendered(record)) => {
                    debug!(chunk, attempt = payload.attempt, frames = record.frames_rendered, "Chunk rendered");
                    return;
                }
                Some(StreamingPayload::ErrorOccurred {
                    error,
                    should_retry,
                    ..
                }) => {
                    warn!(chunk, attempt = payload.attempt, should_retry, error = %error, "Chunk reported an error");
                    should_retry
                }
                other => {
                    warn!(chunk, message = ?other, "Chunk stream ended with an unexpected message");
                    false
                }
            },
            Err(TransportError::Cancelled) => return,
            Err(e) => {
                warn!(chunk, attempt = payload.attempt, error = %e, "Chunk invocation failed");
                let record = error_record(
                    &Error::from(e),
                    ErrorSource::Launch,
                    Some(chunk),
                    None,
                    payload.attempt,
                    total_attempts,
                    services.clock.now_ms(),
                );
                if let Err(e) = store.write_error(&record).await {
                    warn!(chunk, error = %e, "Failed to record invocation error");
                }
                record.will_retry
            }
        };

        if !retry {
            return;
        }
        payload.attempt += 1;
        let record = RetryRecord {
            chunk,
            attempt: payload.attempt,
            time: services.clock.now_ms(),
        };
        if let Err(e) = store.write_retry(&record).await {
            warn!(chunk, error = %e, "Failed to record retry");
        }
        info!(chunk, attempt = payload.attempt, "Retrying chunk");
    }
}

async fn wait_for_chunks(
    services: &ServiceContainer,
    store: &ProgressStore,
    job: &JobRecord,
    pending: &AtomicUsize,
    token: &CancellationToken,
) -> Result<Outcome> {
    let interval = services.config.chunk_poll_interval();
    let timeout = i64::try_from(job.timeout_in_milliseconds).unwrap_or(i64::MAX);
    let deadline = job.started_date.saturating_add(timeout.saturating_mul(2));
    let mut settled_polls = 0;

    loop {
        let chunks = store.read_chunks().await?;
        let missing = missing_chunks(job.total_chunks, &chunks);
        if missing.is_empty() {
            let done = chunks
                .into_iter()
                .filter(|c| c.is_done() && c.chunk < job.total_chunks)
                .collect();
            return Ok(Outcome::Rendered(done));
        }

        let errors = inspect_errors(&store.read_errors().await?);
        if fatal_error_encountered(&errors) {
            return Ok(Outcome::Fatal);
        }
        if services.clock.now_ms() > deadline {
            return Ok(Outcome::TimedOut(missing));
        }
        if pending.load(Ordering::SeqCst) == 0 {
            settled_polls += 1;
            if settled_polls > SETTLE_POLLS {
                return Ok(Outcome::Incomplete(missing));
            }
        }

        debug!(missing = missing.len(), "Waiting for chunks");
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Transport(TransportError::Cancelled)),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

struct Combined {
    location: OutputLocation,
    url: String,
    output_size: u64,
    time_to_combine: i64,
}

async fn combine(
    services: &ServiceContainer,
    store: &ProgressStore,
    job: &JobRecord,
    chunks: &[ChunkRecord],
    scratch_dir: &Path,
) -> Result<Combined> {
    let codec = job
        .codec
        .ok_or_else(|| Error::validation("Video render has no codec"))?;
    let started = services.clock.now_ms();
    store
        .write_combine(&CombineProgress {
            combined_frames: 0,
            last_update: started,
            time_to_combine: None,
        })
        .await?;

    let interval = services.config.chunk_poll_interval();
    let mut bodies = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let key = chunk.output_key.as_deref().ok_or_else(|| {
            Error::storage(format!("Chunk {} finished without an output", chunk.chunk))
        })?;
        let body = until_visible(interval, || store.read_object(key))
            .await?
            .ok_or_else(|| Error::storage(format!("Output of chunk {} is missing at {key}", chunk.chunk)))?;
        bodies.push(body);
    }

    let combine_job = CombineJob {
        render_id: job.render_id.clone(),
        codec,
        fps: job.fps,
        total_frames: job.total_frame_count(),
        frames_per_chunk: chunks.iter().map(|c| c.frames_rendered).collect(),
    };
    let (tx, mut rx) = mpsc::channel(16);
    let report = async {
        while let Some(combined_frames) = rx.recv().await {
            let progress = CombineProgress {
                combined_frames,
                last_update: services.clock.now_ms(),
                time_to_combine: None,
            };
            if let Err(e) = store.write_combine(&progress).await {
                warn!(error = %e, "Failed to write combine progress");
            }
        }
    };
    let (output, ()) = tokio::join!(
        services.stitcher.combine(&combine_job, bodies, scratch_dir, tx),
        report
    );
    let output = output?;

    let location = expected_output(
        &job.render_id,
        &job.bucket_name,
        job.out_name.as_ref(),
        codec.file_extension(),
    );
    let output_size = output.body.len() as u64;
    let url = store.write_output(&location, output.body).await?;

    let finished = services.clock.now_ms();
    store
        .write_combine(&CombineProgress {
            combined_frames: combine_job.total_frames,
            last_update: finished,
            time_to_combine: Some(finished - started),
        })
        .await?;

    Ok(Combined {
        location,
        url,
        output_size,
        time_to_combine: finished - started,
    })
}

async fn post_render_data(
    ctx: &ExecutionContext,
    store: &ProgressStore,
    job: &JobRecord,
    chunks: &[ChunkRecord],
    function_launched: i64,
    combined: Combined,
) -> Result<PostRenderData> {
    let now = ctx.now_ms();
    let retries = store.read_retries().await?;
    let errors = inspect_errors(&store.read_errors().await?);

    let billed = billed_chunk_duration(chunks) + (now - function_launched).max(0);
    let invocations = chunks.len() as u32 + retries.len() as u32 + 1;
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

    let mut artifacts = ArtifactCollector::new();
    for chunk in chunks {
        artifacts.extend(chunk.artifacts.iter().cloned());
    }
    let chunks_finished = chunks
        .iter()
        .filter_map(|c| c.timings.encoded.or(c.timings.rendered))
        .max()
        .unwrap_or(now);
    let frames_finished = chunks.iter().filter_map(|c| c.timings.rendered).max();

    Ok(PostRenderData {
        output_file: combined.url,
        out_key: combined.location.key,
        out_bucket: combined.location.bucket,
        render_size: chunks.iter().filter_map(|c| c.output_size).sum(),
        output_size: combined.output_size,
        cost: format_costs_info(price),
        time_to_finish: now - job.started_date,
        time_to_render_chunks: chunks_finished - job.started_date,
        time_to_render_frames: frames_finished.map(|end| end - job.started_date),
        time_to_combine: Some(combined.time_to_combine),
        errors,
        retries_info: retries,
        estimated_billing_duration_in_milliseconds: billed,
        start_time: job.started_date,
        end_time: now,
        artifacts: artifacts.into_vec(),
    })
}

struct Notification {
    kind: WebhookKind,
    output_url: Option<String>,
    time_to_finish: Option<i64>,
    errors: Vec<EnhancedErrorInfo>,
    costs: CostsInfo,
}

async fn notify(
    services: &ServiceContainer,
    job: &JobRecord,
    webhook: Option<&WebhookOption>,
    notification: Notification,
) {
    let Some(webhook) = webhook else {
        return;
    };
    let payload = WebhookPayload {
        kind: notification.kind,
        render_id: job.render_id.clone(),
        expected_bucket_owner: None,
        bucket_name: job.bucket_name.clone(),
        output_url: notification.output_url,
        time_to_finish: notification.time_to_finish,
        errors: notification.errors.iter().map(Into::into).collect(),
        custom_data: webhook.custom_data.clone(),
        costs: notification.costs,
    };
    if let Err(e) = services.webhooks.send(webhook, &payload).await {
        error!(render_id = %job.render_id, error = %e, "Webhook could not be delivered");
    }
}

/// Report a render that will not produce an output.
async fn fail_render(
    services: &ServiceContainer,
    ctx: &ExecutionContext,
    store: &ProgressStore,
    job: &JobRecord,
    webhook: Option<&WebhookOption>,
    timed_out: Option<&[u32]>,
) -> Result<LaunchResponse> {
    let snapshot = aggregate(store, ctx).await?;
    let mut errors = snapshot.errors;
    let kind = match timed_out {
        Some(missing) => {
            if !errors.iter().any(|e| e.name == ErrorKind::Timeout.name()) {
                errors.push(make_timeout_error(
                    job,
                    missing,
                    TimeoutKind::StalledChunks,
                    &ctx.log_locator,
                ));
            }
            WebhookKind::Timeout
        }
        None => WebhookKind::Error,
    };

    notify(
        services,
        job,
        webhook,
        Notification {
            kind,
            output_url: None,
            time_to_finish: None,
            errors,
            costs: snapshot.costs,
        },
    )
    .await;

    Ok(LaunchResponse {
        tag: SuccessTag::Success,
        render_id: job.render_id.clone(),
        output_file: None,
        fatal_error_encountered: true,
    })
}

/// Invoke a renderer for every chunk with bounded concurrency, wait for their
/// records, combine the outputs and write the post-render record.
pub async fn launch(
    services: &Arc<ServiceContainer>,
    ctx: &ExecutionContext,
    payload: LaunchPayload,
    scratch_dir: &Path,
) -> Result<LaunchResponse> {
    let store = services.progress_store(&payload.bucket_name, &payload.render_id);
    let interval = services.config.chunk_poll_interval();
    let job = until_visible(interval, || store.read_job())
        .await?
        .ok_or_else(|| Error::not_found("render", &payload.render_id))?;
    if job.job_type == JobType::Still {
        return Err(Error::validation("Still renders are not launched"));
    }

    let function_launched = ctx.now_ms();
    store.write_launch(&LaunchRecord { function_launched }).await?;

    let chunk_payloads = chunk_payloads(&job, ctx, payload.log_level)?;
    let token = services.cancellation_token().child_token();
    let pool = FanOutPool::new("launch", services.config.launch_concurrency);
    let pending = Arc::new(AtomicUsize::new(chunk_payloads.len()));

    info!(
        render_id = %job.render_id,
        chunks = job.total_chunks,
        concurrency = services.config.launch_concurrency,
        "Launching chunk renders"
    );
    for chunk_payload in chunk_payloads {
        let chunk = chunk_payload.chunk;
        let guard = PendingGuard(pending.clone());
        let task = run_chunk(
            services.clone(),
            store.clone(),
            job.renderer_function_name.clone(),
            chunk_payload,
            token.clone(),
        );
        let submitted = pool.submit(async move {
            let _guard = guard;
            task.await;
        });
        if !submitted {
            let err = Error::Other(format!("Chunk {chunk} could not be submitted for invocation"));
            let record = error_record(&err, ErrorSource::Launch, Some(chunk), None, 1, 1, ctx.now_ms());
            store.write_error(&record).await?;
        }
    }

    let outcome = wait_for_chunks(services, &store, &job, &pending, &token).await;
    if !matches!(outcome, Ok(Outcome::Rendered(_))) {
        pool.cancel();
        token.cancel();
    }
    pool.join().await;

    let chunks = match outcome? {
        Outcome::Rendered(chunks) => chunks,
        Outcome::Fatal => {
            warn!(render_id = %job.render_id, "Render hit a fatal error");
            return fail_render(services, ctx, &store, &job, payload.webhook.as_ref(), None).await;
        }
        Outcome::TimedOut(missing) => {
            warn!(render_id = %job.render_id, missing = ?missing, "Render timed out waiting for chunks");
            return fail_render(services, ctx, &store, &job, payload.webhook.as_ref(), Some(&missing))
                .await;
        }
        Outcome::Incomplete(missing) => {
            warn!(render_id = %job.render_id, missing = ?missing, "Chunk invocations ended without results");
            let err = Error::render(format!(
                "Chunks {missing:?} were invoked but never reported a result"
            ));
            let record = error_record(&err, ErrorSource::Launch, None, None, 1, 1, ctx.now_ms());
            store.write_error(&record).await?;
            return fail_render(services, ctx, &store, &job, payload.webhook.as_ref(), None).await;
        }
    };

    let combined = match combine(services, &store, &job, &chunks, scratch_dir).await {
        Ok(combined) => combined,
        Err(e) => {
            error!(render_id = %job.render_id, error = %e, "Combining chunks failed");
            let record = error_record(&e, ErrorSource::Stitcher, None, None, 1, 1, ctx.now_ms());
            store.write_error(&record).await?;
            return fail_render(services, ctx, &store, &job, payload.webhook.as_ref(), None).await;
        }
    };

    let post = post_render_data(ctx, &store, &job, &chunks, function_launched, combined).await?;
    store.write_post_render(&post).await?;
    info!(
        render_id = %job.render_id,
        output = %post.output_file,
        size = post.output_size,
        time_to_finish = post.time_to_finish,
        cost = %post.cost.display_cost,
        "Render finished"
    );

    notify(
        services,
        &job,
        payload.webhook.as_ref(),
        Notification {
            kind: WebhookKind::Success,
            output_url: Some(post.output_file.clone()),
            time_to_finish: Some(post.time_to_finish),
            errors: post.errors.clone(),
            costs: post.cost.clone(),
        },
    )
    .await;

    Ok(LaunchResponse {
        tag: SuccessTag::Success,
        render_id: job.render_id,
        output_file: Some(post.output_file),
        fatal_error_encountered: false,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::config::AppConfig;
    use crate::store::MemoryStore;
    use crate::testing::{chunk_record, job_record};
    use crate::transport::{MockInvoker, TransportRetry};
    use shard_protocol::{ChunkStatus, FrameRange, StreamingMessage};

    fn error_message(should_retry: bool) -> StreamingMessage {
        let info = EnhancedErrorInfo {
            attempt: 1,
            total_attempts: 2,
            chunk: Some(0),
            frame: None,
            is_fatal: !should_retry,
            will_retry: should_retry,
            error_type: "renderer".to_string(),
            name: "FlakyInfraError".to_string(),
            message: "Target closed".to_string(),
            stack: String::new(),
            explanation: None,
        };
        StreamingMessage::new(StreamingPayload::ErrorOccurred {
            error: "Target closed".to_string(),
            should_retry,
            error_info: info,
        })
    }

    #[tokio::test]
    async fn test_chunk_is_reinvoked_after_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut invoker = MockInvoker::new();
        invoker
            .expect_invoke_streaming()
            .returning(move |_, body, sink| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(payload["attempt"], attempt);
                let message = if attempt == 1 {
                    error_message(true)
                } else {
                    StreamingMessage::new(StreamingPayload::ChunkRendered(chunk_record(
                        0,
                        FrameRange(0, 9),
                        ChunkStatus::Done,
                    )))
                };
                sink.try_send(message).unwrap();
                Ok(())
            });

        let services = Arc::new(
            ServiceContainer::new(
                AppConfig::default(),
                Arc::new(MemoryStore::new()),
                Arc::new(invoker),
            )
            .with_retry(TransportRetry::none()),
        );
        let store = services.progress_store("bucket", "abc");
        let ctx = ExecutionContext::new(&services.config, services.clock.clone(), false);
        let job = job_record("abc", 1, FrameRange(0, 9));
        let payload = chunk_payloads(&job, &ctx, LogLevel::Info)
            .unwrap()
            .remove(0);

        run_chunk(
            services.clone(),
            store.clone(),
            "fn".to_string(),
            payload,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let retries = store.read_retries().await.unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_fatal_chunk_error_is_not_retried() {
        let mut invoker = MockInvoker::new();
        invoker
            .expect_invoke_streaming()
            .times(1)
            .returning(|_, _, sink| {
                sink.try_send(error_message(false)).unwrap();
                Ok(())
            });
        let services = Arc::new(
            ServiceContainer::new(
                AppConfig::default(),
                Arc::new(MemoryStore::new()),
                Arc::new(invoker),
            )
            .with_retry(TransportRetry::none()),
        );
        let store = services.progress_store("bucket", "abc");
        let ctx = ExecutionContext::new(&services.config, services.clock.clone(), false);
        let job = job_record("abc", 1, FrameRange(0, 9));
        let payload = chunk_payloads(&job, &ctx, LogLevel::Info)
            .unwrap()
            .remove(0);

        run_chunk(services, store.clone(), "fn".to_string(), payload, CancellationToken::new()).await;
        assert!(store.read_retries().await.unwrap().is_empty());
    }

    #[test]
    fn test_chunk_payloads_follow_plan() {
        let config = AppConfig::default();
        let ctx = ExecutionContext::new(
            &config,
            Arc::new(crate::context::ManualClock::new(0)),
            false,
        );
        let job = job_record("abc", 4, FrameRange(0, 99));
        let payloads = chunk_payloads(&job, &ctx, LogLevel::Verbose).unwrap();
        assert_eq!(payloads.len(), 4);
        assert_eq!(payloads[1].frame_range, FrameRange(25, 49));
        assert_eq!(payloads[3].frame_range, FrameRange(75, 99));
        assert!(payloads.iter().all(|p| p.attempt == 1 && p.log_level == LogLevel::Verbose));

        let mut mismatched = job.clone();
        mismatched.total_chunks = 5;
        assert!(chunk_payloads(&mismatched, &ctx, LogLevel::Info).is_err());
    }

    #[tokio::test]
    async fn test_post_render_data_separates_frame_and_chunk_times() {
        let config = AppConfig::default();
        let ctx = ExecutionContext::new(
            &config,
            Arc::new(crate::context::ManualClock::new(5_000)),
            false,
        );
        let store = ProgressStore::new(Arc::new(MemoryStore::new()), "bucket", "abc");
        let job = job_record("abc", 2, FrameRange(0, 19));
        let first = chunk_record(0, FrameRange(0, 9), ChunkStatus::Done);
        let mut second = chunk_record(1, FrameRange(10, 19), ChunkStatus::Done);
        second.timings.rendered = Some(2_500);
        second.timings.encoded = Some(4_000);

        let combined = Combined {
            location: OutputLocation {
                bucket: "bucket".to_string(),
                key: "renders/abc/out.mp4".to_string(),
            },
            url: "mem://bucket/renders/abc/out.mp4".to_string(),
            output_size: 20,
            time_to_combine: 500,
        };
        let post = post_render_data(&ctx, &store, &job, &[first, second], 0, combined)
            .await
            .unwrap();
        assert_eq!(post.time_to_render_frames, Some(2_500));
        assert_eq!(post.time_to_render_chunks, 4_000);
        assert_eq!(post.time_to_finish, 5_000);
    }
}
