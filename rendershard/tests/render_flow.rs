//! End-to-end tests of the orchestration running in process.
//!
//! Every invocation goes through a `LocalInvoker` into a real `Dispatcher`,
//! with an in-memory object store standing in for the bucket.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rendershard::client::RenderClient;
use rendershard::config::AppConfig;
use rendershard::dispatcher::Dispatcher;
use rendershard::engine::SyntheticRenderer;
use rendershard::services::ServiceContainer;
use rendershard::store::{MemoryStore, ObjectStore};
use rendershard::transport::{Invoker, LocalInvoker};
use shard_protocol::{ErrorEnvelope, StartPayload, StillPayload, VERSION};

const FUNCTION: &str = "rendershard-main";
const BUCKET: &str = "renders";

struct Harness {
    store: Arc<MemoryStore>,
    invoker: Arc<LocalInvoker>,
    client: RenderClient,
    _dispatcher: Arc<Dispatcher>,
}

fn harness(renderer: SyntheticRenderer) -> Harness {
    let config = AppConfig {
        chunk_poll_interval_ms: 10,
        progress_write_interval_ms: 0,
        launch_concurrency: 4,
        bucket_name: BUCKET.to_string(),
        ..AppConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let invoker = Arc::new(LocalInvoker::new(config.transport.stream_stall()));
    let services = ServiceContainer::new(config, store.clone(), invoker.clone())
        .with_renderer(Arc::new(renderer));
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(services)));
    invoker.bind(&dispatcher);

    let client = RenderClient::new(invoker.clone(), FUNCTION)
        .with_poll_interval(Duration::from_millis(10));
    Harness {
        store,
        invoker,
        client,
        _dispatcher: dispatcher,
    }
}

fn start_payload(composition: &str, frames_per_lambda: u32) -> StartPayload {
    serde_json::from_value(serde_json::json!({
        "version": VERSION,
        "serveUrl": "https://example.com/site",
        "composition": composition,
        "codec": "h264",
        "framesPerLambda": frames_per_lambda,
        "maxRetries": 1
    }))
    .unwrap()
}

#[tokio::test]
async fn test_render_completes_and_combines_chunks() {
    let h = harness(SyntheticRenderer::new().with_artifact("notes.txt", "hi"));
    let started = h.client.start(start_payload("main", 100)).await.unwrap();
    assert_eq!(started.bucket_name, BUCKET);
    h.invoker.drain().await;

    let progress = h
        .client
        .wait_for_render(&started.render_id, BUCKET)
        .await
        .unwrap();
    assert!(progress.done);
    assert_eq!(progress.chunks, 3);
    assert!(progress.missing_chunks.is_empty());
    assert_eq!(progress.frames_rendered, 300);
    assert_eq!(progress.overall_progress, 1.0);
    assert!(!progress.fatal_error_encountered);
    assert_eq!(progress.artifacts.len(), 1);

    let out_key = progress.out_key.clone().unwrap();
    assert!(out_key.ends_with(".mp4"));
    assert!(progress.output_file.is_some());
    let output = h.store.get(BUCKET, &out_key).await.unwrap().unwrap();
    let text = String::from_utf8(output.to_vec()).unwrap();
    assert_eq!(text.lines().count(), 300);
    assert!(text.lines().next().unwrap().contains("frame=0"));
    assert!(text.lines().last().unwrap().contains("frame=299"));
}

#[tokio::test]
async fn test_status_of_finished_render_is_stable() {
    let h = harness(SyntheticRenderer::new());
    let started = h.client.start(start_payload("teaser", 30)).await.unwrap();
    h.invoker.drain().await;

    let mut first = h.client.status(&started.render_id, BUCKET).await.unwrap();
    let second = h.client.status(&started.render_id, BUCKET).await.unwrap();
    assert!(first.done);
    first.current_time = second.current_time;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_flaky_chunk_is_retried() {
    let renderer = SyntheticRenderer::new();
    renderer.fail_chunk(1, 1, "Target closed");
    let h = harness(renderer);

    let started = h.client.start(start_payload("main", 100)).await.unwrap();
    h.invoker.drain().await;

    let progress = h
        .client
        .wait_for_render(&started.render_id, BUCKET)
        .await
        .unwrap();
    assert!(progress.done);
    assert_eq!(progress.retries_info.len(), 1);
    assert_eq!(progress.retries_info[0].chunk, 1);
    assert_eq!(progress.retries_info[0].attempt, 2);
    assert_eq!(progress.errors.len(), 1);
    assert!(progress.errors[0].will_retry);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_render() {
    let renderer = SyntheticRenderer::new();
    renderer.fail_chunk(0, 5, "Unexpected token in composition");
    let h = harness(renderer);

    let started = h.client.start(start_payload("main", 100)).await.unwrap();
    h.invoker.drain().await;

    let progress = h.client.status(&started.render_id, BUCKET).await.unwrap();
    assert!(!progress.done);
    assert!(progress.fatal_error_encountered);
    assert!(progress.missing_chunks.contains(&0));
    assert!(progress.errors.iter().any(|e| e.chunk == Some(0) && e.is_fatal));

    let err = h
        .client
        .wait_for_render(&started.render_id, BUCKET)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unexpected token"));
}

#[tokio::test]
async fn test_still_render() {
    let h = harness(SyntheticRenderer::new());
    let payload: StillPayload = serde_json::from_value(serde_json::json!({
        "version": VERSION,
        "serveUrl": "https://example.com/site",
        "composition": "main",
        "imageFormat": "png",
        "frame": 10
    }))
    .unwrap();

    let still = h.client.still(payload).await.unwrap();
    assert_eq!(still.bucket_name, BUCKET);
    let image = h.store.get(BUCKET, &still.out_key).await.unwrap().unwrap();
    assert_eq!(image.len() as u64, still.size_in_bytes);
    assert!(String::from_utf8_lossy(&image).contains("frame=10"));
}

#[tokio::test]
async fn test_version_mismatch_is_rejected() {
    let h = harness(SyntheticRenderer::new());
    let body = serde_json::json!({
        "type": "status",
        "version": "0.0.0-old",
        "renderId": "abc",
        "bucketName": BUCKET
    });
    let response = h
        .invoker
        .invoke(FUNCTION, Bytes::from(serde_json::to_vec(&body).unwrap()))
        .await
        .unwrap();
    let envelope: ErrorEnvelope = serde_json::from_slice(&response).unwrap();
    assert!(envelope.message.starts_with("Version mismatch"));
    assert!(envelope.message.contains("0.0.0-old"));
}

#[tokio::test]
async fn test_invalid_start_is_rejected_without_records() {
    let h = harness(SyntheticRenderer::new());
    let mut payload = start_payload("main", 100);
    payload.every_nth_frame = 3;

    let err = h.client.start(payload).await.unwrap_err();
    assert!(err.to_string().contains("everyNthFrame"));
    assert!(h.store.list(BUCKET, "").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_compositions_and_info() {
    let h = harness(SyntheticRenderer::new());
    let compositions = h
        .client
        .compositions("https://example.com/site", serde_json::Value::Null)
        .await
        .unwrap();
    let ids: Vec<&str> = compositions.iter().map(|c| c.id.as_str()).collect();
    assert!(ids.contains(&"main"));
    assert!(ids.contains(&"teaser"));

    assert_eq!(h.client.info().await.unwrap().version, VERSION);
}
