//! Entry point of every invocation.
//!
//! The dispatcher decodes the request, checks its version and routes it to
//! one routine. Request/response routines answer with a JSON body; streaming
//! routines answer with frames. A failure before streaming started becomes a
//! JSON error envelope, a failure after it a terminal error frame.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use shard_protocol::{ErrorEnvelope, ErrorSource, RoutinePayload, StreamingPayload, decode_payload};
use tokio::io::AsyncWrite;
use tracing::{Instrument, error, info_span, warn};

use crate::classify::{enhance, error_record};
use crate::context::ExecutionContext;
use crate::routines;
use crate::services::ServiceContainer;
use crate::stream::ResponseStream;
use crate::{Error, Result};

pub struct Dispatcher {
    services: Arc<ServiceContainer>,
    warm: AtomicBool,
}

/// What a failed routine should be reported as.
struct Attribution {
    source: ErrorSource,
    chunk: Option<u32>,
    attempt: u32,
    total_attempts: u32,
}

impl Attribution {
    fn of(payload: &RoutinePayload) -> Self {
        match payload {
            RoutinePayload::Renderer(p) => Self {
                source: ErrorSource::Renderer,
                chunk: Some(p.chunk),
                attempt: p.attempt,
                total_attempts: p.max_retries.saturating_add(1),
            },
            RoutinePayload::Still(p) => Self {
                source: ErrorSource::Still,
                chunk: None,
                attempt: p.attempt,
                total_attempts: p.max_retries.saturating_add(1),
            },
            _ => Self {
                source: ErrorSource::Launch,
                chunk: None,
                attempt: 1,
                total_attempts: 1,
            },
        }
    }
}

fn json<T: Serialize>(value: &T) -> Result<Option<Vec<u8>>> {
    Ok(Some(serde_json::to_vec(value)?))
}

impl Dispatcher {
    pub fn new(services: Arc<ServiceContainer>) -> Self {
        Self {
            services,
            warm: AtomicBool::new(false),
        }
    }

    pub fn services(&self) -> &Arc<ServiceContainer> {
        &self.services
    }

    /// Whether invocations of `function_name` land on this dispatcher.
    pub fn serves(&self, function_name: &str) -> bool {
        let config = &self.services.config;
        function_name == config.function_name || function_name == config.renderer_function_name()
    }

    /// Handle one invocation and write its response to `writer`.
    ///
    /// Never fails: every error is turned into a response.
    pub async fn dispatch<W>(&self, payload: Bytes, writer: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let is_warm = self.warm.swap(true, Ordering::SeqCst);
        let ctx = ExecutionContext::new(&self.services.config, self.services.clock.clone(), is_warm);
        let response = ResponseStream::new(writer);

        let request = match decode_payload(&payload, &ctx.version) {
            Ok(request) => request,
            Err(e) => {
                let err = Error::from(e);
                warn!(error = %err, "Rejected invocation");
                self.reply_error(&response, &err).await;
                response.end().await;
                return;
            }
        };

        let routine = request.routine();
        let span = info_span!(
            "routine",
            routine = routine.as_str(),
            render_id = request.render_id().unwrap_or_default(),
            chunk = request.chunk(),
            request_id = %ctx.request_id,
            is_warm,
        );
        let attribution = Attribution::of(&request);

        async {
            let result = match tempfile::Builder::new().prefix("rendershard-").tempdir() {
                Ok(scratch) => AssertUnwindSafe(self.run(&ctx, request, scratch.path(), &response))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(Error::Other(format!("The {} routine panicked", routine.as_str())))),
                Err(e) => Err(Error::from(e)),
            };

            match result {
                Ok(Some(body)) => {
                    if let Err(e) = response.reply(&body).await {
                        warn!(error = %e, "Failed to write response");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "Routine failed");
                    if response.is_streaming() {
                        self.stream_error(&ctx, &response, &err, &attribution).await;
                    } else {
                        self.reply_error(&response, &err).await;
                    }
                }
            }
            response.end().await;
        }
        .instrument(span)
        .await;
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        request: RoutinePayload,
        scratch_dir: &Path,
        response: &ResponseStream,
    ) -> Result<Option<Vec<u8>>> {
        let services = &self.services;
        match request {
            RoutinePayload::Start(payload) => json(&routines::start(services, ctx, payload).await?),
            RoutinePayload::Launch(payload) => {
                json(&routines::launch(services, ctx, payload, scratch_dir).await?)
            }
            RoutinePayload::Status(payload) => json(&routines::status(services, ctx, payload).await?),
            RoutinePayload::Info(_) => json(&routines::info(ctx)),
            RoutinePayload::Compositions(payload) => {
                json(&routines::compositions(services, payload).await?)
            }
            RoutinePayload::Renderer(payload) => {
                routines::render_chunk(services, ctx, payload, scratch_dir, response).await?;
                Ok(None)
            }
            RoutinePayload::Still(payload) => {
                routines::render_still(services, ctx, payload, scratch_dir, response).await?;
                Ok(None)
            }
        }
    }

    async fn reply_error(&self, response: &ResponseStream, err: &Error) {
        let envelope = ErrorEnvelope::new(err.to_string(), err.stack());
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode error envelope");
                return;
            }
        };
        if let Err(e) = response.reply(&body).await {
            warn!(error = %e, "Failed to write error response");
        }
    }

    async fn stream_error(
        &self,
        ctx: &ExecutionContext,
        response: &ResponseStream,
        err: &Error,
        attribution: &Attribution,
    ) {
        let record = error_record(
            err,
            attribution.source,
            attribution.chunk,
            None,
            attribution.attempt,
            attribution.total_attempts,
            ctx.now_ms(),
        );
        let error_info = enhance(&record);
        let message = StreamingPayload::ErrorOccurred {
            error: record.message,
            should_retry: error_info.will_retry,
            error_info,
        };
        if let Err(e) = response.send(message).await {
            warn!(error = %e, "Failed to stream error");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("services", &self.services)
            .field("warm", &self.warm.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use shard_protocol::{InfoResponse, OrError, StreamFrameCodec, VERSION};
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::config::AppConfig;
    use crate::store::MemoryStore;
    use crate::transport::MockInvoker;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(ServiceContainer::new(
            AppConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MockInvoker::new()),
        )))
    }

    async fn call(dispatcher: &Dispatcher, body: serde_json::Value) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        dispatcher
            .dispatch(Bytes::from(serde_json::to_vec(&body).unwrap()), server)
            .await;
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_info_reports_version() {
        let body = call(&dispatcher(), serde_json::json!({"type": "info"})).await;
        let info: InfoResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(info.version, VERSION);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_an_error_envelope() {
        let body = call(
            &dispatcher(),
            serde_json::json!({"type": "status", "version": "0.0.1", "renderId": "abc", "bucketName": "b"}),
        )
        .await;
        let parsed: OrError<InfoResponse> = serde_json::from_str(&body).unwrap();
        let envelope = parsed.into_result().unwrap_err();
        assert!(envelope.message.contains("0.0.1"));
        assert!(envelope.message.contains(VERSION));
    }

    #[tokio::test]
    async fn test_unknown_routine_is_rejected() {
        let body = call(&dispatcher(), serde_json::json!({"type": "reboot", "version": VERSION})).await;
        let envelope: ErrorEnvelope = serde_json::from_str(&body).unwrap();
        assert!(!envelope.message.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_validation_error_before_streaming_is_an_envelope() {
        let body = call(
            &dispatcher(),
            serde_json::json!({
                "type": "still",
                "version": VERSION,
                "serveUrl": "not a url",
                "composition": "main"
            }),
        )
        .await;
        let envelope: ErrorEnvelope = serde_json::from_str(&body).unwrap();
        assert!(envelope.message.contains("serveUrl") || envelope.message.contains("URL"));
    }

    #[tokio::test]
    async fn test_still_streams_frames() {
        let dispatcher = dispatcher();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let body = serde_json::json!({
            "type": "still",
            "version": VERSION,
            "serveUrl": "https://example.com/site",
            "composition": "teaser",
            "imageFormat": "png"
        });
        dispatcher
            .dispatch(Bytes::from(serde_json::to_vec(&body).unwrap()), server)
            .await;
        let messages: Vec<_> = FramedRead::new(client, StreamFrameCodec)
            .map(|frame| frame.unwrap().decode_message().unwrap())
            .collect()
            .await;
        assert!(matches!(
            messages.first().map(|m| &m.message),
            Some(StreamingPayload::RenderIdDetermined { .. })
        ));
        assert!(matches!(
            messages.last().map(|m| &m.message),
            Some(StreamingPayload::StillRendered(_))
        ));
    }

    #[test]
    fn test_serves_both_functions() {
        let dispatcher = dispatcher();
        assert!(dispatcher.serves(&dispatcher.services().config.function_name));
        assert!(dispatcher.serves(dispatcher.services().config.renderer_function_name()));
        assert!(!dispatcher.serves("someone-else"));
    }
}
