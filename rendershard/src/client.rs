//! Caller-side API: start renders, poll their progress, render stills.

use std::sync::Arc;
use std::time::Duration;

use shard_protocol::{
    CompositionInfo, CompositionsPayload, CompositionsResponse, InfoPayload, InfoResponse,
    RenderProgress, RoutinePayload, StartPayload, StartResponse, StatusPayload, StillPayload,
    StillRenderedPayload, StreamingPayload, VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::{Invoker, TransportRetry, call_routine, stream_routine};
use crate::{Error, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Invokes the main function on behalf of a caller.
pub struct RenderClient {
    invoker: Arc<dyn Invoker>,
    function_name: String,
    retry: TransportRetry,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
}

impl RenderClient {
    pub fn new(invoker: Arc<dyn Invoker>, function_name: impl Into<String>) -> Self {
        Self {
            invoker,
            function_name: function_name.into(),
            retry: TransportRetry::none(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: TransportRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Token that aborts polling and pending retries. Already dispatched
    /// work keeps running.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, payload: RoutinePayload) -> Result<T> {
        Ok(call_routine(
            self.invoker.as_ref(),
            &self.retry,
            &self.cancellation_token,
            &self.function_name,
            &payload,
        )
        .await?)
    }

    pub async fn start(&self, mut payload: StartPayload) -> Result<StartResponse> {
        payload.version = VERSION.to_string();
        let response: StartResponse = self.call(RoutinePayload::Start(payload)).await?;
        info!(render_id = %response.render_id, bucket = %response.bucket_name, "Render started");
        Ok(response)
    }

    pub async fn status(&self, render_id: &str, bucket_name: &str) -> Result<RenderProgress> {
        self.call(RoutinePayload::Status(StatusPayload {
            version: VERSION.to_string(),
            render_id: render_id.to_string(),
            bucket_name: bucket_name.to_string(),
            log_level: Default::default(),
        }))
        .await
    }

    /// Poll until the render is done or hit a fatal error.
    pub async fn wait_for_render(&self, render_id: &str, bucket_name: &str) -> Result<RenderProgress> {
        loop {
            let progress = self.status(render_id, bucket_name).await?;
            if progress.done {
                return Ok(progress);
            }
            if progress.fatal_error_encountered {
                let message = progress
                    .errors
                    .iter()
                    .rev()
                    .find(|e| e.is_fatal)
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "Render failed".to_string());
                return Err(Error::render(message));
            }
            debug!(
                render_id,
                overall = progress.overall_progress,
                missing = progress.missing_chunks.len(),
                "Render in progress"
            );
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    return Err(Error::Other("Waiting for the render was cancelled".to_string()));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Render one frame and wait for its terminal message.
    pub async fn still(&self, mut payload: StillPayload) -> Result<StillRenderedPayload> {
        payload.version = VERSION.to_string();
        let messages = stream_routine(
            self.invoker.as_ref(),
            &self.retry,
            &self.cancellation_token,
            &self.function_name,
            &RoutinePayload::Still(payload),
        )
        .await?;

        let mut render_id = None;
        for message in messages {
            match message.message {
                StreamingPayload::RenderIdDetermined { render_id: id } => {
                    debug!(render_id = %id, "Still render id determined");
                    render_id = Some(id);
                }
                StreamingPayload::StillRendered(rendered) => return Ok(rendered),
                StreamingPayload::ErrorOccurred { error, .. } => return Err(Error::render(error)),
                _ => {}
            }
        }
        Err(Error::Other(format!(
            "Still render {} ended without a result",
            render_id.as_deref().unwrap_or("<unknown>")
        )))
    }

    pub async fn info(&self) -> Result<InfoResponse> {
        self.call(RoutinePayload::Info(InfoPayload {
            version: Some(VERSION.to_string()),
            log_level: Default::default(),
        }))
        .await
    }

    pub async fn compositions(
        &self,
        serve_url: &str,
        input_props: serde_json::Value,
    ) -> Result<Vec<CompositionInfo>> {
        let response: CompositionsResponse = self
            .call(RoutinePayload::Compositions(CompositionsPayload {
                version: VERSION.to_string(),
                serve_url: serve_url.to_string(),
                input_props,
                bucket_name: None,
                log_level: Default::default(),
            }))
            .await?;
        Ok(response.compositions)
    }
}

impl std::fmt::Debug for RenderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderClient")
            .field("function_name", &self.function_name)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
