//! Service container for the routines.
//!
//! The ServiceContainer holds the collaborators every routine may reach:
//! storage, the invocation transport, the media engine and webhook delivery.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::context::{Clock, SystemClock};
use crate::engine::{
    CompositionResolver, ConcatStitcher, FrameRenderer, StaticCompositions, Stitcher,
    SyntheticRenderer,
};
use crate::store::{ObjectStore, ProgressStore};
use crate::transport::{Invoker, TransportRetry};
use crate::webhook::WebhookClient;

pub struct ServiceContainer {
    pub config: AppConfig,
    /// Durable object store shared by every worker.
    pub store: Arc<dyn ObjectStore>,
    /// Transport used to reach other invocations.
    pub invoker: Arc<dyn Invoker>,
    pub renderer: Arc<dyn FrameRenderer>,
    pub stitcher: Arc<dyn Stitcher>,
    pub compositions: Arc<dyn CompositionResolver>,
    pub webhooks: WebhookClient,
    pub retry: TransportRetry,
    pub clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a container with the synthetic media engine and the system clock.
    pub fn new(config: AppConfig, store: Arc<dyn ObjectStore>, invoker: Arc<dyn Invoker>) -> Self {
        info!(
            function_name = %config.function_name,
            region = %config.region,
            "Initializing service container"
        );
        Self {
            webhooks: WebhookClient::new(&config.webhook),
            retry: TransportRetry::from_config(&config.transport),
            config,
            store,
            invoker,
            renderer: Arc::new(SyntheticRenderer::new()),
            stitcher: Arc::new(ConcatStitcher),
            compositions: Arc::new(StaticCompositions::default()),
            clock: Arc::new(SystemClock),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn FrameRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_stitcher(mut self, stitcher: Arc<dyn Stitcher>) -> Self {
        self.stitcher = stitcher;
        self
    }

    pub fn with_compositions(mut self, compositions: Arc<dyn CompositionResolver>) -> Self {
        self.compositions = compositions;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: TransportRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Accessor for the records of one render.
    pub fn progress_store(&self, bucket: &str, render_id: &str) -> ProgressStore {
        ProgressStore::new(self.store.clone(), bucket, render_id)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stop retry loops and fan-outs that are still waiting.
    pub fn shutdown(&self) {
        info!("Shutting down service container");
        self.cancellation_token.cancel();
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("function_name", &self.config.function_name)
            .field("cancelled", &self.cancellation_token.is_cancelled())
            .finish_non_exhaustive()
    }
}
