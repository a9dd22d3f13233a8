//! The routines a worker can execute, one module per routine.

mod compositions;
mod info;
mod launch;
mod renderer;
mod start;
mod status;
mod still;

pub use compositions::compositions;
pub use info::info;
pub use launch::launch;
pub use renderer::render_chunk;
pub use start::start;
pub use status::status;
pub use still::render_still;

use bytes::Bytes;
use shard_protocol::{ReceivedArtifact, StreamingPayload};
use tracing::{debug, warn};

use crate::artifacts::ArtifactCollector;
use crate::store::ProgressStore;
use crate::stream::ResponseStream;

/// Forwards what a renderer reports to storage and the response stream.
///
/// Artifacts are stored and announced once per filename. Failures are logged
/// and never interrupt the render.
pub(crate) struct EventRelay<'a> {
    store: &'a ProgressStore,
    response: &'a ResponseStream,
    artifacts: ArtifactCollector,
}

impl<'a> EventRelay<'a> {
    pub(crate) fn new(store: &'a ProgressStore, response: &'a ResponseStream) -> Self {
        Self {
            store,
            response,
            artifacts: ArtifactCollector::new(),
        }
    }

    pub(crate) async fn frames(&self, rendered: u32, encoded: u32) {
        let message = StreamingPayload::FramesRendered { rendered, encoded };
        if let Err(e) = self.response.send(message).await {
            debug!(error = %e, "Caller no longer reads progress");
        }
    }

    pub(crate) async fn artifact(&mut self, filename: String, content: Bytes) {
        if self.artifacts.contains(&filename) {
            debug!(filename = %filename, "Ignoring repeated artifact");
            return;
        }
        let received = match self.store.write_artifact(&filename, content).await {
            Ok(received) => received,
            Err(e) => {
                warn!(filename = %filename, error = %e, "Failed to store artifact");
                return;
            }
        };
        self.artifacts.insert(received.clone());
        if let Err(e) = self
            .response
            .send(StreamingPayload::ArtifactEmitted(received))
            .await
        {
            debug!(error = %e, "Caller no longer reads artifacts");
        }
    }

    pub(crate) fn into_artifacts(self) -> Vec<ReceivedArtifact> {
        self.artifacts.into_vec()
    }
}
