use std::sync::Arc;

use shard_protocol::{JobType, RenderProgress, StatusPayload};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::progress::aggregate;
use crate::services::ServiceContainer;
use crate::{Error, Result};

/// Progress snapshot of a video render.
pub async fn status(
    services: &Arc<ServiceContainer>,
    ctx: &ExecutionContext,
    payload: StatusPayload,
) -> Result<RenderProgress> {
    let store = services.progress_store(&payload.bucket_name, &payload.render_id);
    if let Some(job) = store.read_job().await?
        && job.job_type == JobType::Still
    {
        return Err(Error::validation(format!(
            "Render {} is a still; its result was returned when it was rendered",
            payload.render_id
        )));
    }

    let progress = aggregate(&store, ctx).await?;
    debug!(
        render_id = %payload.render_id,
        overall = progress.overall_progress,
        done = progress.done,
        missing = progress.missing_chunks.len(),
        "Status computed"
    );
    Ok(progress)
}
