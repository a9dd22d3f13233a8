use std::sync::Arc;

use shard_protocol::{CompositionsPayload, CompositionsResponse, SuccessTag};
use tracing::debug;

use crate::Result;
use crate::services::ServiceContainer;
use crate::validate::validate_serve_url;

/// List the compositions a bundle exposes.
pub async fn compositions(
    services: &Arc<ServiceContainer>,
    payload: CompositionsPayload,
) -> Result<CompositionsResponse> {
    validate_serve_url(&payload.serve_url)?;
    let compositions = services
        .compositions
        .list(&payload.serve_url, &payload.input_props)
        .await?;
    debug!(serve_url = %payload.serve_url, count = compositions.len(), "Compositions listed");
    Ok(CompositionsResponse {
        tag: SuccessTag::Success,
        compositions,
    })
}
