use shard_protocol::InfoResponse;

use crate::context::ExecutionContext;

pub fn info(ctx: &ExecutionContext) -> InfoResponse {
    InfoResponse::new(ctx.version.clone())
}
