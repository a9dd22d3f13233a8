//! Storage key layout. Everything of a render lives under `renders/{id}/`.

use crate::naming::render_prefix;

pub fn job_key(render_id: &str) -> String {
    format!("{}job.json", render_prefix(render_id))
}

pub fn launch_key(render_id: &str) -> String {
    format!("{}launch.json", render_prefix(render_id))
}

pub fn chunks_prefix(render_id: &str) -> String {
    format!("{}chunks/", render_prefix(render_id))
}

pub fn chunk_key(render_id: &str, chunk: u32) -> String {
    format!("{}chunk-{chunk:08}.json", chunks_prefix(render_id))
}

pub fn chunk_media_key(render_id: &str, chunk: u32) -> String {
    format!("{}chunk-{chunk:08}.bin", chunks_prefix(render_id))
}

pub fn errors_prefix(render_id: &str) -> String {
    format!("{}errors/", render_prefix(render_id))
}

/// Error key of a chunk attempt. Failures reported by anything but the
/// renderer itself are prefixed with their `source`.
pub fn error_key(render_id: &str, source: &str, chunk: Option<u32>, attempt: u32) -> String {
    match chunk {
        Some(chunk) if source == "renderer" => {
            format!("{}chunk-{chunk}-attempt-{attempt}.json", errors_prefix(render_id))
        }
        Some(chunk) => format!(
            "{}{source}-chunk-{chunk}-attempt-{attempt}.json",
            errors_prefix(render_id)
        ),
        None => format!("{}{source}-attempt-{attempt}.json", errors_prefix(render_id)),
    }
}

pub fn retries_prefix(render_id: &str) -> String {
    format!("{}retries/", render_prefix(render_id))
}

pub fn retry_key(render_id: &str, chunk: u32, attempt: u32) -> String {
    format!("{}chunk-{chunk}-attempt-{attempt}.json", retries_prefix(render_id))
}

pub fn combine_key(render_id: &str) -> String {
    format!("{}combine.json", render_prefix(render_id))
}

pub fn post_render_key(render_id: &str) -> String {
    format!("{}post-render.json", render_prefix(render_id))
}

pub fn artifact_key(render_id: &str, filename: &str) -> String {
    format!("{}artifacts/{filename}", render_prefix(render_id))
}

/// Chunk index encoded in a chunk record key, if it is one.
pub fn parse_chunk_key(key: &str) -> Option<u32> {
    let name = key.rsplit('/').next()?;
    name.strip_prefix("chunk-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
