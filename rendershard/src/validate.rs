//! Input validation shared by the `start` and `still` routines.

use shard_protocol::{Codec, WebhookOption};
use url::Url;

use crate::{Error, Result};

/// Largest serialized `customData` a webhook may carry.
pub const MAX_WEBHOOK_CUSTOM_DATA_SIZE: usize = 1024;

pub fn validate_serve_url(serve_url: &str) -> Result<Url> {
    if serve_url.trim().is_empty() {
        return Err(Error::validation("serveUrl must not be empty"));
    }
    let url = Url::parse(serve_url)
        .map_err(|e| Error::validation(format!("serveUrl \"{serve_url}\" is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" | "file" => Ok(url),
        other => Err(Error::validation(format!(
            "serveUrl must use http, https or file, got \"{other}\""
        ))),
    }
}

pub fn validate_every_nth_frame(every_nth_frame: u32, codec: Codec) -> Result<()> {
    if every_nth_frame == 0 {
        return Err(Error::validation("everyNthFrame must be at least 1"));
    }
    if every_nth_frame > 1 && !codec.supports_frame_skipping() {
        return Err(Error::validation(format!(
            "everyNthFrame can only be used with the gif codec, got {codec}"
        )));
    }
    Ok(())
}

pub fn validate_webhook(webhook: Option<&WebhookOption>) -> Result<()> {
    let Some(webhook) = webhook else {
        return Ok(());
    };
    let url = Url::parse(&webhook.url).map_err(|e| {
        Error::validation(format!("webhook.url \"{}\" is not a valid URL: {e}", webhook.url))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation("webhook.url must use http or https"));
    }
    if let Some(custom_data) = &webhook.custom_data {
        let size = serde_json::to_vec(custom_data)?.len();
        if size > MAX_WEBHOOK_CUSTOM_DATA_SIZE {
            return Err(Error::validation(format!(
                "webhook.customData must be at most {MAX_WEBHOOK_CUSTOM_DATA_SIZE} bytes when serialized, got {size}"
            )));
        }
    }
    Ok(())
}

pub fn validate_scale(scale: f64) -> Result<()> {
    if !scale.is_finite() || scale <= 0.0 || scale > 16.0 {
        return Err(Error::validation(format!(
            "scale must be a number above 0 and at most 16, got {scale}"
        )));
    }
    Ok(())
}

pub fn validate_dimension(name: &str, value: Option<u32>) -> Result<()> {
    match value {
        Some(0) => Err(Error::validation(format!("{name} must be positive"))),
        _ => Ok(()),
    }
}

pub fn validate_timeout(timeout_in_milliseconds: u64) -> Result<()> {
    if timeout_in_milliseconds < 1_000 {
        return Err(Error::validation(format!(
            "timeoutInMilliseconds must be at least 1000, got {timeout_in_milliseconds}"
        )));
    }
    Ok(())
}

pub fn validate_concurrency_per_lambda(concurrency: Option<u32>) -> Result<()> {
    match concurrency {
        Some(0) => Err(Error::validation("concurrencyPerLambda must be at least 1")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_serve_url() {
        assert!(validate_serve_url("https://example.com/bundle").is_ok());
        assert!(validate_serve_url("file:///tmp/site/index.html").is_ok());
        assert!(validate_serve_url("").is_err());
        assert!(validate_serve_url("not a url").is_err());
        assert!(validate_serve_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_every_nth_frame_only_for_gif() {
        assert!(validate_every_nth_frame(1, Codec::H264).is_ok());
        assert!(validate_every_nth_frame(3, Codec::Gif).is_ok());
        assert!(validate_every_nth_frame(2, Codec::H264).is_err());
        assert!(validate_every_nth_frame(0, Codec::Gif).is_err());
    }

    #[test]
    fn test_webhook_custom_data_limit() {
        let mut webhook = WebhookOption {
            url: "https://hooks.example.com/render".to_string(),
            secret: None,
            custom_data: Some(json!({"project": "intro"})),
        };
        assert!(validate_webhook(Some(&webhook)).is_ok());

        webhook.custom_data = Some(json!({"blob": "x".repeat(1100)}));
        let err = validate_webhook(Some(&webhook)).unwrap_err();
        assert!(err.to_string().contains("1024"));

        webhook.custom_data = None;
        webhook.url = "mailto:someone@example.com".to_string();
        assert!(validate_webhook(Some(&webhook)).is_err());
    }

    #[test]
    fn test_numeric_bounds() {
        assert!(validate_scale(1.0).is_ok());
        assert!(validate_scale(0.0).is_err());
        assert!(validate_scale(f64::NAN).is_err());
        assert!(validate_dimension("forceWidth", Some(0)).is_err());
        assert!(validate_timeout(999).is_err());
        assert!(validate_concurrency_per_lambda(Some(0)).is_err());
        assert!(validate_concurrency_per_lambda(None).is_ok());
    }
}
