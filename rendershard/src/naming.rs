//! Render ids and storage locations of render outputs.

use std::sync::LazyLock;

use rand::RngExt;
use regex::Regex;
use shard_protocol::{Codec, DeleteAfter, OutName};

use crate::{Error, Result};

const RENDER_ID_LEN: usize = 10;
const RENDER_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static OUT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-zA-Z\-!_.*'()/:&$@=;+,?]+$").expect("out name pattern is valid")
});

/// Generate a fresh render id, prefixed with the lifecycle bucket if any.
pub fn random_render_id(delete_after: Option<DeleteAfter>) -> String {
    let mut rng = rand::rng();
    let id: String = (0..RENDER_ID_LEN)
        .map(|_| RENDER_ID_ALPHABET[rng.random_range(0..RENDER_ID_ALPHABET.len())] as char)
        .collect();
    match delete_after {
        Some(d) => format!("{}-{}", d.as_str(), id),
        None => id,
    }
}

pub fn parse_delete_after(value: Option<&str>) -> Result<Option<DeleteAfter>> {
    value
        .map(|v| v.parse::<DeleteAfter>().map_err(Error::validation))
        .transpose()
}

/// Prefix under which every record of a render is stored.
pub fn render_prefix(render_id: &str) -> String {
    format!("renders/{render_id}/")
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("outName must not be empty"));
    }
    if !OUT_NAME_RE.is_match(key) {
        return Err(Error::validation(format!(
            "The outName \"{key}\" contains characters that are not allowed. Only letters, digits and -!_.*'()/:&$@=;+,? may be used"
        )));
    }
    Ok(())
}

/// Validate a custom output name. `codec` is set for video renders.
pub fn validate_out_name(out_name: Option<&OutName>, codec: Option<Codec>) -> Result<()> {
    let Some(out_name) = out_name else {
        return Ok(());
    };
    if let OutName::Custom { bucket_name, .. } = out_name
        && bucket_name.trim().is_empty()
    {
        return Err(Error::validation("outName.bucketName must not be empty"));
    }
    validate_key(out_name.key())?;

    if let Some(codec) = codec {
        let ext = codec.file_extension();
        if !out_name.key().ends_with(&format!(".{ext}")) {
            return Err(Error::validation(format!(
                "The outName \"{}\" must end with \".{ext}\" when rendering with the {codec} codec",
                out_name.key()
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLocation {
    pub bucket: String,
    pub key: String,
}

/// Where the final output of a render is written.
pub fn expected_output(
    render_id: &str,
    bucket_name: &str,
    out_name: Option<&OutName>,
    extension: &str,
) -> OutputLocation {
    match out_name {
        None => OutputLocation {
            bucket: bucket_name.to_string(),
            key: format!("{}out.{extension}", render_prefix(render_id)),
        },
        Some(OutName::Plain(name)) => OutputLocation {
            bucket: bucket_name.to_string(),
            key: format!("{}{name}", render_prefix(render_id)),
        },
        Some(OutName::Custom { bucket_name, key }) => OutputLocation {
            bucket: bucket_name.clone(),
            key: key.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_render_id() {
        let id = random_render_id(None);
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(random_render_id(None), random_render_id(None));

        let id = random_render_id(Some(DeleteAfter::ThreeDays));
        assert!(id.starts_with("3-days-"));
        assert_eq!(id.len(), "3-days-".len() + 10);
    }

    #[test]
    fn test_parse_delete_after() {
        assert_eq!(parse_delete_after(None).unwrap(), None);
        assert_eq!(
            parse_delete_after(Some("30-days")).unwrap(),
            Some(DeleteAfter::ThirtyDays)
        );
        assert!(parse_delete_after(Some("forever")).is_err());
    }

    #[test]
    fn test_validate_out_name() {
        let ok = OutName::Plain("my-video.mp4".to_string());
        assert!(validate_out_name(Some(&ok), Some(Codec::H264)).is_ok());

        let wrong_ext = OutName::Plain("my-video.webm".to_string());
        assert!(validate_out_name(Some(&wrong_ext), Some(Codec::H264)).is_err());

        let bad_chars = OutName::Plain("my video.mp4".to_string());
        assert!(validate_out_name(Some(&bad_chars), Some(Codec::H264)).is_err());

        let still = OutName::Plain("frame.png".to_string());
        assert!(validate_out_name(Some(&still), None).is_ok());

        let empty_bucket = OutName::Custom {
            bucket_name: " ".to_string(),
            key: "a.mp4".to_string(),
        };
        assert!(validate_out_name(Some(&empty_bucket), Some(Codec::H264)).is_err());
    }

    #[test]
    fn test_expected_output() {
        let default = expected_output("abc", "bucket", None, "mp4");
        assert_eq!(default.key, "renders/abc/out.mp4");
        assert_eq!(default.bucket, "bucket");

        let plain = OutName::Plain("final.mp4".to_string());
        assert_eq!(
            expected_output("abc", "bucket", Some(&plain), "mp4").key,
            "renders/abc/final.mp4"
        );

        let custom = OutName::Custom {
            bucket_name: "other".to_string(),
            key: "exports/x.mp4".to_string(),
        };
        let location = expected_output("abc", "bucket", Some(&custom), "mp4");
        assert_eq!(location.bucket, "other");
        assert_eq!(location.key, "exports/x.mp4");
    }
}
