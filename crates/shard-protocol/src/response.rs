//! Response bodies returned to callers of each routine.

use serde::{Deserialize, Serialize};

use crate::records::{JobRecord, RetryRecord};

/// Marker serialized as `"type": "success"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessTag {
    #[default]
    Success,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorTag {
    #[default]
    Error,
}

/// Structured failure returned in place of any routine response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub tag: ErrorTag,
    pub message: String,
    pub stack: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            tag: ErrorTag::Error,
            message: message.into(),
            stack: stack.into(),
        }
    }
}

/// Either a routine's response or the error envelope that replaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrError<T> {
    Error(ErrorEnvelope),
    Ok(T),
}

impl<T> OrError<T> {
    pub fn into_result(self) -> Result<T, ErrorEnvelope> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error(envelope) => Err(envelope),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    #[serde(rename = "type")]
    pub tag: SuccessTag,
    pub render_id: String,
    pub bucket_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    #[serde(rename = "type")]
    pub tag: SuccessTag,
    pub render_id: String,
    pub output_file: Option<String>,
    pub fatal_error_encountered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostsInfo {
    pub accrued_so_far: f64,
    pub display_cost: String,
    pub currency: String,
    pub disclaimer: String,
}

/// An error as presented to callers, after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedErrorInfo {
    pub attempt: u32,
    pub total_attempts: u32,
    pub chunk: Option<u32>,
    pub frame: Option<u32>,
    pub is_fatal: bool,
    pub will_retry: bool,
    #[serde(rename = "type")]
    pub error_type: String,
    pub name: String,
    pub message: String,
    pub stack: String,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingStatus {
    pub frames_encoded: u32,
    pub combined_frames: u32,
    pub time_to_combine: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedArtifact {
    pub filename: String,
    pub size_in_bytes: u64,
    pub url: String,
    pub storage_key: String,
}

/// Snapshot returned by the `status` routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderProgress {
    pub render_id: String,
    pub bucket_name: String,
    pub done: bool,
    pub overall_progress: f64,
    pub chunks: u32,
    pub missing_chunks: Vec<u32>,
    pub frames_rendered: u32,
    pub frames_encoded: u32,
    pub combined_frames: u32,
    pub lambdas_invoked: u32,
    pub errors: Vec<EnhancedErrorInfo>,
    pub fatal_error_encountered: bool,
    pub costs: CostsInfo,
    pub output_file: Option<String>,
    pub out_key: Option<String>,
    pub out_bucket: Option<String>,
    pub output_size_in_bytes: Option<u64>,
    pub render_size: u64,
    pub timeout_timestamp: Option<i64>,
    pub composition_validated: Option<i64>,
    pub function_launched: Option<i64>,
    pub serve_url_opened: Option<i64>,
    pub encoding_status: Option<EncodingStatus>,
    pub time_to_finish: Option<i64>,
    pub time_to_finish_chunks: Option<i64>,
    pub time_to_render_frames: Option<i64>,
    pub estimated_billing_duration_in_milliseconds: Option<i64>,
    pub current_time: i64,
    pub render_metadata: Option<JobRecord>,
    pub retries_info: Vec<RetryRecord>,
    pub artifacts: Vec<ReceivedArtifact>,
}

/// Terminal success message of the `still` routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StillRenderedPayload {
    pub output_url: String,
    pub out_key: String,
    pub size_in_bytes: u64,
    pub bucket_name: String,
    pub estimated_price: CostsInfo,
    pub render_id: String,
    pub received_artifacts: Vec<ReceivedArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    #[serde(rename = "type")]
    pub tag: SuccessTag,
    pub version: String,
}

impl InfoResponse {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            tag: SuccessTag::Success,
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionsResponse {
    #[serde(rename = "type")]
    pub tag: SuccessTag,
    pub compositions: Vec<crate::types::CompositionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_shape() {
        let envelope = ErrorEnvelope::new("boom", "at routine");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "error", "message": "boom", "stack": "at routine"})
        );
    }

    #[test]
    fn test_or_error_prefers_envelope() {
        let body = r#"{"type":"error","message":"nope","stack":""}"#;
        let parsed: OrError<InfoResponse> = serde_json::from_str(body).unwrap();
        assert!(parsed.into_result().is_err());

        let body = r#"{"type":"success","version":"1.2.3"}"#;
        let parsed: OrError<InfoResponse> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.into_result().unwrap().version, "1.2.3");
    }
}
