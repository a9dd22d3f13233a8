use thiserror::Error;

use crate::payload::Routine;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload does not carry a routine `type`")]
    MissingRoutineType,

    #[error("unknown routine `{0}`")]
    UnknownRoutine(String),

    #[error(
        "Version mismatch: the invoked function runs version {expected} but the {routine} request {}. Deploy a function with a matching version and call it again. See: {}",
        describe_received(.received),
        crate::UPGRADE_URL
    )]
    VersionMismatch {
        routine: Routine,
        expected: String,
        received: Option<String>,
    },

    #[error("stream frame does not start with the expected magic bytes")]
    BadMagic,

    #[error("stream frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown stream message type id {0}")]
    UnknownMessageType(u8),

    #[error("unknown stream status id {0}")]
    UnknownStatus(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_received(received: &Option<String>) -> String {
    match received {
        Some(v) => format!("was sent with version {v}"),
        None => "did not carry a version".to_string(),
    }
}

impl ProtocolError {
    pub fn version_mismatch(
        routine: Routine,
        expected: impl Into<String>,
        received: Option<String>,
    ) -> Self {
        Self::VersionMismatch {
            routine,
            expected: expected.into(),
            received,
        }
    }

    /// Whether the payload itself is defective and resending it cannot help.
    pub fn is_caller_defect(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_)
                | Self::MissingRoutineType
                | Self::UnknownRoutine(_)
                | Self::VersionMismatch { .. }
        )
    }
}
