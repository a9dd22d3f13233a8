//! Engine-wide error types.

use std::fmt;

use shard_protocol::ProtocolError;
use thiserror::Error;

use crate::transport::TransportError;

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Render error: {0}")]
    Render(String),

    #[error("{0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure taxonomy shared by the classifier, the dispatcher and the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    VersionMismatch,
    Validation,
    FlakyInfra,
    RateLimit,
    Timeout,
    MalformedResponse,
    UnknownRoutine,
    Storage,
    Render,
    Internal,
}

impl ErrorKind {
    /// Name recorded in error records and shown to callers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::VersionMismatch => "VersionMismatchError",
            Self::Validation => "ValidationError",
            Self::FlakyInfra => "FlakyInfraError",
            Self::RateLimit => "RateLimitError",
            Self::Timeout => "TimeoutError",
            Self::MalformedResponse => "MalformedResponseError",
            Self::UnknownRoutine => "UnknownRoutineError",
            Self::Storage => "StorageError",
            Self::Render => "RenderError",
            Self::Internal => "InternalError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::VersionMismatch,
            Self::Validation,
            Self::FlakyInfra,
            Self::RateLimit,
            Self::Timeout,
            Self::MalformedResponse,
            Self::UnknownRoutine,
            Self::Storage,
            Self::Render,
            Self::Internal,
        ]
        .into_iter()
        .find(|kind| kind.name() == name)
    }

    /// Kinds that must never be retried automatically, whatever the attempt count.
    pub fn is_never_retried(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch
                | Self::Validation
                | Self::RateLimit
                | Self::Timeout
                | Self::UnknownRoutine
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn version_mismatch(
        routine: shard_protocol::Routine,
        expected: impl Into<String>,
        received: Option<String>,
    ) -> Self {
        Self::Protocol(ProtocolError::version_mismatch(routine, expected, received))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(ProtocolError::VersionMismatch { .. }) => ErrorKind::VersionMismatch,
            Self::Protocol(ProtocolError::UnknownRoutine(_) | ProtocolError::MissingRoutineType) => {
                ErrorKind::UnknownRoutine
            }
            Self::Protocol(ProtocolError::Malformed(_)) => ErrorKind::Validation,
            Self::Protocol(_) => ErrorKind::MalformedResponse,
            Self::Validation(_) | Self::NotFound { .. } => ErrorKind::Validation,
            Self::Storage(_) | Self::Io(_) => ErrorKind::Storage,
            Self::Transport(e) => e.kind(),
            Self::Render(msg) if crate::classify::is_flaky_error(msg) => ErrorKind::FlakyInfra,
            Self::Render(_) => ErrorKind::Render,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Configuration(_) | Self::Serialization(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Textual trace of this error and its sources, used where callers expect a stack.
    pub fn stack(&self) -> String {
        let mut out = format!("{}: {}", self.kind(), self);
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n    caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_protocol::Routine;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::version_mismatch(Routine::Status, "2.0.0", Some("1.0.0".into())).kind(),
            ErrorKind::VersionMismatch
        );
        assert_eq!(Error::validation("bad").kind(), ErrorKind::Validation);
        assert_eq!(
            Error::render("Protocol error: Target closed").kind(),
            ErrorKind::FlakyInfra
        );
        assert_eq!(Error::render("div by zero").kind(), ErrorKind::Render);
        assert_eq!(
            Error::Protocol(ProtocolError::UnknownRoutine("x".into())).kind(),
            ErrorKind::UnknownRoutine
        );
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [ErrorKind::RateLimit, ErrorKind::Timeout, ErrorKind::FlakyInfra] {
            assert_eq!(ErrorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("Error"), None);
    }

    #[test]
    fn test_stack_includes_kind() {
        let err = Error::validation("frame range out of bounds");
        assert!(err.stack().starts_with("ValidationError: Validation error:"));
    }
}
