//! Function invocation.
//!
//! Routines reach other workers only through an [`Invoker`]: a plain
//! request/response call, an ordered framed stream, or a fire-and-forget event.

mod local;
pub mod retry;

pub use local::LocalInvoker;
pub use retry::TransportRetry;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use shard_protocol::{OrError, RoutinePayload, StreamingMessage, encode_payload};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::classify::{RATE_LIMIT_URL, is_flaky_error};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Invocations of {function} are being throttled")]
    Throttled { function: String },

    #[error(
        "Rate limit reached while invoking {function}. Lower the concurrency of your renders and try again. See: {RATE_LIMIT_URL}"
    )]
    RateLimited { function: String },

    #[error("Malformed response from {function}: {reason}")]
    MalformedResponse { function: String, reason: String },

    #[error("{function} sent no data within {after_ms}ms")]
    StreamStalled { function: String, after_ms: u64 },

    #[error("Function {0} does not exist")]
    FunctionNotFound(String),

    #[error("{message}")]
    Remote {
        function: String,
        message: String,
        stack: String,
    },

    #[error("Invocation transport unavailable: {0}")]
    Unavailable(String),

    #[error("Invocation cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Throttled { .. } | Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::MalformedResponse { .. } | Self::StreamStalled { .. } => {
                ErrorKind::MalformedResponse
            }
            Self::FunctionNotFound(_) => ErrorKind::Validation,
            Self::Remote { message, .. } if message.starts_with("Version mismatch") => {
                ErrorKind::VersionMismatch
            }
            Self::Remote { message, .. } if is_flaky_error(message) => ErrorKind::FlakyInfra,
            Self::Remote { .. } => ErrorKind::Render,
            Self::Unavailable(_) => ErrorKind::FlakyInfra,
            Self::Cancelled => ErrorKind::Internal,
        }
    }

    /// Whether the failure happened before or while reading the response,
    /// as opposed to a failure the remote routine reported.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedResponse { .. } | Self::StreamStalled { .. })
    }

    pub fn malformed(function: &str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}

/// Invocation transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invoke and wait for the full response body.
    async fn invoke(&self, function_name: &str, payload: Bytes) -> Result<Bytes, TransportError>;

    /// Invoke and forward every message of the framed response to `sink`, in order.
    async fn invoke_streaming(
        &self,
        function_name: &str,
        payload: Bytes,
        sink: mpsc::Sender<StreamingMessage>,
    ) -> Result<(), TransportError>;

    /// Invoke without waiting for the routine to run.
    async fn invoke_event(&self, function_name: &str, payload: Bytes) -> Result<(), TransportError>;
}

fn encode(function_name: &str, payload: &RoutinePayload) -> Result<Bytes, TransportError> {
    encode_payload(payload)
        .map(Bytes::from)
        .map_err(|e| TransportError::malformed(function_name, e.to_string()))
}

/// Invoke a request/response routine and decode its body.
///
/// Unparseable bodies are retried under the malformed budget; a structured
/// error envelope is returned as [`TransportError::Remote`] without retrying.
pub async fn call_routine<T: DeserializeOwned>(
    invoker: &dyn Invoker,
    retry: &TransportRetry,
    token: &CancellationToken,
    function_name: &str,
    payload: &RoutinePayload,
) -> Result<T, TransportError> {
    let body = encode(function_name, payload)?;
    retry
        .run(function_name, token, |_| {
            let body = body.clone();
            async move {
                let response = invoker.invoke(function_name, body).await?;
                let parsed: OrError<T> = serde_json::from_slice(&response)
                    .map_err(|e| TransportError::malformed(function_name, e.to_string()))?;
                parsed
                    .into_result()
                    .map_err(|envelope| TransportError::Remote {
                        function: function_name.to_string(),
                        message: envelope.message,
                        stack: envelope.stack,
                    })
            }
        })
        .await
}

/// Invoke a streaming routine and collect its messages.
///
/// An attempt that broke off before a terminal message is retried as a
/// malformed response; messages of abandoned attempts are discarded.
pub async fn stream_routine(
    invoker: &dyn Invoker,
    retry: &TransportRetry,
    token: &CancellationToken,
    function_name: &str,
    payload: &RoutinePayload,
) -> Result<Vec<StreamingMessage>, TransportError> {
    let body = encode(function_name, payload)?;
    retry
        .run(function_name, token, |_| {
            let body = body.clone();
            async move {
                let (tx, mut rx) = mpsc::channel(16);
                let collect = async {
                    let mut messages = Vec::new();
                    while let Some(message) = rx.recv().await {
                        messages.push(message);
                    }
                    messages
                };
                let (result, messages) =
                    tokio::join!(invoker.invoke_streaming(function_name, body, tx), collect);

                let terminated = messages.iter().any(|m| m.message.is_terminal());
                match result {
                    Ok(()) if terminated => Ok(messages),
                    Ok(()) => Err(TransportError::malformed(
                        function_name,
                        "stream ended without a terminal message",
                    )),
                    Err(_) if terminated => Ok(messages),
                    Err(e) => Err(e),
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::TransportConfig;
    use shard_protocol::{InfoPayload, InfoResponse, StreamingPayload};

    fn fast_retry() -> TransportRetry {
        TransportRetry::from_config(&TransportConfig {
            throttle_retries: 2,
            throttle_base_delay_ms: 1,
            malformed_retries: 2,
            malformed_delay_ms: 1,
            stream_stall_ms: 100,
        })
    }

    fn info() -> RoutinePayload {
        RoutinePayload::Info(InfoPayload::default())
    }

    #[tokio::test]
    async fn test_call_routine_decodes_success() {
        let mut invoker = MockInvoker::new();
        invoker
            .expect_invoke()
            .times(1)
            .returning(|_, _| Ok(Bytes::from_static(br#"{"type":"success","version":"9.9.9"}"#)));

        let response: InfoResponse = call_routine(
            &invoker,
            &fast_retry(),
            &CancellationToken::new(),
            "fn",
            &info(),
        )
        .await
        .unwrap();
        assert_eq!(response.version, "9.9.9");
    }

    #[tokio::test]
    async fn test_call_routine_retries_malformed_then_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut invoker = MockInvoker::new();
        invoker.expect_invoke().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"<html>bad gateway</html>"))
        });

        let err = call_routine::<InfoResponse>(
            &invoker,
            &fast_retry(),
            &CancellationToken::new(),
            "fn",
            &info(),
        )
        .await
        .unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_envelope_is_not_retried() {
        let mut invoker = MockInvoker::new();
        invoker.expect_invoke().times(1).returning(|_, _| {
            Ok(Bytes::from_static(
                br#"{"type":"error","message":"Version mismatch: nope","stack":"s"}"#,
            ))
        });

        let err = call_routine::<InfoResponse>(
            &invoker,
            &fast_retry(),
            &CancellationToken::new(),
            "fn",
            &info(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[tokio::test]
    async fn test_stream_routine_retries_unterminated_stream() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut invoker = MockInvoker::new();
        invoker
            .expect_invoke_streaming()
            .returning(move |_, _, sink| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                let message = if attempt == 0 {
                    StreamingPayload::FramesRendered { rendered: 1, encoded: 0 }
                } else {
                    StreamingPayload::RenderIdDetermined {
                        render_id: "abc".to_string(),
                    }
                };
                sink.try_send(StreamingMessage::new(message)).unwrap();
                if attempt == 0 {
                    Ok(())
                } else {
                    Err(TransportError::StreamStalled {
                        function: "fn".to_string(),
                        after_ms: 1,
                    })
                }
            });

        let err = stream_routine(
            &invoker,
            &fast_retry(),
            &CancellationToken::new(),
            "fn",
            &info(),
        )
        .await
        .unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_kinds() {
        let throttled = TransportError::Throttled {
            function: "fn".to_string(),
        };
        assert_eq!(throttled.kind(), ErrorKind::RateLimit);
        let remote = TransportError::Remote {
            function: "fn".to_string(),
            message: "Target closed".to_string(),
            stack: String::new(),
        };
        assert_eq!(remote.kind(), ErrorKind::FlakyInfra);
        let limited = TransportError::RateLimited {
            function: "fn".to_string(),
        };
        assert!(limited.to_string().contains(RATE_LIMIT_URL));
    }
}
