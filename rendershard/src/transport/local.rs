//! In-process invocation: every call runs the bound dispatcher on its own task
//! and talks to it through an in-memory byte pipe.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use shard_protocol::{ErrorEnvelope, StreamFrameCodec, StreamingMessage};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tracing::{debug, error};

use super::{Invoker, TransportError};
use crate::dispatcher::Dispatcher;

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct LocalInvoker {
    dispatcher: OnceLock<Weak<Dispatcher>>,
    stream_stall: Duration,
    limiter: Option<Arc<Semaphore>>,
    events: parking_lot::Mutex<JoinSet<()>>,
}

impl LocalInvoker {
    pub fn new(stream_stall: Duration) -> Self {
        Self {
            dispatcher: OnceLock::new(),
            stream_stall,
            limiter: None,
            events: parking_lot::Mutex::new(JoinSet::new()),
        }
    }

    /// Reject invocations as throttled while `max_concurrent` are running.
    pub fn with_concurrency_limit(mut self, max_concurrent: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max_concurrent)));
        self
    }

    /// Route every invocation to `dispatcher`. Only the first call has an effect.
    pub fn bind(&self, dispatcher: &Arc<Dispatcher>) {
        if self.dispatcher.set(Arc::downgrade(dispatcher)).is_err() {
            debug!("Local invoker already bound");
        }
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>, TransportError> {
        self.dispatcher
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unavailable("no dispatcher bound".to_string()))
    }

    fn permit(&self, function_name: &str) -> Result<Option<OwnedSemaphorePermit>, TransportError> {
        match &self.limiter {
            None => Ok(None),
            Some(limiter) => limiter
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| TransportError::Throttled {
                    function: function_name.to_string(),
                }),
        }
    }

    /// Start the routine and hand back the reading end of its response pipe.
    fn spawn_call(&self, function_name: &str, payload: Bytes) -> Result<DuplexStream, TransportError> {
        let dispatcher = self.dispatcher()?;
        if !dispatcher.serves(function_name) {
            return Err(TransportError::FunctionNotFound(function_name.to_string()));
        }
        let permit = self.permit(function_name)?;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            dispatcher.dispatch(payload, server).await;
            drop(permit);
        });
        Ok(client)
    }

    /// Wait for every fire-and-forget invocation, including ones they started.
    pub async fn drain(&self) {
        loop {
            let mut events = std::mem::take(&mut *self.events.lock());
            if events.is_empty() {
                return;
            }
            while let Some(result) = events.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Event invocation task failed");
                }
            }
        }
    }
}

fn pipe_error(function_name: &str, e: std::io::Error) -> TransportError {
    TransportError::Unavailable(format!("{function_name}: {e}"))
}

fn remote_from_envelope(function_name: &str, body: &[u8]) -> TransportError {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => TransportError::Remote {
            function: function_name.to_string(),
            message: envelope.message,
            stack: envelope.stack,
        },
        Err(e) => TransportError::malformed(function_name, e.to_string()),
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, function_name: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        let mut client = self.spawn_call(function_name, payload)?;
        let mut body = Vec::new();
        client
            .read_to_end(&mut body)
            .await
            .map_err(|e| pipe_error(function_name, e))?;
        Ok(Bytes::from(body))
    }

    async fn invoke_streaming(
        &self,
        function_name: &str,
        payload: Bytes,
        sink: mpsc::Sender<StreamingMessage>,
    ) -> Result<(), TransportError> {
        let stall = self.stream_stall;
        let stalled = || TransportError::StreamStalled {
            function: function_name.to_string(),
            after_ms: stall.as_millis() as u64,
        };

        let mut reader = BufReader::new(self.spawn_call(function_name, payload)?);
        let first = tokio::time::timeout(stall, reader.fill_buf())
            .await
            .map_err(|_| stalled())?
            .map_err(|e| pipe_error(function_name, e))?
            .first()
            .copied();
        match first {
            None => return Err(TransportError::malformed(function_name, "empty response")),
            // A routine that failed before streaming answers with a JSON envelope.
            Some(b'{') => {
                let mut body = Vec::new();
                reader
                    .read_to_end(&mut body)
                    .await
                    .map_err(|e| pipe_error(function_name, e))?;
                return Err(remote_from_envelope(function_name, &body));
            }
            Some(_) => {}
        }

        let mut frames = FramedRead::new(reader, StreamFrameCodec);
        loop {
            let next = tokio::time::timeout(stall, frames.next())
                .await
                .map_err(|_| stalled())?;
            let Some(frame) = next else {
                return Ok(());
            };
            let message = frame
                .and_then(|f| f.decode_message())
                .map_err(|e| TransportError::malformed(function_name, e.to_string()))?;
            if sink.send(message).await.is_err() {
                debug!(function = function_name, "Stream consumer went away");
                return Ok(());
            }
        }
    }

    async fn invoke_event(&self, function_name: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut client = self.spawn_call(function_name, payload)?;
        let function = function_name.to_string();
        self.events.lock().spawn(async move {
            let mut body = Vec::new();
            if let Err(e) = client.read_to_end(&mut body).await {
                debug!(function = %function, error = %e, "Event invocation pipe failed");
            }
        });
        Ok(())
    }
}
