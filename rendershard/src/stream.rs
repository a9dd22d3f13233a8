//! Ordered, acknowledged writer for the framed response stream.

use futures::SinkExt;
use shard_protocol::{StreamFrameCodec, StreamingMessage, StreamingPayload, make_stream_payload};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

use crate::{Error, Result};

type Ack = oneshot::Sender<Result<()>>;

/// Writes streaming messages in order, one at a time.
///
/// `write` resolves only after the frame was flushed to the underlying stream,
/// so no message is queued before the previous one was acknowledged. After
/// `end` further writes are dropped.
pub struct StreamWriter {
    tx: Mutex<Option<mpsc::Sender<(StreamingMessage, Ack)>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StreamWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(Self::run(FramedWrite::new(writer, StreamFrameCodec), rx));
        Self {
            tx: Mutex::new(Some(tx)),
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    async fn run<W>(
        mut sink: FramedWrite<W, StreamFrameCodec>,
        mut rx: mpsc::Receiver<(StreamingMessage, Ack)>,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        while let Some((message, ack)) = rx.recv().await {
            let result = match make_stream_payload(&message) {
                Ok(frame) => sink.send(frame).await.map_err(Error::from),
                Err(e) => Err(Error::from(e)),
            };
            // The writer may have given up waiting; nothing to report to.
            let _ = ack.send(result);
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "Closing response stream failed");
        }
    }

    /// Write one message and wait until it has been flushed.
    pub async fn write(&self, message: StreamingMessage) -> Result<()> {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            debug!(message_type = message.message.message_type().as_str(), "Dropping write after end of stream");
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send((message, ack_tx)).await.is_err() {
            return Err(Error::Other("response stream writer stopped".to_string()));
        }
        match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Other("response stream writer stopped".to_string())),
        }
    }

    /// Close the stream. Safe to call more than once.
    pub async fn end(&self) {
        drop(self.tx.lock().await.take());
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Response stream task failed");
        }
    }

    pub async fn is_ended(&self) -> bool {
        self.tx.lock().await.is_none()
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Response channel handed to a routine.
///
/// Framing starts with the first streamed message. Until then the response
/// can still be answered with a plain body instead.
pub struct ResponseStream {
    raw: parking_lot::Mutex<Option<BoxedWriter>>,
    stream: OnceCell<StreamWriter>,
}

impl ResponseStream {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            raw: parking_lot::Mutex::new(Some(Box::new(writer))),
            stream: OnceCell::new(),
        }
    }

    /// Stream one message and wait for it to be flushed.
    pub async fn send(&self, payload: StreamingPayload) -> Result<()> {
        let writer = self
            .stream
            .get_or_try_init(|| async {
                let raw = self.raw.lock().take();
                raw.map(StreamWriter::new)
                    .ok_or_else(|| Error::Other("response was already answered".to_string()))
            })
            .await?;
        writer.write(StreamingMessage::new(payload)).await
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.initialized()
    }

    /// Answer with a plain body and close. Fails once streaming has started.
    pub async fn reply(&self, body: &[u8]) -> Result<()> {
        let raw = self.raw.lock().take();
        let Some(mut raw) = raw else {
            return Err(Error::Other("response was already answered".to_string()));
        };
        raw.write_all(body).await?;
        raw.shutdown().await?;
        Ok(())
    }

    /// Close whatever was opened. Safe to call more than once.
    pub async fn end(&self) {
        if let Some(stream) = self.stream.get() {
            stream.end().await;
        }
        let raw = self.raw.lock().take();
        if let Some(mut raw) = raw
            && let Err(e) = raw.shutdown().await
        {
            debug!(error = %e, "Closing response failed");
        }
    }
}
