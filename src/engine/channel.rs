//! Message channel to a sandbox process
//!
//! Newline-delimited JSON over any async byte pipe. Outgoing requests are
//! queued to a writer task so `send` never blocks; incoming lines are decoded
//! by a reader task and delivered, in order, to a single consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{decode, Envelope, Request};
use crate::error::{ChannelError, ProtocolError};

/// One decoded line from the sandbox, or the reason it could not be decoded
pub type Inbound = Result<Envelope, ProtocolError>;

type Terminator = Box<dyn FnOnce() + Send>;

pub struct MessageChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    on_terminate: Option<Terminator>,
}

impl MessageChannel {
    /// Wrap a reader/writer pair (e.g. a child's stdout/stdin)
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, closed.clone()));
        let reader_task = tokio::spawn(read_loop(reader, inbound_tx));

        Self {
            outbound,
            inbound: Some(inbound),
            closed,
            tasks: vec![writer_task, reader_task],
            on_terminate: None,
        }
    }

    /// Run `f` once when the channel is terminated (kill the process, etc.)
    pub fn with_terminator(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_terminate = Some(Box::new(f));
        self
    }

    /// Tie an auxiliary task's lifetime to the channel
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Queue a request. Fails only once the channel is closed.
    pub fn send(&self, request: &Request) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let line = request.encode()?;
        self.outbound.send(line).map_err(|_| ChannelError::Closed)
    }

    /// Hand out the receiving side. There is exactly one consumer, so this
    /// returns `None` after the first call.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound.take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sever the channel and stop the sandbox behind it. Idempotent.
    pub fn terminate(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(on_terminate) = self.on_terminate.take() {
            on_terminate();
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outbound.recv().await {
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to write to sandbox: {}", e);
            break;
        }
    }
    closed.store(true, Ordering::SeqCst);
}

async fn read_loop<R>(reader: R, inbound: mpsc::UnboundedSender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("Sandbox closed its output");
                break;
            }
            Ok(_) => {
                // A bad line is reported and skipped; only EOF ends the stream
                let item = match std::str::from_utf8(&buf) {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => decode(line.trim_end()),
                    Err(e) => Err(ProtocolError::Malformed(format!("invalid UTF-8: {}", e))),
                };
                if inbound.send(item).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read from sandbox: {}", e);
                break;
            }
        }
    }
}
