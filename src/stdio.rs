//! Standard input/output transport
//!
//! One background reader splits stdin into frames; every complete frame is
//! dispatched on its own task, so responses may be written out of request
//! order and clients correlate by id. All writes to stdout go through a single
//! lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::StdioFraming;
use crate::errors::TransportError;
use crate::mcp::rpc::JsonRpcResponse;
use crate::mcp::server::Dispatcher;
use crate::registry::{MessageSender, Registry};

pub const STDIO_CONNECTION_ID: &str = "stdio";

/// Stream errors only; undecodable bytes are reported per frame instead.
const MAX_CONSECUTIVE_READ_ERRORS: usize = 16;

/// Accumulates raw input lines into complete frames. Bytes are kept as read
/// so invalid UTF-8 surfaces as a parse error on the frame that carries it.
#[derive(Debug)]
pub struct FrameBuffer {
    framing: StdioFraming,
    lines: Vec<Vec<u8>>,
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

impl FrameBuffer {
    pub fn new(framing: StdioFraming) -> Self {
        Self {
            framing,
            lines: Vec::new(),
        }
    }

    /// Feeds one line and returns a frame if the line completed one.
    pub fn push_line(&mut self, line: &[u8]) -> Option<Vec<u8>> {
        let line = trim_line_end(line);
        let blank = line.iter().all(u8::is_ascii_whitespace);
        match self.framing {
            StdioFraming::Line if blank => None,
            StdioFraming::Line => Some(line.to_vec()),
            StdioFraming::BlankLine if blank => self.finish(),
            StdioFraming::BlankLine => {
                self.lines.push(line.to_vec());
                None
            }
        }
    }

    /// Flushes whatever is buffered, e.g. at end of input.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.lines.is_empty() {
            return None;
        }
        let frame = self.lines.join(&b'\n');
        self.lines.clear();
        Some(frame)
    }
}

/// Serialized writer over the process output stream.
pub struct StdioWriter<W> {
    inner: Mutex<W>,
}

impl<W> StdioWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub async fn write_json(&self, message: &Value) -> Result<(), TransportError> {
        let line = serde_json::to_string(message)?;
        self.write_line(&line).await
    }

    pub async fn write_response(&self, response: &JsonRpcResponse) -> Result<(), TransportError> {
        let line = serde_json::to_string(response)?;
        debug!(id = %response.id, "sending response");
        self.write_line(&line).await
    }

    async fn write_line(&self, content: &str) -> Result<(), TransportError> {
        let mut writer = self.inner.lock().await;
        trace!("Sending line: {}", content);
        writer.write_all(content.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> MessageSender for StdioWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &Value) -> Result<(), TransportError> {
        self.write_json(message).await
    }
}

pub struct StdioServer {
    dispatcher: Arc<Dispatcher>,
    registry: Registry,
    framing: StdioFraming,
    shutdown_timeout: Duration,
}

impl StdioServer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Registry,
        framing: StdioFraming,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            framing,
            shutdown_timeout,
        }
    }

    /// Serves the process's own stdin/stdout until input closes or `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TransportError> {
        self.serve(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown,
        )
        .await
    }

    pub async fn serve<R, W>(
        self,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(StdioWriter::new(writer));
        self.registry.add_connection(
            STDIO_CONNECTION_ID,
            Arc::clone(&writer) as Arc<dyn MessageSender>,
        );

        let tracker = TaskTracker::new();
        let mut frames = FrameBuffer::new(self.framing);
        let mut segments = reader.split(b'\n');
        let mut consecutive_errors = 0;

        info!(framing = ?self.framing, "stdio transport reading");
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("stdio transport stopping");
                    break;
                }
                next = segments.next_segment() => next,
            };

            match next {
                Ok(Some(line)) => {
                    consecutive_errors = 0;
                    trace!("Received line: {}", String::from_utf8_lossy(&line));
                    if let Some(frame) = frames.push_line(&line) {
                        self.spawn_frame(&tracker, frame, &writer, &shutdown);
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    if let Some(frame) = frames.finish() {
                        self.spawn_frame(&tracker, frame, &writer, &shutdown);
                    }
                    break;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    error!(error = %err, "i/o error reading from stdin");
                    if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        warn!("too many consecutive read errors, stopping stdio transport");
                        break;
                    }
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(self.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                outstanding = tracker.len(),
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "in-flight stdio requests did not finish before shutdown timeout"
            );
        }

        self.registry.remove_connection(STDIO_CONNECTION_ID);
        info!("stdio transport stopped");
        Ok(())
    }

    fn spawn_frame<W>(
        &self,
        tracker: &TaskTracker,
        frame: Vec<u8>,
        writer: &Arc<StdioWriter<W>>,
        shutdown: &CancellationToken,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = Arc::clone(&self.dispatcher);
        let writer = Arc::clone(writer);
        let cancellation = shutdown.child_token();

        tracker.spawn(async move {
            let response = match serde_json::from_slice::<Value>(&frame) {
                Ok(payload) => {
                    dispatcher
                        .handle_value(payload, STDIO_CONNECTION_ID, &cancellation)
                        .await
                }
                Err(err) => {
                    warn!(error = %err, "failed to parse stdio frame");
                    Some(JsonRpcResponse::parse_error(err.to_string()))
                }
            };

            if let Some(response) = response {
                if let Err(err) = writer.write_response(&response).await {
                    error!(error = %err, "failed to send response");
                }
            }
        });
    }
}
