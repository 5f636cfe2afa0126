//! Transport layer - newline-delimited frame exchange
//!
//! Splits a duplex byte stream into a shareable [`FrameWriter`] and a single
//! owned [`FrameReader`]. Neither half knows anything about message content:
//! a frame is whatever bytes sit between two `\n` delimiters.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Initial capacity of the line accumulation buffer
const FRAME_BUFFER_CAPACITY: usize = 8192;

/// Frame delimiter
const FRAME_DELIMITER: u8 = b'\n';

/// Error types for the frame transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,
}

// ============================================================================
// Writer Half
// ============================================================================

enum WriterCommand {
    Frame {
        frame: Vec<u8>,
        done: oneshot::Sender<io::Result<()>>,
    },
    Close {
        done: oneshot::Sender<io::Result<()>>,
    },
}

/// Shareable writer backed by a dedicated writer task
///
/// Frames are queued to the task, which writes and flushes each one in full
/// before taking the next. A caller that stops waiting never leaves half a
/// frame on the stream, and concurrent callers never interleave bytes. After
/// the first write failure the task exits and every later write reports
/// [`TransportError::Disconnected`].
#[derive(Debug)]
pub struct FrameWriter {
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl FrameWriter {
    /// Spawn the writer task for `writer`; must be called inside a runtime
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(writer, receiver));
        Self { commands }
    }

    /// Write one complete frame (caller supplies the trailing delimiter)
    ///
    /// Resolves once the frame is flushed. Dropping the returned future does
    /// not cancel a frame that was already queued.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let (done, written) = oneshot::channel();
        self.commands
            .send(WriterCommand::Frame {
                frame: frame.to_vec(),
                done,
            })
            .map_err(|_| TransportError::Disconnected)?;

        match written.await {
            Ok(result) => result.map_err(TransportError::Io),
            Err(_) => Err(TransportError::Disconnected),
        }
    }

    /// Shut down the underlying stream after queued frames; the peer observes
    /// end-of-input
    pub async fn close(&self) -> Result<(), TransportError> {
        let (done, closed) = oneshot::channel();
        if self.commands.send(WriterCommand::Close { done }).is_err() {
            return Ok(());
        }
        match closed.await {
            Ok(result) => Ok(result?),
            // Task already gone
            Err(_) => Ok(()),
        }
    }
}

async fn writer_task<W>(mut writer: W, mut commands: mpsc::UnboundedReceiver<WriterCommand>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Frame { frame, done } => {
                trace!("FrameWriter: writing frame (length: {})", frame.len());

                let result = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                }
                .await;

                let failed = result.is_err();
                if let Err(e) = &result {
                    error!("Failed to write frame: {}", e);
                }
                let _ = done.send(result);
                if failed {
                    break;
                }
            }
            WriterCommand::Close { done } => {
                trace!("FrameWriter: closing");
                let _ = done.send(writer.shutdown().await);
                break;
            }
        }
    }
    trace!("FrameWriter: writer task finished");
}

// ============================================================================
// Reader Half
// ============================================================================

/// Result of waiting for the next frame
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete frame, delimiter stripped
    Frame(Vec<u8>),
    /// End of stream; `partial` holds any bytes after the last delimiter
    Closed { partial: Option<Vec<u8>> },
}

/// Buffered reader that yields one frame per delimiter
///
/// [`FrameReader::next_frame`] is cancel-safe: bytes read before a
/// cancellation stay buffered and are returned by the next call.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buffer: Vec::with_capacity(FRAME_BUFFER_CAPACITY),
        }
    }

    pub async fn next_frame(&mut self) -> Result<ReadOutcome, TransportError> {
        // read_until appends to `buffer` as data arrives, so a cancelled call
        // loses nothing
        let read = self
            .reader
            .read_until(FRAME_DELIMITER, &mut self.buffer)
            .await?;

        if read == 0 || self.buffer.last() != Some(&FRAME_DELIMITER) {
            let partial = (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer));
            trace!(
                "FrameReader: end of stream ({} trailing bytes)",
                partial.as_ref().map_or(0, Vec::len)
            );
            return Ok(ReadOutcome::Closed { partial });
        }

        let mut frame = std::mem::replace(&mut self.buffer, Vec::with_capacity(FRAME_BUFFER_CAPACITY));
        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        Ok(ReadOutcome::Frame(frame))
    }
}

// ============================================================================
// Stdio Transport
// ============================================================================

/// Both halves of a child process's stdio, before they are split apart
#[derive(Debug)]
pub struct StdioTransport {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl StdioTransport {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self { stdin, stdout }
    }

    /// Split into the shared writer and the reader owned by the reader task
    pub fn split(self) -> (FrameWriter, FrameReader<ChildStdout>) {
        (FrameWriter::new(self.stdin), FrameReader::new(self.stdout))
    }
}
