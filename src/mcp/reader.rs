//! Transport reader task
//!
//! Runs for the lifetime of a connection: reads frames from the server's
//! stdout, routes responses to the pending-request registry and hands
//! server-initiated messages to the configured handler. A malformed frame is
//! logged and skipped; only end-of-stream or a shutdown signal ends the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, info, trace, warn};

use crate::config::NotificationHandler;
use crate::io::transport::{FrameReader, FrameWriter, ReadOutcome};
use crate::log_mcp_message;
use crate::mcp::error::ClientError;
use crate::mcp::jsonrpc_utils::method_not_found_response;
use crate::mcp::messages::{FrameEncode, Message, MessageId, decode};
use crate::mcp::pending::PendingRequests;

/// Why the reader loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The connection asked the reader to stop
    Shutdown,
    /// The server closed its stdout (or it could no longer be read)
    StreamClosed,
}

pub struct TransportReader<R> {
    frames: FrameReader<R>,
    pending: Arc<PendingRequests>,
    alive: Arc<AtomicBool>,
    handler: Option<NotificationHandler>,
    /// Used to refuse server-initiated requests
    replies: Option<Arc<FrameWriter>>,
}

impl<R> TransportReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(
        frames: FrameReader<R>,
        pending: Arc<PendingRequests>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            frames,
            pending,
            alive,
            handler: None,
            replies: None,
        }
    }

    pub fn with_handler(mut self, handler: Option<NotificationHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_replies(mut self, writer: Arc<FrameWriter>) -> Self {
        self.replies = Some(writer);
        self
    }

    pub fn spawn(self, shutdown: oneshot::Receiver<()>) -> JoinHandle<ReaderExit> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> ReaderExit {
        trace!("TransportReader: started");
        self.alive.store(true, Ordering::SeqCst);

        let exit = loop {
            tokio::select! {
                // Also fires when the sender is dropped
                _ = &mut shutdown => {
                    debug!("TransportReader: shutdown requested");
                    break ReaderExit::Shutdown;
                }
                outcome = self.frames.next_frame() => match outcome {
                    Ok(ReadOutcome::Frame(frame)) => self.handle_frame(&frame).await,
                    Ok(ReadOutcome::Closed { partial }) => {
                        if let Some(partial) = partial {
                            warn!(
                                "Discarding partial frame at end of stream: {}",
                                String::from_utf8_lossy(&partial)
                            );
                        }
                        info!("Server closed its output stream");
                        break ReaderExit::StreamClosed;
                    }
                    Err(e) => {
                        warn!("Failed to read from server: {}", e);
                        break ReaderExit::StreamClosed;
                    }
                }
            }
        };

        self.alive.store(false, Ordering::SeqCst);
        let error = match exit {
            ReaderExit::Shutdown => ClientError::ConnectionClosed,
            ReaderExit::StreamClosed => ClientError::transport_closed("server closed stdout"),
        };
        self.pending.fail_all(error).await;

        trace!("TransportReader: finished ({:?})", exit);
        exit
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        if frame.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let message = match decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Discarding malformed frame ({}): {}",
                    e,
                    String::from_utf8_lossy(frame)
                );
                return;
            }
        };

        match message {
            Message::Response(response) => {
                log_mcp_message!(
                    Level::DEBUG,
                    "incoming",
                    "response",
                    format!("id={}", response.id)
                );
                let id = response.id.clone();
                self.pending.resolve(&id, response).await;
            }
            Message::Notification(notification) => {
                log_mcp_message!(
                    Level::DEBUG,
                    "incoming",
                    notification.method.as_str(),
                    "notification"
                );
                self.dispatch(Message::Notification(notification));
            }
            Message::Request(request) => {
                log_mcp_message!(
                    Level::DEBUG,
                    "incoming",
                    request.method.as_str(),
                    format!("server request id={}", request.id)
                );
                self.refuse(&request.id, &request.method).await;
                self.dispatch(Message::Request(request));
            }
        }
    }

    /// A panicking handler loses that one message; the loop keeps running
    fn dispatch(&self, message: Message) {
        let Some(handler) = &self.handler else {
            return;
        };
        let method = message.method().unwrap_or_default().to_string();
        if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
            error!("Message handler panicked while handling {}", method);
        }
    }

    /// This client offers no server-callable methods
    async fn refuse(&mut self, id: &MessageId, method: &str) {
        let Some(writer) = &self.replies else {
            return;
        };
        let reply = method_not_found_response(id.clone(), method);
        match reply.encode_frame() {
            Ok(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    debug!("Could not refuse server request {}: {}", id, e);
                }
            }
            Err(e) => warn!("Failed to encode refusal for {}: {}", id, e),
        }
    }
}
