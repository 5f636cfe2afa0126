//! Pending request registry
//!
//! Maps in-flight request ids to the oneshot sender that completes the
//! caller's [`ResponseHandle`]. Shared between the connection (register) and
//! the transport reader (resolve); every operation takes the single registry
//! lock once, so an entry is removed and completed exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, oneshot};
use tracing::{debug, trace, warn};

use crate::mcp::error::ClientError;
use crate::mcp::messages::{MessageId, Response};

type Completion = Result<Response, ClientError>;

/// How often `wait_drained` looks for handles dropped by their callers
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct PendingEntry {
    sender: oneshot::Sender<Completion>,
    method: String,
    created_at: Instant,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<MessageId, PendingEntry>,
    /// Set once the connection can no longer deliver responses; later
    /// registrations fail immediately with this error
    closed: Option<ClientError>,
}

/// Concurrency-safe map of outstanding requests
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<RegistryInner>,
    drained: Notify,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request and hand back the caller's handle
    pub async fn register(
        &self,
        id: MessageId,
        method: impl Into<String>,
    ) -> Result<ResponseHandle, ClientError> {
        let mut inner = self.inner.lock().await;

        if let Some(error) = &inner.closed {
            return Err(error.clone());
        }
        if inner.entries.contains_key(&id) {
            return Err(ClientError::DuplicateId { id });
        }

        let (sender, receiver) = oneshot::channel();
        let method = method.into();
        trace!("PendingRequests: registered {} ({})", id, method);
        inner.entries.insert(
            id.clone(),
            PendingEntry {
                sender,
                method,
                created_at: Instant::now(),
            },
        );

        Ok(ResponseHandle { id, receiver })
    }

    /// Complete the handle registered under `id`
    ///
    /// Returns `false` for stray replies (unknown or already resolved ids);
    /// those are logged and otherwise ignored.
    pub async fn resolve(&self, id: &MessageId, response: Response) -> bool {
        let entry = self.take(id).await;

        match entry {
            Some(entry) => {
                debug!(
                    "Resolved request {} ({}) after {:?}",
                    id,
                    entry.method,
                    entry.created_at.elapsed()
                );
                if entry.sender.send(Ok(response)).is_err() {
                    debug!("Caller stopped waiting for request {}; response dropped", id);
                }
                true
            }
            None => {
                warn!("Received response for unknown request ID: {}", id);
                false
            }
        }
    }

    /// Drop an entry without completing it (caller gave up waiting)
    pub async fn remove(&self, id: &MessageId) -> bool {
        self.take(id).await.is_some()
    }

    /// Complete every pending entry with `error` and refuse new registrations
    ///
    /// Only the first close reason is kept; returns the number of entries failed.
    pub async fn fail_all(&self, error: ClientError) -> usize {
        let entries: Vec<(MessageId, PendingEntry)> = {
            let mut inner = self.inner.lock().await;
            if inner.closed.is_none() {
                inner.closed = Some(error.clone());
            }
            inner.entries.drain().collect()
        };
        self.drained.notify_waiters();

        let count = entries.len();
        if count > 0 {
            warn!("Failing {} pending request(s): {}", count, error);
        }
        for (id, entry) in entries {
            trace!("PendingRequests: failing {} ({})", id, entry.method);
            let _ = entry.sender.send(Err(error.clone()));
        }
        count
    }

    /// Remove entries whose caller is gone or which are older than `max_age`
    ///
    /// Live callers of expired entries receive `RequestTimeout`.
    pub async fn reap_older_than(&self, max_age: Duration) -> usize {
        let expired: Vec<(MessageId, PendingEntry)> = {
            let mut inner = self.inner.lock().await;
            let ids: Vec<MessageId> = inner
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.sender.is_closed() || entry.created_at.elapsed() > max_age
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        if self.is_empty().await {
            self.drained.notify_waiters();
        }

        let count = expired.len();
        for (id, entry) in expired {
            debug!("Reaping request {} ({})", id, entry.method);
            let _ = entry.sender.send(Err(ClientError::RequestTimeout {
                id,
                timeout: max_age,
            }));
        }
        count
    }

    /// Wait until no requests are in flight, or `timeout` elapses
    ///
    /// Entries whose caller dropped its handle no longer count as in flight
    /// and are removed along the way.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.drained.notified();
                if self.prune_cancelled().await == 0 {
                    return;
                }
                // Dropping a handle sends no wakeup, so re-check periodically
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
                }
            }
        })
        .await
        .is_ok()
    }

    /// Remove entries nobody is waiting for; returns how many remain
    async fn prune_cancelled(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|id, entry| {
            let cancelled = entry.sender.is_closed();
            if cancelled {
                trace!("PendingRequests: dropping cancelled {} ({})", id, entry.method);
            }
            !cancelled
        });
        inner.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().await.entries.contains_key(id)
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed.is_some()
    }

    async fn take(&self, id: &MessageId) -> Option<PendingEntry> {
        let (entry, now_empty) = {
            let mut inner = self.inner.lock().await;
            let entry = inner.entries.remove(id);
            (entry, inner.entries.is_empty())
        };
        if now_empty {
            self.drained.notify_waiters();
        }
        entry
    }
}

// ============================================================================
// Completion Handle
// ============================================================================

/// Caller side of a pending request; resolves to the server's response
///
/// Dropping the handle cancels interest in the reply. A response that arrives
/// afterwards is discarded by the registry.
#[derive(Debug)]
pub struct ResponseHandle {
    id: MessageId,
    receiver: oneshot::Receiver<Completion>,
}

impl ResponseHandle {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Await the response for at most `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> Completion {
        let id = self.id.clone();
        match tokio::time::timeout(timeout, self).await {
            Ok(completion) => completion,
            Err(_) => Err(ClientError::RequestTimeout { id, timeout }),
        }
    }
}

impl Future for ResponseHandle {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(completion) => completion,
            // Sender dropped without completing: the registry went away
            Err(_) => Err(ClientError::ConnectionClosed),
        })
    }
}
