//! MCP client connection
//!
//! A [`Connection`] owns exactly one server process for its whole lifetime:
//! it spawns the process, runs the transport reader, performs the
//! `initialize` handshake and then correlates requests with responses through
//! the pending-request registry.
//!
//! ```no_run
//! # async fn demo() -> Result<(), simplemcp::ClientError> {
//! use simplemcp::{ClientConfig, Connection};
//!
//! let config = ClientConfig::builder("my-mcp-server").arg("--stdio").build()?;
//! let connection = Connection::connect(config).await?;
//! let tools = connection.request("tools/list", None).await?;
//! println!("{}", serde_json::Value::Object(tools));
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{Level, debug, info, warn};

use crate::config::{ClientConfig, IdStrategy};
use crate::io::process::{
    ChildProcessManager, ProcessManager, StderrLine, StderrLog, StderrMonitor, StopMode,
};
use crate::io::transport::FrameWriter;
use crate::mcp::error::ClientError;
use crate::mcp::handshake::{
    HANDSHAKE_REQUEST_ID, INITIALIZE_METHOD, INITIALIZED_NOTIFICATION, Implementation,
    InitializeResult, initialize_request,
};
use crate::mcp::messages::{FrameEncode, MessageId, Notification, Params, Request};
use crate::mcp::pending::{PendingRequests, ResponseHandle};
use crate::mcp::reader::{ReaderExit, TransportReader};
use crate::mcp::state::{ClientState, StateMachine};
use crate::{log_mcp_message, log_timing};

/// How long to wait for the reader task to acknowledge a shutdown signal
const READER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Connection {
    config: ClientConfig,
    state: StateMachine,

    /// Also serializes `open` against `close` on an unopened connection
    process: Mutex<ChildProcessManager>,
    pid: OnceLock<u32>,
    stderr_log: StderrLog,

    writer: OnceLock<Arc<FrameWriter>>,
    reader_task: StdMutex<Option<JoinHandle<ReaderExit>>>,
    reader_shutdown: StdMutex<Option<oneshot::Sender<()>>>,
    alive: Arc<AtomicBool>,

    pending: Arc<PendingRequests>,
    next_id: AtomicI64,

    server: OnceLock<InitializeResult>,
}

impl Connection {
    /// Create an unopened connection; nothing is spawned until [`Connection::open`]
    pub fn new(config: ClientConfig) -> Self {
        let stderr_log = StderrLog::new(config.stderr_capacity);

        let mut process = ChildProcessManager::new(
            config.command.clone(),
            config.args.clone(),
            config.working_directory.clone(),
        )
        .with_env(config.env.clone())
        .with_stderr_log(stderr_log.clone())
        .with_grace_period(config.shutdown_grace);

        if let Some(handler) = config.stderr_handler.clone() {
            process.on_stderr_line(move |line| handler(line));
        }

        Self {
            config,
            state: StateMachine::new(),
            process: Mutex::new(process),
            pid: OnceLock::new(),
            stderr_log,
            writer: OnceLock::new(),
            reader_task: StdMutex::new(None),
            reader_shutdown: StdMutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(PendingRequests::new()),
            next_id: AtomicI64::new(HANDSHAKE_REQUEST_ID + 1),
            server: OnceLock::new(),
        }
    }

    /// Create and open a connection in one step
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let connection = Self::new(config);
        connection.open().await?;
        Ok(connection)
    }

    /// Open a connection to `command args...` with default settings
    pub async fn spawn(
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, ClientError> {
        let config = ClientConfig::builder(command).args(args).build()?;
        Self::connect(config).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the server and complete the `initialize` handshake
    ///
    /// On any failure after the process started, the process is killed and the
    /// connection ends up `Terminated`. A spawn failure leaves it
    /// `Uninitialized`.
    pub async fn open(&self) -> Result<(), ClientError> {
        let started = Instant::now();

        let stdio = {
            let mut process = self.process.lock().await;
            let state = self.state.current();
            if state != ClientState::Uninitialized {
                return Err(ClientError::AlreadyOpen { state });
            }

            if let Err(e) = process.start().await {
                return Err(ClientError::Spawn {
                    command: process.command().to_string(),
                    reason: e.to_string(),
                });
            }
            self.state.transition(ClientState::Initializing)?;
            if let Some(pid) = process.pid() {
                let _ = self.pid.set(pid);
            }
            process.take_stdio()
        };

        let stdio = match stdio {
            Ok(stdio) => stdio,
            Err(e) => {
                let error = ClientError::transport_closed(e.to_string());
                self.abort_open(&error).await;
                return Err(error);
            }
        };

        let (writer, frames) = stdio.split();
        let writer = Arc::new(writer);
        let _ = self.writer.set(Arc::clone(&writer));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.alive.store(true, Ordering::SeqCst);
        let reader = TransportReader::new(frames, Arc::clone(&self.pending), Arc::clone(&self.alive))
            .with_handler(self.config.notification_handler.clone())
            .with_replies(Arc::clone(&writer));
        *lock(&self.reader_task) = Some(reader.spawn(shutdown_rx));
        *lock(&self.reader_shutdown) = Some(shutdown_tx);

        let result = match self.handshake().await {
            Ok(result) => result,
            Err(error) => {
                self.abort_open(&error).await;
                return Err(error);
            }
        };

        let initialized = Notification::new(INITIALIZED_NOTIFICATION, None);
        if let Err(error) = self.write_message(INITIALIZED_NOTIFICATION, &initialized).await {
            self.abort_open(&error).await;
            return Err(error);
        }

        info!(
            "Connected to {} (protocol {})",
            result
                .server_info
                .as_ref()
                .map(|info| format!("{} {}", info.name, info.version))
                .unwrap_or_else(|| "unnamed server".to_string()),
            result
                .protocol_version
                .as_deref()
                .unwrap_or(&self.config.protocol_version)
        );
        let _ = self.server.set(result);
        self.state.transition(ClientState::Ready)?;

        log_timing!(Level::DEBUG, "open", started.elapsed());
        Ok(())
    }

    async fn handshake(&self) -> Result<InitializeResult, ClientError> {
        let request = initialize_request(
            &self.config.protocol_version,
            &self.config.client_info,
            &self.config.capabilities,
        );
        let id = request.id.clone();

        let handle = self.pending.register(id.clone(), INITIALIZE_METHOD).await?;
        self.write_message(INITIALIZE_METHOD, &request).await?;

        let timeout = self.config.handshake_timeout;
        let response = match tokio::time::timeout(timeout, handle).await {
            Ok(completion) => completion?,
            Err(_) => {
                self.pending.remove(&id).await;
                warn!("No initialize response within {:?}", timeout);
                return Err(ClientError::HandshakeTimeout { timeout });
            }
        };

        let result = response
            .into_result()
            .map_err(|error| ClientError::HandshakeRejected {
                code: error.code,
                message: error.message,
            })?;
        let result = InitializeResult::from_result(result)?;

        match result.protocol_version.as_deref() {
            Some(version) if version != self.config.protocol_version => warn!(
                "Server answered with protocol version {} (requested {})",
                version, self.config.protocol_version
            ),
            None => warn!("Server did not report a protocol version"),
            Some(_) => {}
        }

        Ok(result)
    }

    /// Tear down a half-opened connection
    async fn abort_open(&self, error: &ClientError) {
        warn!("Initialization failed: {}", error);
        self.stop_reader().await;
        self.pending.fail_all(error.clone()).await;
        self.close_writer().await;

        {
            let mut process = self.process.lock().await;
            if let Err(e) = process.stop(StopMode::Force).await {
                debug!("Stopping server after failed initialization: {}", e);
            }
        }

        if let Err(e) = self.state.transition(ClientState::Terminated) {
            warn!("{}", e);
        }
    }

    /// Shut the connection down
    ///
    /// Waits up to the shutdown grace period for in-flight requests, fails
    /// whatever is left with `ConnectionClosed`, then stops the server.
    /// Closing a terminated connection is a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        {
            // Holding the process lock keeps a concurrent open() out
            let _process = self.process.lock().await;
            match self.state.current() {
                ClientState::Terminated => return Ok(()),
                ClientState::Uninitialized => {
                    self.state.transition(ClientState::Terminated)?;
                    self.pending.fail_all(ClientError::ConnectionClosed).await;
                    return Ok(());
                }
                _ => {}
            }
        }

        let started = Instant::now();
        self.state.transition(ClientState::ShuttingDown)?;

        let grace = self.config.shutdown_grace;
        if !self.pending.wait_drained(grace).await {
            warn!(
                "{} request(s) still pending after {:?}; abandoning them",
                self.pending.len().await,
                grace
            );
        }

        self.stop_reader().await;
        self.pending.fail_all(ClientError::ConnectionClosed).await;
        self.close_writer().await;

        {
            let mut process = self.process.lock().await;
            if let Err(e) = process.stop(StopMode::Graceful).await {
                warn!("Failed to stop server process: {}", e);
            }
        }

        self.state.transition(ClientState::Terminated)?;
        log_timing!(Level::DEBUG, "close", started.elapsed());
        Ok(())
    }

    async fn stop_reader(&self) {
        let shutdown = lock(&self.reader_shutdown).take();
        if let Some(shutdown) = shutdown {
            // Err only means the reader already exited
            let _ = shutdown.send(());
        }

        let task = lock(&self.reader_task).take();
        let Some(mut task) = task else {
            return;
        };
        match tokio::time::timeout(READER_STOP_TIMEOUT, &mut task).await {
            Ok(Ok(exit)) => debug!("Reader stopped: {:?}", exit),
            Ok(Err(e)) => warn!("Reader task failed: {}", e),
            Err(_) => {
                warn!("Reader did not stop within {:?}; aborting", READER_STOP_TIMEOUT);
                task.abort();
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn close_writer(&self) {
        if let Some(writer) = self.writer.get() {
            if let Err(e) = writer.close().await {
                debug!("Closing server stdin: {}", e);
            }
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Send a request and return the handle that resolves to its response
    ///
    /// Returns as soon as the frame is flushed; await the handle for the reply.
    pub async fn send(
        &self,
        method: &str,
        params: Option<Params>,
    ) -> Result<ResponseHandle, ClientError> {
        self.state.ensure_ready()?;
        self.ensure_transport()?;

        let id = self.next_request_id();
        let request = Request::new(id.clone(), method, params);

        // Registered before writing so a fast reply always finds its entry
        let handle = self.pending.register(id.clone(), method).await?;
        if let Err(error) = self.write_message(method, &request).await {
            self.pending.remove(&id).await;
            return Err(error);
        }
        Ok(handle)
    }

    /// Send a request and wait for its result, up to the request timeout
    pub async fn request(&self, method: &str, params: Option<Params>) -> Result<Params, ClientError> {
        let started = Instant::now();
        let handle = self.send(method, params).await?;
        let id = handle.id().clone();

        let outcome = handle.wait_timeout(self.config.request_timeout).await;
        if matches!(outcome, Err(ClientError::RequestTimeout { .. })) {
            self.pending.remove(&id).await;
        }

        let response = outcome?;
        log_timing!(Level::DEBUG, method, started.elapsed());
        response.into_result().map_err(ClientError::from)
    }

    /// Send a notification; no reply is expected
    pub async fn notify(&self, method: &str, params: Option<Params>) -> Result<(), ClientError> {
        self.state.ensure_ready()?;
        self.ensure_transport()?;
        self.write_message(method, &Notification::new(method, params))
            .await
    }

    fn ensure_transport(&self) -> Result<(), ClientError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::transport_closed("server output closed"))
        }
    }

    fn next_request_id(&self) -> MessageId {
        match self.config.id_strategy {
            IdStrategy::Sequential => MessageId::Number(self.next_id.fetch_add(1, Ordering::SeqCst)),
            IdStrategy::Uuid => MessageId::String(uuid::Uuid::new_v4().to_string()),
        }
    }

    async fn write_message<M: FrameEncode>(&self, method: &str, message: &M) -> Result<(), ClientError> {
        let writer = self
            .writer
            .get()
            .ok_or_else(|| ClientError::transport_closed("server stdin unavailable"))?;
        let frame = message.encode_frame()?;

        let text = String::from_utf8_lossy(&frame);
        log_mcp_message!(Level::DEBUG, "outgoing", method, text.trim_end());

        writer
            .write_frame(&frame)
            .await
            .map_err(|e| ClientError::transport_closed(e.to_string()))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ClientState {
        self.state.current()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Everything the server sent back from `initialize`
    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.server.get()
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server.get().and_then(|result| result.server_info.as_ref())
    }

    /// Protocol version the server reported during the handshake
    pub fn protocol_version(&self) -> Option<&str> {
        self.server
            .get()
            .and_then(|result| result.protocol_version.as_deref())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    /// PID the server was started with (kept after it exits)
    pub fn process_id(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn is_transport_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Recent stderr output of the server, oldest first
    pub fn stderr_lines(&self) -> Vec<StderrLine> {
        self.stderr_log.snapshot()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        // Emergency cleanup when close() was never awaited
        if !self.state.current().is_terminal() {
            self.process.get_mut().kill_sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{INIT_REPLY, after_handshake, sh_peer};
    use serde_json::json;
    use std::collections::HashSet;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let config = sh_peer(
            r#"read -r _; echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"X"}}'; cat >/dev/null"#,
        )
        .build()
        .unwrap();
        let connection = Connection::new(config);
        assert_eq!(connection.state(), ClientState::Uninitialized);

        connection.open().await.unwrap();
        assert_eq!(connection.state(), ClientState::Ready);
        // Mismatched version is recorded, not rejected
        assert_eq!(connection.protocol_version(), Some("X"));
        assert!(connection.is_transport_alive());
        assert!(connection.process_id().is_some());

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ClientState::Terminated);
        // Idempotent
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout_terminates() {
        let config = sh_peer("cat >/dev/null")
            .handshake_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let connection = Connection::new(config);

        let started = Instant::now();
        let result = connection.open().await;
        assert!(matches!(result, Err(ClientError::HandshakeTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(connection.state(), ClientState::Terminated);
        assert_eq!(connection.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let config = sh_peer(
            r#"read -r _; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Unsupported protocol version"}}'; cat >/dev/null"#,
        )
        .build()
        .unwrap();
        let connection = Connection::new(config);

        let result = connection.open().await;
        assert!(matches!(
            result,
            Err(ClientError::HandshakeRejected { code: -32602, .. })
        ));
        assert_eq!(connection.state(), ClientState::Terminated);
    }

    #[tokio::test]
    async fn test_server_exit_during_handshake() {
        let config = sh_peer("read -r _; exit 1").build().unwrap();
        let connection = Connection::new(config);

        let result = connection.open().await;
        assert!(matches!(result, Err(ClientError::TransportClosed { .. })));
        assert_eq!(connection.state(), ClientState::Terminated);
    }

    #[tokio::test]
    async fn test_peer_exit_fails_pending_requests() {
        let config = sh_peer(&after_handshake("read -r _a; read -r _b; exit 0"))
            .build()
            .unwrap();
        let connection = Connection::connect(config).await.unwrap();

        let first = connection.send("tools/list", None).await.unwrap();
        let second = connection.send("resources/list", None).await.unwrap();

        let first = first.wait_timeout(Duration::from_secs(5)).await;
        let second = second.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(first, Err(ClientError::TransportClosed { .. })));
        assert!(matches!(second, Err(ClientError::TransportClosed { .. })));

        // Still Ready, but nothing more can be sent
        assert_eq!(connection.state(), ClientState::Ready);
        assert!(!connection.is_transport_alive());
        assert!(matches!(
            connection.send("ping", None).await,
            Err(ClientError::TransportClosed { .. })
        ));

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ClientState::Terminated);
    }

    #[tokio::test]
    async fn test_malformed_line_then_valid_response() {
        let config = sh_peer(&after_handshake(
            r#"read -r _; echo 'garbage{'; echo '{"jsonrpc":"2.0","id":2,"result":{"ok":true}}'; cat >/dev/null"#,
        ))
        .build()
        .unwrap();
        let connection = Connection::connect(config).await.unwrap();

        let result = connection.request("ping", None).await.unwrap();
        assert_eq!(result["ok"], true);
        assert!(connection.is_transport_alive());

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let config = sh_peer(&after_handshake(
            r#"read -r _; read -r _; echo '{"jsonrpc":"2.0","id":3,"result":{"n":3}}'; echo '{"jsonrpc":"2.0","id":2,"result":{"n":2}}'; cat >/dev/null"#,
        ))
        .build()
        .unwrap();
        let connection = Connection::connect(config).await.unwrap();

        let first = connection.send("a", None).await.unwrap();
        let second = connection.send("b", None).await.unwrap();
        assert_eq!(first.id(), &MessageId::Number(2));
        assert_eq!(second.id(), &MessageId::Number(3));

        let second = second.await.unwrap();
        let first = first.await.unwrap();
        assert_eq!(first.result().unwrap()["n"], 2);
        assert_eq!(second.result().unwrap()["n"], 3);

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_becomes_server_error() {
        let config = sh_peer(&after_handshake(
            r#"read -r _; echo '{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found","data":{"method":"nope"}}}'; cat >/dev/null"#,
        ))
        .build()
        .unwrap();
        let connection = Connection::connect(config).await.unwrap();

        let result = connection.request("nope", None).await;
        match result {
            Err(ClientError::Server { code, data, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(data, Some(json!({"method": "nope"})));
            }
            other => panic!("expected server error, got {other:?}"),
        }

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_unique_ids() {
        let echo = r#"while read -r line; do
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\)}$/\1/p')
            if [ -n "$id" ]; then echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"echo\":$id}}"; fi
        done"#;
        let config = sh_peer(&after_handshake(echo)).build().unwrap();
        let connection = Arc::new(Connection::connect(config).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let connection = Arc::clone(&connection);
            tasks.push(tokio::spawn(async move {
                connection.request("echo", None).await
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert!(seen.insert(result["echo"].as_i64().unwrap()));
        }
        assert_eq!(seen.len(), 10);
        assert!(!seen.contains(&HANDSHAKE_REQUEST_ID));

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_ready() {
        let config = sh_peer("cat >/dev/null").build().unwrap();
        let connection = Connection::new(config);

        assert!(matches!(
            connection.send("ping", None).await,
            Err(ClientError::NotReady {
                state: ClientState::Uninitialized
            })
        ));
        assert!(matches!(
            connection.notify("ping", None).await,
            Err(ClientError::NotReady { .. })
        ));

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ClientState::Terminated);
        assert!(matches!(
            connection.send("ping", None).await,
            Err(ClientError::NotReady {
                state: ClientState::Terminated
            })
        ));
        // A closed connection cannot be reopened
        assert!(matches!(
            connection.open().await,
            Err(ClientError::AlreadyOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let config = sh_peer(&after_handshake("cat >/dev/null")).build().unwrap();
        let connection = Connection::connect(config).await.unwrap();

        assert!(matches!(
            connection.open().await,
            Err(ClientError::AlreadyOpen {
                state: ClientState::Ready
            })
        ));
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_spawn() {
        let config = ClientConfig::builder("/nonexistent/simplemcp-server")
            .build()
            .unwrap();
        let connection = Connection::new(config);

        let result = connection.open().await;
        assert!(matches!(result, Err(ClientError::Spawn { .. })));
        assert_eq!(connection.state(), ClientState::Uninitialized);
        assert!(connection.process_id().is_none());
    }

    #[tokio::test]
    async fn test_close_fails_unanswered_requests() {
        let config = sh_peer(&after_handshake("cat >/dev/null"))
            .shutdown_grace(Duration::from_millis(100))
            .build()
            .unwrap();
        let connection = Connection::connect(config).await.unwrap();

        let handle = connection.send("slow", None).await.unwrap();
        assert_eq!(connection.pending_count().await, 1);

        connection.close().await.unwrap();
        assert!(matches!(handle.await, Err(ClientError::ConnectionClosed)));
        assert_eq!(connection.pending_count().await, 0);
        assert!(!connection.is_transport_alive());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_dropped_handles() {
        let config = sh_peer(&after_handshake("cat >/dev/null"))
            .shutdown_grace(Duration::from_secs(3))
            .build()
            .unwrap();
        let connection = Connection::connect(config).await.unwrap();

        let handle = connection.send("slow", None).await.unwrap();
        drop(handle);

        let started = Instant::now();
        connection.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(connection.state(), ClientState::Terminated);
        assert_eq!(connection.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_timeout_removes_entry() {
        let config = sh_peer(&after_handshake("cat >/dev/null"))
            .request_timeout(Duration::from_millis(100))
            .shutdown_grace(Duration::from_millis(100))
            .build()
            .unwrap();
        let connection = Connection::connect(config).await.unwrap();

        let result = connection.request("slow", None).await;
        assert!(matches!(result, Err(ClientError::RequestTimeout { .. })));
        assert_eq!(connection.pending_count().await, 0);

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_notifications_and_stderr_are_captured() {
        let seen = Arc::new(StdMutex::new(Vec::<String>::new()));
        let seen_clone = Arc::clone(&seen);

        let script = format!(
            r#"echo 'server booting' >&2; read -r _; echo '{INIT_REPLY}'; read -r _; echo '{{"jsonrpc":"2.0","method":"notifications/message","params":{{"level":"info"}}}}'; read -r _; echo '{{"jsonrpc":"2.0","id":2,"result":{{}}}}'; cat >/dev/null"#
        );
        let config = sh_peer(&script)
            .notification_handler(move |message| {
                if let Some(method) = message.method() {
                    seen_clone.lock().unwrap().push(method.to_string());
                }
            })
            .build()
            .unwrap();
        let connection = Connection::connect(config).await.unwrap();
        assert_eq!(connection.server_info().map(|i| i.name.as_str()), Some("peer"));

        connection.request("ping", None).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["notifications/message"]);

        let mut lines = connection.stderr_lines();
        for _ in 0..50 {
            if !lines.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            lines = connection.stderr_lines();
        }
        assert_eq!(lines[0].line, "server booting");

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_uuid_id_strategy() {
        let config = sh_peer("cat >/dev/null")
            .id_strategy(IdStrategy::Uuid)
            .build()
            .unwrap();
        let connection = Connection::new(config);

        let first = connection.next_request_id();
        let second = connection.next_request_id();
        assert_ne!(first, second);
        match first {
            MessageId::String(id) => assert_eq!(id.len(), 36),
            other => panic!("expected string id, got {other:?}"),
        }
    }
}
