//! Process management layer
//!
//! Spawns the MCP server, owns its lifecycle and drains stderr,
//! completely separate from transport concerns.

use crate::io::transport::StdioTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Default number of stderr lines retained for diagnostics
pub const DEFAULT_STDERR_CAPACITY: usize = 256;

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, then SIGKILL if the process outlives the grace period
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited or was stopped; exit code when it is known
    Stopped { exit_code: Option<i32> },
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Stderr Capture
// ============================================================================

/// One line the server wrote to stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Bounded ring of recent stderr lines; the oldest line is evicted first
#[derive(Debug, Clone)]
pub struct StderrLog {
    lines: Arc<Mutex<VecDeque<StderrLine>>>,
    capacity: usize,
}

impl StderrLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(StderrLine {
            timestamp: Utc::now(),
            line,
        });
    }

    /// Copy of the retained lines, oldest first
    pub fn snapshot(&self) -> Vec<StderrLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for StderrLog {
    fn default() -> Self {
        Self::new(DEFAULT_STDERR_CAPACITY)
    }
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// Only one handler can be active at a time; installing a new one replaces
    /// the previous. Must be called before the process starts.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the external process and reap it
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    fn is_running(&self) -> bool;

    /// Hand over the process's stdin/stdout; succeeds once per start
    fn take_stdio(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Synchronous force kill for Drop implementations
    fn kill_sync(&mut self);
}

/// Manages a child process spawned via Command
pub struct ChildProcessManager {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: HashMap<String, String>,

    state: Arc<Mutex<ProcessState>>,

    /// Stdio handed to the client once after start
    stdio: Option<StdioTransport>,

    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
    stderr_log: StderrLog,
    stderr_task: Option<JoinHandle<()>>,

    /// Owns the `Child` and records its exit status
    wait_task: Option<JoinHandle<()>>,

    /// How long a graceful stop waits after SIGTERM before escalating
    grace: Duration,
}

impl ChildProcessManager {
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            args,
            working_directory: working_dir,
            env: HashMap::new(),
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio: None,
            stderr_handler: None,
            stderr_log: StderrLog::default(),
            stderr_task: None,
            wait_task: None,
            grace: Duration::from_secs(crate::config::DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }

    /// Extra environment variables for the child (inherited env is kept)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_stderr_log(mut self, log: StderrLog) -> Self {
        self.stderr_log = log;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn get_state(&self) -> ProcessState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.get_state().pid()
    }

    pub fn stderr_log(&self) -> &StderrLog {
        &self.stderr_log
    }

    fn set_state(&self, next: ProcessState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Spawn the stderr drain task
    ///
    /// Always drains stderr so the child never blocks on a full pipe. Lines go
    /// to the bounded log and, if installed, to the handler.
    fn spawn_stderr_monitor(&mut self, stderr: ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        let handler = self.stderr_handler.clone();
        let log = self.stderr_log.clone();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            trace!(
                "ChildProcessManager: Starting stderr monitoring (handler: {})",
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let content = line.trim_end().to_string();
                        if content.is_empty() {
                            continue;
                        }
                        debug!(target: "simplemcp::server_stderr", "{}", content);
                        log.push(content.clone());
                        if let Some(handler) = &handler {
                            handler(content);
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            trace!("ChildProcessManager: stderr monitoring finished");
        });

        self.stderr_task = Some(task);
    }

    /// Spawn the wait task that owns the child and records its exit
    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            trace!("ChildProcessManager: Starting wait task for PID {}", pid);

            let exit_code = match child.wait().await {
                Ok(status) => {
                    info!("Process PID {} exited with status: {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    None
                }
            };

            *state.lock().unwrap_or_else(PoisonError::into_inner) =
                ProcessState::Stopped { exit_code };

            trace!("ChildProcessManager: Wait task finished for PID {}", pid);
        });

        self.wait_task = Some(task);
    }

    /// Wait for the wait task to observe exit, up to `timeout`
    async fn reap(&mut self, timeout: Duration) -> bool {
        let Some(task) = self.wait_task.as_mut() else {
            return true;
        };
        match tokio::time::timeout(timeout, task).await {
            Ok(_) => {
                self.wait_task = None;
                true
            }
            Err(_) => false,
        }
    }

    async fn stop_stderr_monitor(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            // Give the drain a moment to pick up the last lines after exit
            if tokio::time::timeout(Duration::from_millis(100), task)
                .await
                .is_err()
            {
                trace!("ChildProcessManager: stderr monitor still busy, detaching");
            }
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pid at
    // worst yields ESRCH
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if !matches!(self.get_state(), ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn().map_err(|source| ProcessError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Process started with PID: {}", pid);
        self.set_state(ProcessState::Running { pid });

        // Extract stdio before the child moves into the wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio = Some(StdioTransport::new(stdin, stdout));
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child, pid);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state() {
            ProcessState::NotStarted => return Err(ProcessError::NotStarted),
            ProcessState::Stopped { .. } => {
                // Exited on its own; just make sure it is reaped
                self.reap(self.grace).await;
                self.stop_stderr_monitor().await;
                return Ok(());
            }
            ProcessState::Running { pid } => pid,
        };

        // Unused stdio would keep pipes open
        self.stdio = None;

        #[cfg(unix)]
        {
            match mode {
                StopMode::Graceful => {
                    info!("Gracefully stopping process with PID: {}", pid);
                    if send_signal(pid, libc::SIGTERM) {
                        info!("Sent SIGTERM to process {}", pid);
                    }
                    if !self.reap(self.grace).await {
                        warn!(
                            "Process {} still running after {:?}, sending SIGKILL",
                            pid, self.grace
                        );
                        send_signal(pid, libc::SIGKILL);
                        self.reap(self.grace).await;
                    }
                }
                StopMode::Force => {
                    info!("Force killing process with PID: {}", pid);
                    send_signal(pid, libc::SIGKILL);
                    self.reap(self.grace).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            warn!("Signals unavailable on this platform; dropping child {}", pid);
            // Aborting the wait task drops the Child, and kill_on_drop kills it
            if let Some(task) = self.wait_task.take() {
                task.abort();
            }
        }

        self.stop_stderr_monitor().await;

        // The wait task normally records the exit code; cover the case where
        // reaping timed out
        if self.is_running() {
            self.set_state(ProcessState::Stopped { exit_code: None });
        }

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn take_stdio(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };

        info!("Synchronously force killing process with PID: {}", pid);

        #[cfg(unix)]
        {
            send_signal(pid, libc::SIGKILL);
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        // Dropping the Child inside the wait task kills it where signals are unavailable
        #[cfg(not(unix))]
        if let Some(task) = self.wait_task.take() {
            task.abort();
        }

        self.set_state(ProcessState::Stopped { exit_code: None });
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ChildProcessManager {
        ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            None,
        )
        .with_grace_period(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_child_process_manager_lifecycle() {
        let mut manager = sh("sleep 5");
        assert!(!manager.is_running());

        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert!(manager.pid().is_some());

        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(!manager.is_running());
        assert!(matches!(manager.get_state(), ProcessState::Stopped { .. }));
    }

    #[tokio::test]
    async fn test_natural_exit_records_exit_code() {
        let mut manager = sh("exit 3");
        manager.start().await.unwrap();

        for _ in 0..100 {
            if !manager.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            manager.get_state(),
            ProcessState::Stopped { exit_code: Some(3) }
        );

        // Stopping an exited process just reaps it
        manager.stop(StopMode::Graceful).await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_stop_escalates_to_kill() {
        let mut manager = sh("trap '' TERM; while true; do sleep 1; done")
            .with_grace_period(Duration::from_millis(200));
        manager.start().await.unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_stderr_monitoring() {
        let mut manager = sh("echo 'error message' >&2; sleep 1");

        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&lines);
        manager.on_stderr_line(move |line| {
            if let Ok(mut lines) = lines_clone.lock() {
                lines.push(line);
            }
        });

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop(StopMode::Force).await.unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.first().map(String::as_str), Some("error message"));

        let captured = manager.stderr_log().snapshot();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].line, "error message");
    }

    #[tokio::test]
    async fn test_env_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("SIMPLEMCP_TEST_VALUE".to_string(), "forty-two".to_string());

        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                "echo \"$SIMPLEMCP_TEST_VALUE\" >&2; pwd >&2".to_string(),
            ],
            Some(dir.path().to_path_buf()),
        )
        .with_env(env);

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop(StopMode::Graceful).await.unwrap();

        let lines: Vec<String> = manager
            .stderr_log()
            .snapshot()
            .into_iter()
            .map(|l| l.line)
            .collect();
        assert_eq!(lines.first().map(String::as_str), Some("forty-two"));
        let expected = dir.path().canonicalize().unwrap();
        let reported = PathBuf::from(&lines[1]).canonicalize().unwrap();
        assert_eq!(reported, expected);
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut manager = sh("sleep 5");

        let result = manager.stop(StopMode::Graceful).await;
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.start().await.unwrap();
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::AlreadyStarted)));

        manager.stop(StopMode::Force).await.unwrap();

        // A stopped manager cannot be restarted
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut manager = ChildProcessManager::new(
            "/nonexistent/simplemcp-test-binary".to_string(),
            vec![],
            None,
        );
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
        assert_eq!(manager.get_state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_take_stdio_once() {
        let mut manager = sh("cat");

        assert!(matches!(manager.take_stdio(), Err(ProcessError::NotStarted)));

        manager.start().await.unwrap();
        let _stdio = manager.take_stdio().unwrap();
        assert!(matches!(manager.take_stdio(), Err(ProcessError::NotStarted)));

        manager.stop(StopMode::Graceful).await.unwrap();
    }

    #[test]
    fn test_stderr_log_is_bounded() {
        let log = StderrLog::new(2);
        log.push("one".to_string());
        log.push("two".to_string());
        log.push("three".to_string());

        let lines: Vec<String> = log.snapshot().into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["two", "three"]);

        let disabled = StderrLog::new(0);
        disabled.push("ignored".to_string());
        assert!(disabled.snapshot().is_empty());
    }

    #[test]
    fn test_process_state_methods() {
        assert!(!ProcessState::NotStarted.is_running());
        assert!(ProcessState::NotStarted.pid().is_none());

        let running = ProcessState::Running { pid: 12345 };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(12345));

        let stopped = ProcessState::Stopped { exit_code: Some(0) };
        assert!(!stopped.is_running());
        assert!(stopped.pid().is_none());
    }
}
