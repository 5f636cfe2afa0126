//! Logging setup for the client library and CLI
//!
//! Output goes to stderr by default (stdout of the *server* is protocol
//! traffic, and the CLI prints results on its own stdout). Configured from
//! `RUST_LOG` plus the `SIMPLEMCP_LOG_*` variables, with CLI overrides.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Append-mode log file; unset means stderr only
pub const LOG_FILE_ENV: &str = "SIMPLEMCP_LOG_FILE";

/// When "true", the log file name gets the process id inserted
pub const LOG_UNIQUE_ENV: &str = "SIMPLEMCP_LOG_UNIQUE";

/// When "true", events are written as JSON objects
pub const LOG_JSON_ENV: &str = "SIMPLEMCP_LOG_JSON";

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Global subscriber already installed: {0}")]
    Init(String),
}

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive (e.g. "debug", "simplemcp=trace,info")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL.to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("RUST_LOG")
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LEVEL.to_string());

        let unique = is_enabled(lookup(LOG_UNIQUE_ENV));
        let file_path = lookup(LOG_FILE_ENV)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .map(|path| {
                if unique {
                    unique_log_path(&path, std::process::id())
                } else {
                    path
                }
            });

        Self {
            level,
            file_path,
            json_format: is_enabled(lookup(LOG_JSON_ENV)),
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(
        mut self,
        level: Option<String>,
        file_path: Option<PathBuf>,
        json_format: bool,
    ) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self.json_format |= json_format;
        self
    }
}

fn is_enabled(value: Option<String>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Insert `pid` before the extension: `client.log` becomes `client.<pid>.log`
pub fn unique_log_path(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let file_name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem.to_string_lossy(), pid, ext.to_string_lossy()),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(file_name)
}

/// Install the global subscriber described by `config`
///
/// Fails instead of panicking when a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let env_filter = EnvFilter::try_new(&config.level).map_err(|e| LogError::Filter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })?;

    let layer = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogError::File {
                    path: path.clone(),
                    source,
                })?;
            let writer = Mutex::new(file);
            if config.json_format {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .boxed()
            }
        }
        None if config.json_format => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_ansi(false)
            .boxed(),
        None => fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()
        .map_err(|e| LogError::Init(e.to_string()))
}

/// Log one protocol message on a single structured line
#[macro_export]
macro_rules! log_mcp_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = %$data,
            pid = std::process::id(),
            "MCP message"
        );
    };
}

/// Log how long an operation took
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis() as u64,
            pid = std::process::id(),
            "Performance timing"
        );
    };
}
