//! Configuration for MCP client connections
//!
//! Provides ClientConfig with a validating builder. Everything has a default
//! except the server command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::io::process::DEFAULT_STDERR_CAPACITY;
use crate::mcp::handshake::Implementation;
use crate::mcp::jsonrpc_utils::LATEST_PROTOCOL_VERSION;
use crate::mcp::messages::Message;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default timeout for the initialize handshake (10 seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default timeout for `Connection::request` (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default grace period for in-flight requests and process exit on close (5 seconds)
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Maximum allowed handshake timeout (5 minutes)
///
/// A server that needs longer than this to answer `initialize` is treated as
/// misconfigured rather than slow.
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 300;

/// Environment variable naming the server command for the CLI
pub const SERVER_COMMAND_ENV: &str = "SIMPLEMCP_SERVER_COMMAND";

/// Callback for messages the server sends on its own initiative
pub type NotificationHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback for each line the server writes to stderr
pub type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Server command must not be empty")]
    EmptyCommand,

    #[error("Invalid {name} timeout {value:?}: {reason}")]
    InvalidTimeout {
        name: &'static str,
        value: Duration,
        reason: &'static str,
    },

    #[error("Invalid working directory {working_dir}: {source}")]
    WorkingDirectoryValidation {
        working_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol version must not be empty")]
    EmptyProtocolVersion,
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// How request identifiers are allocated after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// Integers counting up from 2 (1 is the handshake)
    #[default]
    Sequential,
    /// Random UUID v4 strings
    Uuid,
}

/// Complete configuration for one client connection
#[derive(Clone)]
pub struct ClientConfig {
    /// Server executable
    pub command: String,

    /// Server command-line arguments
    pub args: Vec<String>,

    /// Working directory for the server process (inherits ours if unset)
    pub working_directory: Option<PathBuf>,

    /// Extra environment variables for the server process
    pub env: HashMap<String, String>,

    /// Protocol version requested during the handshake
    pub protocol_version: String,

    /// Client identification sent as `clientInfo`
    pub client_info: Implementation,

    /// Capabilities advertised during the handshake
    pub capabilities: Value,

    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,

    pub id_strategy: IdStrategy,

    /// Number of stderr lines kept for diagnostics
    pub stderr_capacity: usize,

    pub stderr_handler: Option<StderrHandler>,
    pub notification_handler: Option<NotificationHandler>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("protocol_version", &self.protocol_version)
            .field("client_info", &self.client_info)
            .field("capabilities", &self.capabilities)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("id_strategy", &self.id_strategy)
            .field("stderr_capacity", &self.stderr_capacity)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .field(
                "notification_handler",
                &self.notification_handler.as_ref().map(|_| "Fn(Message)"),
            )
            .finish()
    }
}

impl ClientConfig {
    pub fn builder(command: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(command)
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for ClientConfig with validation and defaults
pub struct ClientConfigBuilder {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: HashMap<String, String>,
    protocol_version: Option<String>,
    client_info: Option<Implementation>,
    capabilities: Option<Value>,
    handshake_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
    id_strategy: IdStrategy,
    stderr_capacity: Option<usize>,
    stderr_handler: Option<StderrHandler>,
    notification_handler: Option<NotificationHandler>,
}

impl ClientConfigBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            env: HashMap::new(),
            protocol_version: None,
            client_info: None,
            capabilities: None,
            handshake_timeout: None,
            request_timeout: None,
            shutdown_grace: None,
            id_strategy: IdStrategy::default(),
            stderr_capacity: None,
            stderr_handler: None,
            notification_handler: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    pub fn client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Some(Implementation {
            name: name.into(),
            version: version.into(),
        });
        self
    }

    pub fn capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    pub fn stderr_capacity(mut self, lines: usize) -> Self {
        self.stderr_capacity = Some(lines);
        self
    }

    /// Set the stderr handler for process monitoring
    pub fn stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Receive server-initiated notifications and requests
    pub fn notification_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.notification_handler = Some(Arc::new(handler));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        if let Some(dir) = &self.working_directory {
            Self::validate_working_directory(dir)?;
        }

        let protocol_version = self
            .protocol_version
            .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string());
        if protocol_version.trim().is_empty() {
            return Err(ConfigError::EmptyProtocolVersion);
        }

        let handshake_timeout = self
            .handshake_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS));
        let request_timeout = self
            .request_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
        let shutdown_grace = self
            .shutdown_grace
            .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS));

        Self::validate_timeouts(handshake_timeout, request_timeout)?;

        Ok(ClientConfig {
            command: self.command,
            args: self.args,
            working_directory: self.working_directory,
            env: self.env,
            protocol_version,
            client_info: self.client_info.unwrap_or_default(),
            capabilities: self.capabilities.unwrap_or_else(|| json!({})),
            handshake_timeout,
            request_timeout,
            shutdown_grace,
            id_strategy: self.id_strategy,
            stderr_capacity: self.stderr_capacity.unwrap_or(DEFAULT_STDERR_CAPACITY),
            stderr_handler: self.stderr_handler,
            notification_handler: self.notification_handler,
        })
    }

    /// Validate working directory exists and is a directory
    fn validate_working_directory(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::WorkingDirectoryValidation {
                working_dir: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Working directory does not exist",
                ),
            });
        }

        if !path.is_dir() {
            return Err(ConfigError::WorkingDirectoryValidation {
                working_dir: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Working directory path is not a directory",
                ),
            });
        }

        Ok(())
    }

    fn validate_timeouts(handshake: Duration, request: Duration) -> Result<(), ConfigError> {
        if handshake.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "handshake",
                value: handshake,
                reason: "must be greater than zero",
            });
        }
        if handshake > Duration::from_secs(MAX_HANDSHAKE_TIMEOUT_SECS) {
            return Err(ConfigError::InvalidTimeout {
                name: "handshake",
                value: handshake,
                reason: "exceeds maximum of 300 seconds",
            });
        }
        if request.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "request",
                value: request,
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::builder("server").build().unwrap();
        assert_eq!(config.command, "server");
        assert!(config.args.is_empty());
        assert_eq!(config.protocol_version, LATEST_PROTOCOL_VERSION);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.id_strategy, IdStrategy::Sequential);
        assert_eq!(config.client_info.name, "simplemcp");
        assert_eq!(config.capabilities, json!({}));
    }

    #[test]
    fn test_builder_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::builder("python3")
            .arg("-m")
            .args(["demo_server", "--stdio"])
            .working_directory(dir.path())
            .env("DEMO", "1")
            .protocol_version("2024-11-05")
            .client_info("inspector", "9.9")
            .handshake_timeout(Duration::from_secs(2))
            .id_strategy(IdStrategy::Uuid)
            .stderr_capacity(8)
            .stderr_handler(|_| {})
            .build()
            .unwrap();

        assert_eq!(config.args, vec!["-m", "demo_server", "--stdio"]);
        assert_eq!(config.working_directory.as_deref(), Some(dir.path()));
        assert_eq!(config.env.get("DEMO").map(String::as_str), Some("1"));
        assert_eq!(config.protocol_version, "2024-11-05");
        assert_eq!(config.client_info.version, "9.9");
        assert_eq!(config.id_strategy, IdStrategy::Uuid);
        assert_eq!(config.stderr_capacity, 8);
        assert!(format!("{config:?}").contains("Fn(String)"));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            ClientConfig::builder("  ").build(),
            Err(ConfigError::EmptyCommand)
        ));
    }

    #[test]
    fn test_timeout_validation() {
        let zero = ClientConfig::builder("server")
            .handshake_timeout(Duration::ZERO)
            .build();
        assert!(matches!(
            zero,
            Err(ConfigError::InvalidTimeout { name: "handshake", .. })
        ));

        let too_long = ClientConfig::builder("server")
            .handshake_timeout(Duration::from_secs(MAX_HANDSHAKE_TIMEOUT_SECS + 1))
            .build();
        assert!(too_long.is_err());

        let zero_request = ClientConfig::builder("server")
            .request_timeout(Duration::ZERO)
            .build();
        assert!(matches!(
            zero_request,
            Err(ConfigError::InvalidTimeout { name: "request", .. })
        ));
    }

    #[test]
    fn test_working_directory_validation() {
        let missing = ClientConfig::builder("server")
            .working_directory("/nonexistent/simplemcp/dir")
            .build();
        assert!(matches!(
            missing,
            Err(ConfigError::WorkingDirectoryValidation { .. })
        ));

        let file = tempfile::NamedTempFile::new().unwrap();
        let not_dir = ClientConfig::builder("server")
            .working_directory(file.path())
            .build();
        assert!(matches!(
            not_dir,
            Err(ConfigError::WorkingDirectoryValidation { .. })
        ));
    }

    #[test]
    fn test_empty_protocol_version_rejected() {
        assert!(matches!(
            ClientConfig::builder("server").protocol_version("").build(),
            Err(ConfigError::EmptyProtocolVersion)
        ));
    }
}
