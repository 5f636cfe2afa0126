//! Test utilities and global setup
//!
//! Test logging plus scripted `sh` peers that stand in for MCP servers.

use std::time::Duration;

use crate::config::{ClientConfig, ClientConfigBuilder};

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally; safe to call multiple times
    ///
    /// Respects `RUST_LOG` and writes through the test writer so output is
    /// captured per test.
    ///
    /// ```bash
    /// RUST_LOG=simplemcp=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Install test logging for every test in the invoking module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Successful `initialize` reply a scripted peer sends for id 1
pub const INIT_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"peer","version":"0.0.1"}}}"#;

/// Config for a peer running `sh -c <script>`, with short test timeouts
pub fn sh_peer(script: &str) -> ClientConfigBuilder {
    ClientConfig::builder("sh")
        .arg("-c")
        .arg(script)
        .handshake_timeout(Duration::from_secs(5))
        .request_timeout(Duration::from_secs(5))
        .shutdown_grace(Duration::from_millis(500))
}

/// Prefix `body` with a successful handshake: answer `initialize`, then
/// consume `notifications/initialized`
pub fn after_handshake(body: &str) -> String {
    format!("read -r _; echo '{INIT_REPLY}'; read -r _; {body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::messages::{Message, decode};

    #[test]
    fn test_init_reply_is_a_valid_response() {
        let message = decode(INIT_REPLY.as_bytes()).unwrap();
        assert!(matches!(message, Message::Response(ref r) if !r.is_error()));
    }

    #[test]
    fn test_sh_peer_config() {
        let config = sh_peer("cat").build().unwrap();
        assert_eq!(config.command, "sh");
        assert_eq!(config.args, vec!["-c", "cat"]);
        assert!(after_handshake("exit 0").ends_with("read -r _; exit 0"));
    }
}
