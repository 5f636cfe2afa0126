use clap::Parser;
use serde_json::Value;
use simplemcp::config::SERVER_COMMAND_ENV;
use simplemcp::logging::{LogConfig, init_logging};
use simplemcp::{ClientConfig, Connection, IdStrategy, Params};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// CLI arguments for the MCP stdio client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server command and its arguments; the command falls back to
    /// SIMPLEMCP_SERVER_COMMAND when omitted
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    server: Vec<String>,

    /// Method to call once connected (e.g. tools/list)
    #[arg(long, value_name = "METHOD")]
    method: Option<String>,

    /// JSON object passed as the request params
    #[arg(long, value_name = "JSON", requires = "method")]
    params: Option<String>,

    /// Working directory for the server process
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Seconds to wait for the initialize handshake
    #[arg(long, value_name = "SECS")]
    handshake_timeout: Option<u64>,

    /// Seconds to wait for the request result
    #[arg(long, value_name = "SECS")]
    request_timeout: Option<u64>,

    /// Use UUID strings instead of integers as request ids
    #[arg(long)]
    uuid_ids: bool,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides SIMPLEMCP_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// Split the positional arguments into command and server args
///
/// Priority: positional command > SIMPLEMCP_SERVER_COMMAND
fn resolve_server_command(server: &[String]) -> Option<(String, Vec<String>)> {
    match server.split_first() {
        Some((command, args)) => Some((command.clone(), args.to_vec())),
        None => std::env::var(SERVER_COMMAND_ENV)
            .ok()
            .filter(|command| !command.trim().is_empty())
            .map(|command| (command, Vec::new())),
    }
}

fn parse_params(raw: Option<&str>) -> Result<Option<Params>, String> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(params)) => Ok(Some(params)),
        Ok(other) => Err(format!("--params must be a JSON object, got {other}")),
        Err(e) => Err(format!("--params is not valid JSON: {e}")),
    }
}

fn build_config(
    args: &Args,
    command: String,
    server_args: Vec<String>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut builder = ClientConfig::builder(command).args(server_args);

    if let Some(cwd) = &args.cwd {
        builder = builder.working_directory(cwd);
    }
    if let Some(secs) = args.handshake_timeout {
        builder = builder.handshake_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.request_timeout {
        builder = builder.request_timeout(Duration::from_secs(secs));
    }
    if args.uuid_ids {
        builder = builder.id_strategy(IdStrategy::Uuid);
    }

    builder = builder.notification_handler(|message| {
        if let Some(method) = message.method() {
            info!("Server message: {}", method);
        }
    });

    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(
        args.log_level.clone(),
        args.log_file.clone(),
        args.log_json,
    );
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let Some((command, server_args)) = resolve_server_command(&args.server) else {
        eprintln!("No server command given (pass COMMAND or set {SERVER_COMMAND_ENV})");
        std::process::exit(2);
    };

    let params = match parse_params(args.params.as_deref()) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let config = build_config(&args, command, server_args)?;
    info!("Starting MCP server: {} {:?}", config.command, config.args);

    let connection = Connection::connect(config).await?;

    let output = match &args.method {
        Some(method) => connection.request(method, params).await.map(Value::Object),
        None => serde_json::to_value(connection.initialize_result())
            .map_err(|e| simplemcp::ClientError::Protocol(e.to_string())),
    };

    if let Err(e) = connection.close().await {
        warn!("Shutdown did not complete cleanly: {}", e);
    }

    let output = output?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
