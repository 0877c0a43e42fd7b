//! CLI command implementations
//!
//! `serve` is the only long-running command. The others build the
//! coordinator (or a client), do one thing, print one JSON line and exit.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::command_plane::{ClientSettings, CommandPlaneClient};
use crate::config::{CoordinatorConfig, DEFAULT_CONFIG_PATH};
use crate::coordinator::Coordinator;
use crate::lock::ExclusivityToken;
use crate::observability::{init_logging, Event, LogFormat};
use crate::recording::RecordingSession;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config, port } => serve(&config, port),
        Command::Status { config } => status(&config),
        Command::Reclaim { config } => reclaim(&config),
        Command::Client {
            action,
            params,
            id,
            url,
            config,
            timeout_ms,
        } => client(&config, url, &action, params.as_deref(), id, timeout_ms),
    }
}

/// Load the config file. A missing file at the default location means
/// defaults; a missing file anywhere else is an error.
pub fn load_config(path: &Path) -> CliResult<CoordinatorConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
        return Ok(CoordinatorConfig::default());
    }
    Ok(CoordinatorConfig::load(path)?)
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))
}

/// Boot, start maintenance and serve until ctrl-c
pub fn serve(config_path: &Path, port: Option<u16>) -> CliResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.http.port = port;
    }
    init_logging(config.log_format);
    crate::observability::emit(
        Event::ConfigLoaded,
        &format!("config loaded from {}", config_path.display()),
    );

    let rt = runtime()?;
    rt.block_on(async {
        let coordinator = Coordinator::build(config)?;
        let report = coordinator.run().await?;
        tracing::info!(recovery = ?report.recovery.outcome, "coordinator stopped");
        Ok::<(), CliError>(())
    })
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    token: ExclusivityToken,
    session: Option<RecordingSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_error: Option<String>,
}

/// Print the persisted token and session records
pub fn status(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    init_logging(LogFormat::Text);

    let coordinator = Coordinator::build(config)?;
    let token = coordinator.lock().token()?;
    let (session, session_error) = match coordinator.recording().persisted_session() {
        Ok(session) => (session, None),
        Err(e) if e.is_corrupt() => (None, Some(e.to_string())),
        Err(e) => return Err(e.into()),
    };

    write_response(&StatusOutput {
        token,
        session,
        session_error,
    })
}

/// Run one stale-token reclaim pass
pub fn reclaim(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    init_logging(LogFormat::Text);

    let coordinator = Coordinator::build(config)?;
    let reclaimed = coordinator.lock().reclaim_stale()?;

    write_response(&serde_json::json!({
        "reclaimed": reclaimed.is_some(),
        "previous": reclaimed,
    }))
}

/// Parse `--params`; absent means no params
pub fn parse_params(raw: Option<&str>) -> CliResult<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| CliError::invalid_argument(format!("--params is not valid JSON: {}", e)))?;
    if !value.is_object() && !value.is_null() {
        return Err(CliError::invalid_argument("--params must be a JSON object"));
    }
    Ok(value)
}

/// Send one command and print its result
pub fn client(
    config_path: &Path,
    url: Option<String>,
    action: &str,
    params: Option<&str>,
    id: Option<String>,
    timeout_ms: u64,
) -> CliResult<()> {
    let config = load_config(config_path)?;
    let params = parse_params(params)?;
    init_logging(LogFormat::Text);

    let url = url.unwrap_or_else(|| config.http.ws_url());
    let mut settings = ClientSettings::from_config(url, &config.client);
    settings.subscriptions.clear();

    let rt = runtime()?;
    let outcome = rt.block_on(async {
        let client = CommandPlaneClient::connect(settings);
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let wait = Duration::from_millis(timeout_ms);
        let result =
            tokio::time::timeout(wait, client.command_with_id(&id, action, params)).await;
        client.shutdown().await;
        match result {
            Ok(outcome) => outcome.map_err(CliError::from),
            Err(_) => Err(CliError::client_failed(format!(
                "no result for command {} within {}ms",
                id, timeout_ms
            ))),
        }
    })?;

    if outcome.success {
        write_response(&outcome.data)
    } else {
        let (code, message) = outcome
            .error
            .as_ref()
            .map(|e| (e.code.as_str(), e.message.as_str()))
            .unwrap_or(("unknown_error", "command failed"));
        write_error(code, message, outcome.data.as_ref())?;
        Err(CliError::client_failed(format!("{} failed: {}", action, message)))
    }
}
