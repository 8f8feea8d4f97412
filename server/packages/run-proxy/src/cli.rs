use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{load_config, ConfigError, ProxyConfig};
use crate::identity::{load_or_create_agent_id, IdentityError};
use crate::link::{outbox, run_link, LinkOptions};
use crate::proxy::sandbox_control::build_inventory;
use crate::proxy::{spawn_sweeper, ProxyContext, ProxyLink};
use crate::runs::close_agent;
use crate::sandbox::{now_rfc3339, SandboxProvider};

const DEFAULT_CONFIG_FILES: [&str; 2] = ["config.toml", "config.json"];

#[derive(Parser, Debug)]
#[command(name = "run-proxy", bin_name = "run-proxy")]
#[command(about = "Supervises sandboxed ACP agents for a remote orchestrator", version)]
pub struct RunProxyCli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (TOML or JSON). Defaults to ./config.toml, then ./config.json.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Named entry under `profiles` layered over the base config.
    #[arg(long, short = 'p', global = true)]
    profile: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Logfmt, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Connect to the orchestrator and serve runs until interrupted.
    Run,
    /// Print this host's agent id.
    Identity,
    /// Print the provider's managed sandbox instances as JSON.
    Inventory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Logfmt,
    Compact,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("no config file found (tried {0})")]
    ConfigNotFound(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn run_proxy() -> Result<(), CliError> {
    let cli = RunProxyCli::parse();
    init_logging(cli.log_format);
    let command = cli.command.unwrap_or(Command::Run);
    match command {
        Command::Run => {
            let config = load(&cli)?;
            run_command(config)
        }
        Command::Identity => {
            // The config is optional here, it only contributes `agent.id`.
            let config = match config_path(cli.config.as_deref()) {
                Ok(path) => Some(load_config(&path, cli.profile.as_deref())?),
                Err(_) => None,
            };
            println!("{}", resolve_agent_id(config.as_ref())?);
            Ok(())
        }
        Command::Inventory => {
            let config = load(&cli)?;
            inventory_command(&config)
        }
    }
}

pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Logfmt => registry
            .with(
                tracing_logfmt::builder()
                    .layer()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load(cli: &RunProxyCli) -> Result<ProxyConfig, CliError> {
    let path = config_path(cli.config.as_deref())?;
    Ok(load_config(&path, cli.profile.as_deref())?)
}

pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| CliError::ConfigNotFound(DEFAULT_CONFIG_FILES.join(", ")))
}

/// `agent.id` from the config wins over the stored host identity.
pub fn resolve_agent_id(config: Option<&ProxyConfig>) -> Result<String, CliError> {
    let configured = config
        .and_then(|config| config.agent.id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty());
    match configured {
        Some(id) => Ok(id.to_string()),
        None => Ok(load_or_create_agent_id()?),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Runtime(err.to_string()))
}

fn run_command(config: ProxyConfig) -> Result<(), CliError> {
    let agent_id = resolve_agent_id(Some(&config))?;
    let options = LinkOptions::new(
        config.orchestrator_url.clone(),
        config.auth_token().map(str::to_string),
        Duration::from_secs(config.heartbeat_seconds),
    );
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let (outbox, outbox_rx) = outbox();
        let ctx = ProxyContext::new(config, agent_id, outbox)
            .map_err(|err| CliError::Runtime(err.to_string()))?;
        tracing::info!(
            agent_id = %ctx.agent_id,
            provider = ctx.sandbox.name(),
            agent_mode = ctx.sandbox.agent_mode().as_str(),
            url = %options.url,
            "run-proxy starting"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(ctx.clone(), shutdown_rx.clone());
        let link = tokio::spawn(run_link(
            options,
            Arc::new(ProxyLink::new(ctx.clone())),
            outbox_rx,
            shutdown_rx,
        ));

        wait_for_shutdown_signal().await;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
        let _ = link.await;
        let _ = sweeper.await;

        for run in ctx.runs.drain().await {
            close_agent(&run, "shutdown").await;
        }
        Ok(())
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn inventory_command(config: &ProxyConfig) -> Result<(), CliError> {
    let sandbox = SandboxProvider::from_config(&config.sandbox)
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    let runtime = build_runtime()?;
    let instances = runtime
        .block_on(sandbox.list_instances(true))
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    let inventory = build_inventory(sandbox.name(), sandbox.runtime(), &now_rfc3339(), &instances, None);
    println!("{}", serde_json::to_string_pretty(&inventory)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_command() {
        let cli = RunProxyCli::try_parse_from(["run-proxy", "--config", "proxy.toml"]).expect("parse");
        assert_eq!(cli.command, None);
        assert_eq!(cli.config.as_deref(), Some(Path::new("proxy.toml")));
        assert_eq!(cli.log_format, LogFormat::Logfmt);

        let cli = RunProxyCli::try_parse_from(["run-proxy", "inventory", "--profile", "ci", "--log-format", "compact"])
            .expect("parse");
        assert_eq!(cli.command, Some(Command::Inventory));
        assert_eq!(cli.profile.as_deref(), Some("ci"));
        assert_eq!(cli.log_format, LogFormat::Compact);

        assert!(RunProxyCli::try_parse_from(["run-proxy", "--log-format", "json"]).is_err());
    }

    #[test]
    fn explicit_config_path_is_used_as_is() {
        let path = config_path(Some(Path::new("/nonexistent/proxy.toml"))).expect("path");
        assert_eq!(path, PathBuf::from("/nonexistent/proxy.toml"));
    }
}
