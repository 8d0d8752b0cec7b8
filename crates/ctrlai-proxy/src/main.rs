//! CtrlAI proxy server binary.
//!
//! A transparent HTTP proxy between agent SDKs and LLM providers that
//! inspects tool invocations, enforces guardrail rules, maintains a
//! hash-chained audit log, and honours a per-agent kill switch.

use clap::{Parser, Subcommand};
use ctrlai_core::{default_state_dir, Config};
use ctrlai_proxy::server::{build_router, build_state, spawn_hot_reload};
use std::path::PathBuf;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// CtrlAI transparent guardrail proxy for AI agents.
#[derive(Parser)]
#[command(name = "ctrlai-proxy", version, about, long_about = None)]
struct Cli {
    /// Path to the state directory (default: ~/.ctrlai).
    #[arg(short, long, global = true, env = "CTRLAI_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Path to the YAML configuration file (default: <state-dir>/config.yaml).
    #[arg(short, long, global = true, env = "CTRLAI_CONFIG")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "CTRLAI_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override log output format (text, json).
    #[arg(long, global = true, env = "CTRLAI_LOG_FORMAT")]
    log_format: Option<String>,

    /// Subcommand to run. If omitted, starts the proxy server.
    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file and print resolved settings.
    Validate,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let state_dir = cli.state_dir.clone().unwrap_or_else(default_state_dir);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.yaml"));

    let mut config = Config::load(&config_path)?;
    if let Some(ref level) = cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(ref format) = cli.log_format {
        config.logging.format.clone_from(format);
    }

    match cli.command {
        Some(Commands::Validate) => run_validate(&config),
        None => {
            init_logging(&config)?;
            run_proxy(config, state_dir).await
        }
    }
}

/// Validate configuration and print resolved settings.
fn run_validate(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    println!("Configuration is valid.\n");
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Initialize structured logging. `RUST_LOG` takes precedence over the
/// configured level.
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

/// Start the proxy server and block until shutdown.
async fn run_proxy(config: Config, state_dir: PathBuf) -> anyhow::Result<()> {
    let listen_addr = config.listen_addr();
    info!(
        %listen_addr,
        state_dir = %state_dir.display(),
        providers = config.providers.len(),
        "starting CtrlAI proxy"
    );

    let state = build_state(config, &state_dir).await?;
    state.audit.log_lifecycle("proxy started", None).await;

    let watcher_handle = spawn_hot_reload(std::sync::Arc::clone(&state));
    let app = build_router(std::sync::Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(%listen_addr, "proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Persist what only lives in memory, then seal the log.
    info!("shutting down");
    watcher_handle.abort();
    state.audit.log_lifecycle("proxy stopped", None).await;
    if let Err(e) = state.registry.save() {
        tracing::error!(error = %e, "failed to persist agent registry");
    }
    state.audit.close().await;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received");
    }
}
