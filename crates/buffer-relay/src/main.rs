//! Buffer relay binary entry point.
//!
//! Usage: buffer-relay [--config FILE] [--redis-url URL] [--namespace NS] <command>

use anyhow::Context;
use buffer_relay::{Relay, RelayConfig};
use clap::{Parser, Subcommand};
use shutdown_coordinator::HookOutcome;
use std::path::PathBuf;
use tracing::{info, warn};
use write_behind_buffer::FileBackup;

/// Operator CLI for a Redis-backed write-behind buffer.
#[derive(Parser, Debug)]
#[command(name = "buffer-relay")]
#[command(about = "Inspect, sweep and drain a Redis-backed write-behind buffer")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON config file. Defaults to ~/.unbound/buffer/relay.json when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Key namespace of the buffer.
    #[arg(long, env = "RELAY_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG_LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print pending/inflight/retry/dead counts as JSON
    Stats {
        /// Print Prometheus text exposition instead of JSON
        #[arg(long)]
        prometheus: bool,
    },
    /// Run retry rollover and stuck-message redrive until interrupted
    Sweep,
    /// Move dead letters into a JSONL file
    ExportDeadLetters {
        /// Maximum number of records to export
        #[arg(long, default_value = "1000")]
        limit: usize,

        /// Output file (appended to)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn load_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = RelayConfig::load(args.config.as_deref()).context("loading relay config")?;
    if let Some(ref url) = args.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(ref ns) = args.namespace {
        config.buffer.namespace = ns.clone();
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    observability::init_with_config(observability::LogConfig {
        service_name: "buffer-relay".into(),
        default_level: config.log_level.clone(),
        also_stderr: true,
        ..Default::default()
    });

    let relay = Relay::connect(config).await?;

    match args.command {
        Command::Stats { prometheus } => {
            let counts = relay.stats().await?;
            if prometheus {
                print!("{}", relay.metrics().gather_text());
            } else {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            }
        }
        Command::Sweep => {
            info!("Recovery sweeper running, press ctrl-c to stop");
            match relay.sweep(shutdown_signal()).await {
                HookOutcome::Completed(report) if report.is_clean() => {}
                HookOutcome::Completed(report) => {
                    warn!(failed = report.failed(), "Sweeper did not stop cleanly");
                }
                HookOutcome::TimedOut => anyhow::bail!("shutdown deadline exceeded"),
                HookOutcome::Failed(e) => anyhow::bail!("shutdown failed: {}", e),
            }
        }
        Command::ExportDeadLetters { limit, out } => {
            let path = out.unwrap_or_else(|| relay.dead_letter_path());
            let report = relay
                .export_dead_letters(limit, &FileBackup::new(path))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
