//! `miniappd`: the mini-app host daemon.
//!
//! Serves the control API and the push channel, launches apps from the apps
//! directory on request, and runs until Ctrl+C.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use miniapp_config::{Config, LoadOptions};
use miniapp_host::Daemon;
use miniapp_telemetry::{LogConfig, LogFormat, setup_logging};

/// Mini-app host daemon.
#[derive(Parser)]
#[command(name = "miniappd")]
#[command(author, version, about = "Mini-app host daemon: control API, push channel and render servers")]
struct Args {
    /// Explicit config file, merged over `~/.miniapp/config.toml`.
    #[arg(short, long, env = "MINIAPP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the apps directory.
    #[arg(long)]
    apps_dir: Option<PathBuf>,

    /// Override the log level (`trace`, `debug`, `info`, `warn`, `error`).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the log format (`pretty`, `compact`, `json`, `full`).
    #[arg(long)]
    log_format: Option<LogFormat>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = miniapp_config::loader::load(&LoadOptions {
        explicit: args.config.clone(),
        ..LoadOptions::default()
    })
    .context("failed to load configuration")?;

    if let Some(dir) = &args.apps_dir {
        config.apps.dir.clone_from(dir);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let mut log_config = LogConfig::from_section(&config.logging)?;
    if let Some(format) = args.log_format {
        log_config = log_config.with_format(format);
    }
    if let Err(e) = setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let daemon = Daemon::start(&config)
        .await
        .context("failed to start daemon")?;
    println!(
        "miniappd: control API on http://{}, push channel on ws://{}",
        daemon.control_addr(),
        daemon.push_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    println!("\nShutting down miniappd...");

    daemon.shutdown().await;
    Ok(())
}
