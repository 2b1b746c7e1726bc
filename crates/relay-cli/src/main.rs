//! CLI entry point for relay.
//!
//! This binary provides the `relay` command with subcommands for running the
//! demo extensions, calling a service, and checking configuration.

mod cli;
mod config;
mod demos;
mod helpers;
mod runtime;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use relay_kernel::Dispatcher;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::RelayConfig;
use crate::helpers::{init_tracing, parse_call_args, render};
use crate::runtime::Relay;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Run => cmd_run(&config).await,
        Commands::Call {
            service,
            method,
            args,
        } => cmd_call(&config, &service, &method, &args).await,
        Commands::CheckConfig { path } => cmd_check_config(&path),
        Commands::Extensions => cmd_extensions(),
    }
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    let config = RelayConfig::load(path)?;
    init_tracing(&config.log_level, config.json_logs);
    info!(path = %path.display(), extensions = config.extensions.len(), "configuration loaded");
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let relay = Relay::start(&config).await?;

    println!();
    println!("  relay v{}", env!("CARGO_PKG_VERSION"));
    println!("  {} sandbox(es) attached", relay.coordinator.sandbox_count());
    println!();

    let client = relay.client().await;
    for (service, peer) in relay.coordinator.directory_snapshot() {
        match client.call(&service, "getInfo", Vec::new()).await {
            Ok(details) => println!("  {service:<20} {details}  (sandbox {peer})"),
            Err(err) => println!("  {service:<20} error: {err}"),
        }
    }
    println!();

    for (peer, state) in relay.host.loader_states() {
        info!(peer = %peer, state = %state, "loader");
    }

    relay.shutdown().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: call
// ---------------------------------------------------------------------------

async fn cmd_call(config_path: &Path, service: &str, method: &str, raw_args: &[String]) -> Result<()> {
    let config = load_config(config_path)?;
    let relay = Relay::start(&config).await?;

    let outcome = relay.call(service, method, parse_call_args(raw_args)).await;
    relay.shutdown().await;

    println!("{}", render(&outcome?)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(path: &Path) -> Result<()> {
    let config = RelayConfig::load_existing(path)?;
    let catalog = demos::catalog();

    let unknown: Vec<&str> = config
        .extensions
        .iter()
        .map(String::as_str)
        .filter(|location| !catalog.contains(location))
        .collect();
    anyhow::ensure!(
        unknown.is_empty(),
        "{} lists unknown extension(s): {}",
        path.display(),
        unknown.join(", ")
    );

    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("{} is valid:\n\n{rendered}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: extensions
// ---------------------------------------------------------------------------

fn cmd_extensions() -> Result<()> {
    for location in demos::catalog().locations() {
        println!("{location}");
    }
    Ok(())
}
