//! Tunsox CLI
//!
//! Runs the tunsox engine from command-line flags and/or a TOML file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunsox_engine::{parse_log_level, Engine, Key};

/// Tunsox - route TUN traffic through a proxy
#[derive(Parser)]
#[command(name = "tunsox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; values in it override flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    key: KeyArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tunsox.toml")]
        output: PathBuf,
    },
}

/// Engine settings given as flags
#[derive(Args, Debug, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct KeyArgs {
    /// Use this device [driver://]name
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,

    /// Use this proxy [protocol://]host[:port]
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<String>,

    /// Set device maximum transmission unit
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u32>,

    /// Set firewall mark (Linux only)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    fwmark: Option<u32>,

    /// HTTP statistics server listen address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    restapi: Option<String>,

    /// Log level [debug|info|warning|error|silent]
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    loglevel: Option<String>,

    /// Use network interface to dial
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    interface: Option<String>,

    /// Enable TCP receive buffer auto-tuning
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    tcp_moderate_receive_buffer: bool,

    /// Set TCP send buffer size
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    tcp_send_buffer_size: Option<String>,

    /// Set TCP receive buffer size
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    tcp_receive_buffer_size: Option<String>,

    /// Set timeout for each UDP session, e.g. 30s
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    udp_timeout: Option<String>,

    /// Answer DNS A-queries with fake IPs resolved by the proxy
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    remote_dns: bool,

    /// Fake-IP network for remote DNS
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_dns_net_ipv4: Option<String>,

    /// Upstream resolver for queries that are not answered locally
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    xpt_dns: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenConfig { output }) => generate_config(output),
        None => run(cli.key, cli.config.as_deref()).await,
    }
}

fn init_logging(level: &str) {
    let level = parse_log_level(level)
        .map(|l| l.to_string().to_ascii_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: KeyArgs, config_path: Option<&Path>) -> Result<()> {
    let file = config_path
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read configuration from {:?}", path))
        })
        .transpose()?;
    let key = build_key(&args, file.as_deref())?;

    init_logging(&key.loglevel);
    if let Some(path) = config_path {
        info!("Configuration loaded from {:?}", path);
    }

    let engine = Engine::new();
    engine.insert(key).await?;

    if let Err(e) = engine.start().await {
        error!("Failed to start: {}", e);
        if let Err(e) = engine.stop().await {
            warn!("Failed to release resources: {}", e);
        }
        std::process::exit(1);
    }

    wait_for_shutdown().await;
    info!("Shutting down...");

    if let Err(e) = engine.stop().await {
        error!("Failed to stop: {}", e);
    }
    Ok(())
}

/// Combine flags with the file contents; file values win
fn build_key(args: &KeyArgs, file: Option<&str>) -> Result<Key> {
    let mut merged = match toml::Value::try_from(args).context("Failed to encode flags")? {
        toml::Value::Table(table) => table,
        _ => toml::Table::new(),
    };
    if let Some(content) = file {
        let table: toml::Table =
            toml::from_str(content).context("Failed to parse configuration")?;
        merged.extend(table);
    }

    let key: Key = toml::Value::Table(merged)
        .try_into()
        .context("Invalid configuration")?;
    key.validate().context("Invalid configuration")?;
    Ok(key)
}

fn generate_config(output: PathBuf) -> Result<()> {
    std::fs::write(&output, Key::sample())
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the proxy and device settings before running.");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C");
    }
}
