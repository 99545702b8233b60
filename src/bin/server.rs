//! Burrow relay server
//!
//! Public side of the reverse tunnel:
//! - Accepts client control connections and performs the handshake
//! - Exposes client services on server-assigned public ports
//! - Carries public traffic back over pooled, multiplexed pipe connections

use anyhow::{Context, Result};
use burrow::config::EncryptMode;
use burrow::{Config, Relay};
use clap::Parser;
use tracing::info;

/// Reverse-tunnel relay server
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Reverse-tunnel relay server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "burrow.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Control listen address (overrides config)
    #[arg(long)]
    control_listen: Option<String>,

    /// Pipe listen address (overrides config)
    #[arg(long)]
    pipe_listen: Option<String>,

    /// Public domain advertised in tunnel addresses (overrides config)
    #[arg(long)]
    domain: Option<String>,

    /// Pipe encryption mode: none or aes (overrides config)
    #[arg(long)]
    encrypt_mode: Option<EncryptMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    if args.example_config {
        let text = toml::to_string_pretty(&Config::default())
            .context("Failed to render example config")?;
        print!("{}", text);
        return Ok(());
    }

    // Load configuration; a missing file falls back to defaults so the
    // server can run from flags alone
    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        info!("No config file at {}, using defaults", args.config);
        Config::default()
    };

    if let Some(control_listen) = args.control_listen {
        config.server.control_listen = control_listen;
    }
    if let Some(pipe_listen) = args.pipe_listen {
        config.server.pipe_listen = pipe_listen;
    }
    if let Some(domain) = args.domain {
        config.server.domain = domain;
    }
    if let Some(encrypt_mode) = args.encrypt_mode {
        config.server.encrypt_mode = encrypt_mode;
    }

    info!("Burrow relay v{}", burrow::VERSION);

    let relay = Relay::bind(config.server)
        .await
        .context("Failed to bind listeners")?;

    tokio::select! {
        res = relay.run() => res.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    }
}
