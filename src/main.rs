//! Caracal - Intercepting HTTP/HTTPS Proxy
//!
//! Forwards plain HTTP transparently and man-in-the-middles HTTPS through a
//! TLS-terminating CONNECT tunnel. Every exchange is captured to PostgreSQL
//! and can be replayed or probed (path brute-force, hidden-parameter
//! discovery) through the control-plane API.

mod api;
mod capture;
mod config;
mod error;
mod proxy;
mod replay;
mod scanner;

pub use error::*;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::ApiState;
use crate::capture::PostgresStore;
use crate::config::Config;
use crate::proxy::{Outbound, ProxyServer, ScriptProvisioner};
use crate::replay::ReplayEngine;
use crate::scanner::Scanner;

/// Intercepting HTTP/HTTPS Proxy
#[derive(Parser, Debug)]
#[command(name = "caracal")]
#[command(author, version, about = "Intercepting HTTP/HTTPS proxy", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CARACAL_CONFIG")]
    config: Option<String>,

    /// Proxy listener port
    #[arg(short, long, env = "CARACAL_PROXY_PORT")]
    proxy_port: Option<u16>,

    /// Control-plane API port
    #[arg(long, env = "CARACAL_API_PORT")]
    api_port: Option<u16>,

    /// PostgreSQL connection URL
    #[arg(long, env = "CARACAL_DATABASE_URL")]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CARACAL_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "CARACAL_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "CARACAL_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls ring crypto provider (required for rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Caracal");

    let config = load_config(&cli)?;

    if cli.validate_config {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    run(config).await?;

    tracing::info!("Caracal shutting down gracefully");
    Ok(())
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let path = std::path::Path::new(log_path);
        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        let file_appender = match dir {
            Some(dir) => {
                let filename = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("caracal.log");
                RollingFileAppender::new(Rotation::DAILY, dir, filename)
            }
            None => {
                let log_dir = Config::data_dir()
                    .map(|d| d.join("logs"))
                    .unwrap_or_else(|_| std::path::PathBuf::from("."));
                std::fs::create_dir_all(&log_dir).ok();
                RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
            }
        };

        if cli.log_json {
            let file_layer = fmt::layer().json().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        } else {
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.proxy_port {
        config.proxy.port = port;
    }
    if let Some(port) = cli.api_port {
        config.api.port = port;
    }
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.proxy.port == 0 {
        anyhow::bail!("Proxy port cannot be 0");
    }

    if config.api.port == 0 {
        anyhow::bail!("API port cannot be 0");
    }

    if config.scanner.request_timeout == 0 {
        anyhow::bail!("Scanner request_timeout must be greater than 0");
    }

    if config.database.pool_size == 0 {
        anyhow::bail!("Database pool_size must be greater than 0");
    }

    Ok(())
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

/// Wire the engine together and serve until a shutdown signal arrives
async fn run(config: Config) -> Result<()> {
    let store = Arc::new(
        PostgresStore::connect(&config.database)
            .await
            .context("Failed to connect capture store")?,
    );

    let outbound = Arc::new(
        Outbound::new(&config.scanner.user_agent).context("Failed to build outbound transport")?,
    );
    let provisioner = Arc::new(ScriptProvisioner::new(&config.tls));

    let proxy = ProxyServer::new(
        &config.proxy,
        store.clone(),
        provisioner,
        outbound.clone(),
    );
    proxy.start().await.context("Failed to start proxy")?;

    let state = ApiState {
        store: store.clone(),
        replay: Arc::new(ReplayEngine::new(store.clone(), outbound.clone())),
        scanner: Arc::new(Scanner::new(outbound, &config.scanner)),
        wordlist: config.scanner.wordlist.clone(),
    };

    tokio::select! {
        result = api::serve(&config.api, state) => {
            result.context("API server terminated")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to register Ctrl+C handler");
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }
}
