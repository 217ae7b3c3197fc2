//! viiper - Virtual Input over IP EmulatoR
//!
//! CLI entry point. `viiper server` runs the USB/IP server plus the
//! management API; `viiper proxy` forwards USB/IP to another server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use devices::Catalog;
use server::config::Config;
use server::{ApiServer, ProxyServer, ServerState, UsbIpServer};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "viiper")]
#[command(version, about = "Virtual Input over IP EmulatoR")]
struct Cli {
    /// Log level: trace, debug, info, warn, error
    #[arg(long = "log.level", value_name = "LEVEL", env = "VIIPER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log file path (default: none; logs only to console)
    #[arg(long = "log.file", value_name = "PATH", env = "VIIPER_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Path to a TOML or JSON configuration file
    #[arg(long, value_name = "PATH", env = "VIIPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the VIIPER USB/IP server
    Server {
        /// Management API listen address
        #[arg(long, value_name = "ADDR", env = "VIIPER_API_ADDR")]
        api_addr: Option<String>,

        /// USB/IP listen address
        #[arg(long, value_name = "ADDR", env = "VIIPER_USBIP_ADDR")]
        usbip_addr: Option<String>,

        /// Seconds before auto-cleanup when a device has no active stream
        #[arg(
            long,
            value_name = "SECS",
            env = "VIIPER_API_DEVICE_HANDLER_TIMEOUT"
        )]
        device_timeout: Option<u64>,
    },

    /// Start the VIIPER USB/IP proxy
    Proxy {
        /// Proxy listen address
        #[arg(
            long,
            value_name = "ADDR",
            env = "VIIPER_PROXY_ADDR",
            default_value = "0.0.0.0:3241"
        )]
        listen: String,

        /// Upstream USB/IP server address
        #[arg(long, value_name = "HOST:PORT", env = "VIIPER_PROXY_UPSTREAM")]
        upstream: String,

        /// Upstream connection timeout in seconds
        #[arg(
            long,
            value_name = "SECS",
            env = "VIIPER_PROXY_TIMEOUT",
            default_value_t = 30
        )]
        connect_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(file) = cli.log_file {
        config.log.file = Some(file);
    }
    if config.validate().is_err() || setup_logging(&config.log.level, config.log.file.as_deref()).is_err()
    {
        eprintln!("invalid logging configuration");
        return ExitCode::from(2);
    }

    let result = match cli.command {
        Command::Server {
            api_addr,
            usbip_addr,
            device_timeout,
        } => {
            if let Some(addr) = api_addr {
                config.api.addr = addr;
            }
            if let Some(addr) = usbip_addr {
                config.usbip.addr = addr;
            }
            if let Some(secs) = device_timeout {
                config.api.device_connect_timeout_secs = secs;
            }
            run_server(config).await
        }
        Command::Proxy {
            listen,
            upstream,
            connect_timeout,
        } => run_proxy(&listen, upstream, Duration::from_secs(connect_timeout)).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    info!("VIIPER v{}", env!("CARGO_PKG_VERSION"));

    // Provision the shared API key so clients have something to pick up.
    match common::load_or_generate_api_key(config.api.key_path.as_deref()) {
        Ok(_) => {}
        Err(e) => warn!("API key unavailable: {:#}", e),
    }

    let catalog = Arc::new(Catalog::with_builtin());
    info!("device types: {}", catalog.device_types().join(", "));

    let state = Arc::new(ServerState::new(
        catalog,
        config.api.device_connect_timeout(),
    ));

    let usbip_listener = TcpListener::bind(&config.usbip.addr)
        .await
        .with_context(|| format!("failed to bind USB/IP address {}", config.usbip.addr))?;
    let api_listener = TcpListener::bind(&config.api.addr)
        .await
        .with_context(|| format!("failed to bind API address {}", config.api.addr))?;

    let usbipd = UsbIpServer::new(state.clone(), config.usbip.submit_write_timeout());
    let api = ApiServer::new(state.clone(), config.api.read_timeout());

    let usbip_task = tokio::spawn(usbipd.run(usbip_listener));
    let api_task = tokio::spawn(api.run(api_listener));

    info!("press Ctrl+C to shut down");
    signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("shutting down");

    state.shutdown();
    let _ = usbip_task.await;
    let _ = api_task.await;
    Ok(())
}

async fn run_proxy(listen: &str, upstream: String, connect_timeout: Duration) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind proxy address {}", listen))?;

    let cancel = CancellationToken::new();
    let proxy = ProxyServer::new(upstream, connect_timeout, cancel.clone());
    let proxy_task = tokio::spawn(proxy.run(listener));

    signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("shutting down proxy");
    cancel.cancel();
    let _ = proxy_task.await;
    Ok(())
}
