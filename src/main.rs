//! GoExpose server - expose TCP and UDP services running behind NAT
//!
//! Clients connect over mutual TLS and ask for ports to be exposed; public
//! traffic on those ports is relayed back through the client's tunnel.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use goexpose_proto::PROTOCOL_VERSION;
use goexpose_server::{tls, PortAllocator, PortPool, ServerConfig, TlsPaths, TunnelAcceptor};

/// GoExpose tunnel server
#[derive(Parser, Debug)]
#[command(name = "goexpose-server")]
#[command(about = "Reverse tunnel server exposing client services on public ports", long_about = None)]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, env = "GOEXPOSE_CONFIG")]
    config: Option<PathBuf>,

    /// Address of the tunnel (control) listener
    #[arg(long, env = "GOEXPOSE_CONTROL_ADDR")]
    control_addr: Option<SocketAddr>,

    /// First port of the relay port range
    #[arg(long, env = "GOEXPOSE_PORT_BASE")]
    port_base: Option<u16>,

    /// Number of ports in the relay port range
    #[arg(long, env = "GOEXPOSE_PORT_AMOUNT")]
    port_amount: Option<u16>,

    /// Directory holding myCA.pem, server.crt and server.key
    #[arg(long, env = "GOEXPOSE_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Clients served at the same time
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds of silence after which a UDP flow is dropped
    #[arg(long)]
    udp_idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(addr) = self.control_addr {
            config.control_addr = addr;
        }
        if let Some(base) = self.port_base {
            config.proxy_port_base = base;
        }
        if let Some(amount) = self.port_amount {
            config.proxy_port_amount = amount;
        }
        if let Some(dir) = &self.cert_dir {
            config.tls = TlsPaths::in_dir(dir);
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        if let Some(secs) = self.udp_idle_timeout {
            config.udp_idle_timeout_secs = secs;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.server_config()?;

    info!(
        "Starting GoExpose server v{} (protocol v{}, commit {})",
        env!("CARGO_PKG_VERSION"),
        PROTOCOL_VERSION,
        env!("GIT_HASH")
    );

    let tls_config = tls::build_server_config(&config.tls).with_context(|| {
        format!(
            "Failed to prepare TLS from {}",
            config.tls.ca_cert.parent().unwrap_or(config.tls.ca_cert.as_path()).display()
        )
    })?;

    let pool: Arc<dyn PortAllocator> = Arc::new(
        PortPool::new(config.proxy_port_base, config.proxy_port_amount)
            .context("Failed to create relay port pool")?,
    );
    info!(
        "Relay ports {}-{} on {}",
        config.proxy_port_base,
        u32::from(config.proxy_port_base) + u32::from(config.proxy_port_amount) - 1,
        config.proxy_bind_ip
    );

    let acceptor = TunnelAcceptor::bind(&config, tls_config, pool)
        .await
        .context("Failed to start tunnel listener")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down..."),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    acceptor.run(cancel).await;
    info!("Server stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = Cli::parse_from([
            "goexpose-server",
            "--port-base",
            "30000",
            "--port-amount",
            "5",
            "--cert-dir",
            "/srv/certs",
            "--max-sessions",
            "3",
        ]);
        let config = cli.server_config().unwrap();

        assert_eq!(config.proxy_port_base, 30000);
        assert_eq!(config.proxy_port_amount, 5);
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.tls.ca_cert, PathBuf::from("/srv/certs/myCA.pem"));
        assert_eq!(config.control_addr.port(), 47921);
    }

    #[test]
    fn test_cli_rejects_invalid_range() {
        let cli = Cli::parse_from(["goexpose-server", "--port-amount", "0"]);
        assert!(cli.server_config().is_err());
    }
}
