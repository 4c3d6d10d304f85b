//! mgate-server: instant-messaging gateway.
//!
//! Terminates client connections on two transports (length-prefixed
//! binary frames over TCP, plus an HTTP control plane), authenticates
//! them, and routes request envelopes to backend services by command id.

mod auth;
mod config;
mod control;
mod dispatch;
mod error;
mod metrics;
mod parser;
mod push;
mod registry;
mod router;
mod server;
mod session;

use clap::Parser;
use config::{ConfigOverrides, GatewayConfig};
use server::GatewayServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_INIT: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

/// mgate-server: IM gateway
#[derive(Parser, Debug)]
#[command(name = "mgate-server", version, about = "Instant-messaging gateway")]
struct Cli {
    /// Route table file
    #[arg(long, default_value = "routes.toml")]
    routes: PathBuf,

    /// Platform policy file
    #[arg(long)]
    platforms: Option<PathBuf>,

    /// Binary transport listen address
    #[arg(long)]
    bind: Option<String>,

    /// Control plane listen address
    #[arg(long)]
    http_bind: Option<String>,

    /// Token signing secret (hex); generated per run when omitted
    #[arg(long)]
    secret: Option<String>,

    /// Unauthenticated grace period in seconds
    #[arg(long)]
    auth_grace: Option<u64>,

    /// Heartbeat interval in seconds
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        routes = %cli.routes.display(),
        "starting mgate-server"
    );

    let overrides = ConfigOverrides {
        bind: cli.bind,
        http_bind: cli.http_bind,
        secret_hex: cli.secret,
        auth_grace_secs: cli.auth_grace,
        heartbeat_secs: cli.heartbeat,
    };
    let config = match GatewayConfig::load(&cli.routes, cli.platforms.as_deref(), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(EXIT_INIT);
        }
    };

    let gateway = match GatewayServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(EXIT_INIT);
        }
    };

    tokio::select! {
        result = gateway.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                // Listener bind failures are init failures; anything
                // else that escapes the run loop is a runtime error.
                let code = match e {
                    error::GatewayError::Config(_) => EXIT_INIT,
                    _ => EXIT_RUNTIME,
                };
                std::process::exit(code);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            gateway.shutdown().await;
        }
    }

    info!("mgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
