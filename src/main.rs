//! Zentinel Delegation Gateway
//!
//! Validates inbound OIDC bearer credentials, exchanges them for
//! downstream-scoped credentials (RFC 8693) and forwards requests to the
//! downstream API as the original subject.

mod config;
mod error;
mod exchange;
mod gateway;
mod http;
mod oidc;
mod secret;
mod tasks;

#[cfg(test)]
mod test_support;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use config::GatewayConfig;
use gateway::{build_router, AppState};
use secret::SecretString;
use tasks::{spawn_cache_sweep_task, spawn_key_refresh_task};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zentinel-delegation-gateway")]
#[command(about = "Delegated-identity authentication gateway")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "GATEWAY_CONFIG")]
    config: PathBuf,

    /// Listen address (overrides the configuration file)
    #[arg(long, env = "GATEWAY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Token exchange client secret (overrides the configuration file)
    #[arg(long, env = "EXCHANGE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "GATEWAY_VERBOSE")]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> Result<GatewayConfig> {
        let mut config = GatewayConfig::load(&self.config)?;

        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(ref secret) = self.client_secret {
            config.exchange.client_secret = Some(SecretString::new(secret.as_str()));
        }

        config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting Zentinel Delegation Gateway");

    let config = args.load_config()?;

    info!(
        issuers = config.oidc.issuers.len(),
        accepted_audience = %config.oidc.accepted_audience,
        token_endpoint = %config.exchange.token_endpoint,
        downstream_audience = %config.exchange.audience,
        downstream_url = %config.server.downstream_url,
        cache_max_entries = config.cache.max_entries,
        "Configuration loaded"
    );
    if config.oidc.insecure_skip_verification {
        warn!("Inbound signature verification is DISABLED; credentials are marked unverified");
    }

    let state = AppState::new(&config)?;

    // Prefetch so the first requests do not pay for discovery.
    state.keys().refresh_all().await;

    let _refresh_handle = spawn_key_refresh_task(state.keys(), config.oidc.jwks_refresh_secs);
    let _sweep_handle = spawn_cache_sweep_task(state.cache(), config.cache.sweep_interval_secs);

    let app = build_router(state, &config.server.health_path);
    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;

    info!(listen = %config.server.listen, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
