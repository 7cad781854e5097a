// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # NVP Proxy
//!
//! Entry point for the `nvp-proxy` binary. Parses CLI arguments, initializes
//! logging and metrics, opens the saved-key store, and serves the HTTP/SSE/WS
//! API next to a Prometheus endpoint.
//!
//! Subcommands:
//!
//! - `run`: start the proxy
//! - `version`: print build version information

mod api;
mod cli;
mod live;
mod logging;
mod metrics;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use nvp_core::nvp::HttpTransport;
use nvp_core::{EventHub, KeyStore, NvpClient, RateLimiter};

use cli::{Commands, ProxyCli};
use metrics::{MetricsState, ProxyMetrics};
use session::SessionStore;

/// How often idle sessions and stale rate-limit windows are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ProxyCli::parse();

    match cli.command {
        Commands::Run(args) => run_proxy(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

async fn run_proxy(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    let default_env = args.default_environment();
    tracing::info!(
        port = args.port,
        metrics_port = args.metrics_port,
        environment = %default_env,
        nvp_version = %args.nvp_version,
        data_dir = %args.data_dir.display(),
        "starting nvp-proxy"
    );

    // --- Saved keys ---
    let keys_path = args.data_dir.join("keys");
    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;
    let keys = KeyStore::open(&keys_path)
        .with_context(|| format!("failed to open key store at {}", keys_path.display()))?;
    tracing::info!(path = %keys_path.display(), saved_keys = keys.len(), "key store opened");

    // --- Event hub & metrics ---
    let hub = Arc::new(EventHub::new(args.log_buffer_size));
    let proxy_metrics = Arc::new(ProxyMetrics::new().context("failed to register metrics")?);

    // --- Upstream client ---
    let transport = HttpTransport::new().context("failed to build HTTP client")?;
    let nvp = NvpClient::new(Arc::new(transport), Arc::clone(&hub))
        .with_endpoints(args.endpoints())
        .with_version(args.nvp_version.clone())
        .with_default_environment(default_env)
        .with_observer(proxy_metrics.clone());

    let sessions = Arc::new(SessionStore::default());
    let limiter = Arc::new(RateLimiter::new(
        args.rate_limit_window(),
        args.rate_limit_max,
    ));

    let app_state = api::AppState {
        hub: Arc::clone(&hub),
        nvp: Arc::new(nvp),
        keys: Arc::new(keys),
        sessions: Arc::clone(&sessions),
        limiter: Arc::clone(&limiter),
        metrics: Arc::clone(&proxy_metrics),
        client_origin: args.client_origin.clone(),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(MetricsState {
            metrics: Arc::clone(&proxy_metrics),
            hub: Arc::clone(&hub),
            sessions: Arc::clone(&sessions),
        });
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Housekeeping ---
    let sweeper = tokio::spawn({
        let sessions = Arc::clone(&sessions);
        let limiter = Arc::clone(&limiter);
        async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let idle = sessions.purge_idle();
                let windows = limiter.purge_expired();
                if idle > 0 || windows > 0 {
                    tracing::debug!(idle, windows, "swept expired state");
                }
            }
        }
    });

    // --- Serve ---
    let api_service = api_router.into_make_service_with_connect_info::<SocketAddr>();
    tokio::select! {
        res = axum::serve(api_listener, api_service) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    sweeper.abort();
    tracing::info!("nvp-proxy stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("nvp-proxy {}", env!("CARGO_PKG_VERSION"));
    println!("nvp       {}", nvp_core::config::DEFAULT_NVP_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
