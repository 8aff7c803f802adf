//! Payment-gated rental escrow HTTP server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default config (config.toml in current directory)
//! cargo run -p rentvault-server --release
//!
//! # Run with custom config path
//! CONFIG=/path/to/config.toml cargo run -p rentvault-server
//!
//! # Configure logging level
//! RUST_LOG=debug cargo run -p rentvault-server
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` — Path to TOML configuration file (default: `config.toml`)
//! - `HOST` — Override bind address (default: `0.0.0.0`)
//! - `PORT` — Override port (default: `4402`)
//! - `RUST_LOG` — Log level filter (default: `info`)

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::Method;
use axum::{Json, Router};
use rust_decimal::Decimal;
use tower_http::cors;
use tracing_subscriber::EnvFilter;

use rentvault::chain::{ChainClient, SandboxChain};
use rentvault::escrow::{EscrowConfig, EscrowService};
use rentvault::grant::AccessGrantIssuer;
use rentvault::ledger::PaymentLedger;
use rentvault::release::ReleaseCoordinator;
use rentvault_http::gate::{GateConfig, PayGate};
use rentvault_http::layer::PaymentGateLayer;
use rentvault_http::quote::{FiatQuote, StaticRate};

use rentvault_server::config::{ChainMode, ServerConfig};
use rentvault_server::handlers::{AppState, escrow_router};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        chain = ?config.chain.mode,
        "Loaded configuration"
    );

    let chain: Arc<dyn ChainClient> = match config.chain.mode {
        ChainMode::Sandbox => {
            tracing::warn!("Sandbox chain selected — transactions exist only in this process");
            Arc::new(SandboxChain::new())
        }
    };

    let ledger = Arc::new(PaymentLedger::new(Arc::clone(&chain)));
    let grants = Arc::new(AccessGrantIssuer::new());
    let escrows = Arc::new(EscrowService::new(
        Arc::clone(&chain),
        EscrowConfig {
            grace_secs: config.escrow.grace_secs,
            expiry_policy: config.escrow.expiry_policy,
        },
    ));
    let release = Arc::new(ReleaseCoordinator::new(
        Arc::clone(&chain),
        Arc::clone(&escrows),
    ));

    let mut gate = PayGate::new(
        ledger,
        grants,
        GateConfig {
            currency: config.gate.currency.clone(),
            amount: config.gate.amount,
            reference_ttl_secs: config.gate.reference_ttl_secs,
            token_ttl_secs: config.gate.token_ttl_secs,
        },
    );
    if let Some(rate) = config.gate.fiat_rate.as_deref() {
        match Decimal::from_str(rate) {
            Ok(rate) => {
                let quote: Arc<dyn FiatQuote> =
                    Arc::new(StaticRate::new(rate, config.gate.fiat_symbol.clone()));
                gate = gate.with_quote(quote);
            }
            Err(e) => tracing::warn!(rate, error = %e, "Ignoring unparseable fiat_rate"),
        }
    }
    let gate_layer = PaymentGateLayer::new(Arc::new(gate));

    let state = AppState {
        escrows,
        release,
    };

    let app = Router::new()
        .merge(escrow_router(state))
        .route(
            "/assets/{id}",
            axum::routing::get(get_asset).layer(gate_layer),
        )
        .route("/health", axum::routing::get(health))
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Gated demo resource. Reaching this handler means the payment layer let the
/// request through.
async fn get_asset(
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "asset_id": id,
        "content": "unlocked",
    }))
}

/// Health check endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Waits for Ctrl-C or SIGTERM (Unix) to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down..."),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl-C");
        tracing::info!("Received Ctrl-C, shutting down...");
    }
}
