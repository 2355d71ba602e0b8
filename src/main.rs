// =============================================================================
// Momentum Trader - Main Entry Point
// =============================================================================
//
// The engine starts in whatever account mode the config file names; the
// default is Demo, which routes orders through the paper gateway while market
// data still comes from Kite. Switching to Live requires editing the config
// and restarting.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod exit;
mod gateway;
mod indicators;
mod ledger;
mod orchestrator;
mod runtime_config;
mod scanner;
mod types;

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, ErrorLog};
use crate::exit::PositionMonitor;
use crate::gateway::kite::KiteClient;
use crate::gateway::paper::PaperGateway;
use crate::gateway::ExecutionGateway;
use crate::ledger::PositionLedger;
use crate::orchestrator::TradingOrchestrator;
use crate::runtime_config::RuntimeConfig;
use crate::scanner::{SignalRules, SignalScanner};
use crate::types::AccountMode;

const DEFAULT_CONFIG_PATH: &str = "trader_config.json";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";

/// Resolve the Kite access token, exchanging a request token when needed.
async fn kite_access_token(api_key: &str) -> anyhow::Result<String> {
    if let Ok(token) = std::env::var("KITE_ACCESS_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }

    let request_token = std::env::var("KITE_REQUEST_TOKEN").unwrap_or_default();
    let api_secret = std::env::var("KITE_API_SECRET").unwrap_or_default();
    if request_token.trim().is_empty() || api_secret.trim().is_empty() {
        bail!("set KITE_ACCESS_TOKEN, or KITE_REQUEST_TOKEN together with KITE_API_SECRET");
    }

    info!("No access token configured, exchanging request token for a session");
    KiteClient::generate_session(api_key, api_secret.trim(), request_token.trim()).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Momentum Trader — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("TRADER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = Arc::new(
        RuntimeConfig::load_or_init(&config_path)
            .with_context(|| format!("failed to load runtime config from {config_path}"))?,
    );

    info!(
        account_mode = %config.account_mode,
        exchange = %config.market.exchange,
        max_positions = config.general.max_positions,
        interval_minutes = config.general.scan_interval_minutes,
        "Engine configuration"
    );

    // ── 2. Broker gateway ────────────────────────────────────────────────
    let api_key = std::env::var("KITE_API_KEY").context("KITE_API_KEY is not set")?;
    let access_token = kite_access_token(&api_key).await?;
    let kite: Arc<dyn ExecutionGateway> = Arc::new(KiteClient::new(
        api_key,
        &access_token,
        config.market.exchange.clone(),
    )?);

    // ── 3. Ledger, paper book & scanner ──────────────────────────────────
    let ledger = Arc::new(
        PositionLedger::connect(&config.database_url, config.market.timezone())
            .await
            .with_context(|| format!("failed to open trade ledger at {}", config.database_url))?,
    );

    let gateway: Arc<dyn ExecutionGateway> = match config.account_mode {
        AccountMode::Demo => {
            info!(capital = config.paper_capital, "Demo mode: orders are simulated");
            let open = ledger
                .list_open()
                .await
                .context("failed to read open trades for the paper book")?;
            Arc::new(PaperGateway::new(kite, config.paper_capital).with_open_trades(&open))
        }
        AccountMode::Live => {
            warn!("LIVE mode: orders will be sent to the exchange");
            kite
        }
    };

    let scanner = Arc::new(
        SignalScanner::load(
            gateway.clone(),
            &config.market.exchange,
            &config.scan,
            SignalRules::from_config(&config),
        )
        .await
        .context("failed to load the instrument universe")?,
    );

    // ── 4. Monitor, orchestrator & shared state ──────────────────────────
    let errors = Arc::new(ErrorLog::default());
    let monitor = Arc::new(PositionMonitor::new(gateway.clone(), ledger.clone()));
    let orchestrator = Arc::new(TradingOrchestrator::new(
        &config,
        gateway,
        ledger.clone(),
        scanner,
        monitor.clone(),
        errors.clone(),
    ));

    let state = Arc::new(AppState::new(
        config.clone(),
        ledger,
        monitor,
        orchestrator.clone(),
        errors,
    ));

    // ── 5. Start the API server ──────────────────────────────────────────
    let bind_addr =
        std::env::var("TRADER_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 6. Trading loop ──────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trading = tokio::spawn(orchestrator.run(shutdown_rx));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — waiting for the current cycle to finish");

    let _ = shutdown_tx.send(true);
    if let Err(e) = trading.await {
        error!(error = %e, "Trading loop terminated abnormally");
    }

    info!(
        unrecorded_exits = state.monitor.unrecorded_count(),
        "Momentum Trader shut down complete."
    );
    Ok(())
}
