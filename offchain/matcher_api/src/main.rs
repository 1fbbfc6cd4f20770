mod api;
mod auth;
mod broadcast;
mod chain;
mod config;
mod oracle;
mod worker;
mod ws;

use crate::api::AppState;
use crate::auth::Authenticator;
use crate::broadcast::BroadcastHub;
use crate::chain::ChainClient;
use crate::config::{Args, EngineConfig};
use crate::oracle::{Clock, OracleSource, PolledOracle, SystemClock};
use crate::worker::JournalStore;
use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use engine::journal::Replay;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = Arc::new(EngineConfig::load(&args)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let now = clock.now();

    // rebuild state from the journal, then keep appending to it
    let (journal_events, journal) = match &cfg.journal_path {
        Some(path) => JournalStore::load_and_open(path)
            .with_context(|| format!("opening journal {}", path.display()))?,
        None => (Vec::new(), JournalStore::disabled()),
    };
    let seed = cfg.insurance_seed_fixed()?;
    let mut replay =
        Replay::new(cfg.markets.iter().map(|m| (m.to_params(), seed)).collect(), now);
    for event in &journal_events {
        replay.apply(event);
    }
    if !journal_events.is_empty() {
        info!("replayed {} journal events", journal_events.len());
    }
    let ledger = Arc::new(replay.ledger);

    let oracle = PolledOracle::new();
    for market in &cfg.markets {
        oracle.spawn_poller(
            market.token.to_lowercase(),
            market.oracle_source.clone(),
            clock.clone(),
        );
    }
    let oracle_source: Arc<dyn OracleSource> = oracle;

    let hub = BroadcastHub::new();
    hub.spawn_flusher();

    let chain = ChainClient::new(Some(cfg.settlement_address.clone()));
    if chain.is_active() {
        info!(settlement = ?chain.contract_address, "on-chain settlement active");
    }

    let mut workers = HashMap::new();
    for (token, market_engine) in replay.markets {
        let handle = worker::spawn(
            market_engine,
            ledger.clone(),
            oracle_source.clone(),
            clock.clone(),
            hub.clone(),
            journal.clone(),
            chain.clone(),
        );
        workers.insert(token, handle);
    }
    info!(markets = workers.len(), "market workers running");

    let state = AppState {
        cfg: cfg.clone(),
        ledger,
        workers: Arc::new(workers),
        hub,
        auth: Arc::new(Authenticator::new(cfg.chain_id, &cfg.settlement_address)),
        clock,
        journal,
    };

    let app = Router::new()
        .route("/api/order/submit", post(api::submit_order))
        .route("/api/order/:id/cancel", post(api::cancel_order))
        .route("/api/position/:pair_id/close", post(api::close_position))
        .route("/api/user/:addr/balance", get(api::balance))
        .route("/api/user/:addr/positions", get(api::positions))
        .route("/api/user/:addr/orders", get(api::orders))
        .route("/api/user/:addr/nonce", get(api::nonce))
        .route("/api/user/:addr/deposit", post(api::deposit))
        .route("/api/user/:addr/withdraw", post(api::withdraw))
        .route("/api/orderbook/:token", get(api::orderbook))
        .route("/api/trades/:token", get(api::trades))
        .route("/api/klines/:token", get(api::klines))
        .route("/api/risk/market/:token", get(api::market_risk))
        .route("/api/liquidation-map/:token", get(api::liquidation_map))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // optional dedicated realtime listener
    if let Some(ws_addr) = cfg.ws_addr.clone() {
        let ws_app = Router::new().route("/ws", get(ws::ws_handler)).with_state(state.clone());
        tokio::spawn(async move {
            match TcpListener::bind(&ws_addr).await {
                Ok(listener) => {
                    info!("realtime channel on {ws_addr}");
                    if let Err(e) = axum::serve(listener, ws_app).await {
                        error!("ws listener failed: {e}");
                    }
                }
                Err(e) => error!("binding {ws_addr} failed: {e}"),
            }
        });
    }

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!("listening on {}", cfg.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
