//! REST surface over the query projections and the per-market workers.
//! Handlers authenticate, route to the owning worker, and shape responses;
//! no engine state lives here.

use crate::auth::{Authenticator, WireOrder};
use crate::broadcast::BroadcastHub;
use crate::config::EngineConfig;
use crate::oracle::Clock;
use crate::worker::{JournalStore, WorkerHandle};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine::journal::JournalEvent;
use engine::{
    parse_fixed, query, AccountLedger, EngineError, OrderStatus, PRICE_SCALE,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<EngineConfig>,
    pub ledger: Arc<AccountLedger>,
    pub workers: Arc<HashMap<String, WorkerHandle>>,
    pub hub: BroadcastHub,
    pub auth: Arc<Authenticator>,
    pub clock: Arc<dyn Clock>,
    pub journal: JournalStore,
}

impl AppState {
    fn worker(&self, token: &str) -> Result<&WorkerHandle, EngineError> {
        self.workers
            .get(&token.to_lowercase())
            .ok_or_else(|| EngineError::UnknownMarket(token.to_string()))
    }

    /// Cancels and closes address an order/pair id without naming the
    /// market; scan the (few) workers for the owner.
    async fn worker_for_order(&self, order_id: u64, trader: &str) -> Option<&WorkerHandle> {
        for worker in self.workers.values() {
            let trader = trader.to_string();
            let owns = worker
                .inspect(move |eng| {
                    eng.order(order_id).map(|o| o.trader == trader).unwrap_or(false)
                })
                .await
                .unwrap_or(false);
            if owns {
                return Some(worker);
            }
        }
        None
    }

    async fn worker_for_pair(&self, pair_id: u64) -> Option<&WorkerHandle> {
        for worker in self.workers.values() {
            let owns = worker
                .inspect(move |eng| eng.pairs().get(pair_id).is_some())
                .await
                .unwrap_or(false);
            if owns {
                return Some(worker);
            }
        }
        None
    }
}

fn reject(err: EngineError) -> Response {
    let status = match &err {
        EngineError::BadSignature | EngineError::BadNonce { .. } => StatusCode::UNAUTHORIZED,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::UnknownMarket(_)
        | EngineError::UnknownOrder(_)
        | EngineError::UnknownPair(_)
        | EngineError::UnknownTrader(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(json!({ "success": false, "error": err.code(), "detail": err.to_string() })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SubmitOrderBody {
    pub order: WireOrder,
    pub signature: String,
}

pub async fn submit_order(
    State(state): State<AppState>,
    Json(body): Json<SubmitOrderBody>,
) -> Response {
    let now = state.clock.now();
    let input = match state.auth.verify_order(&body.order, &body.signature, now) {
        Ok(input) => input,
        Err(e) => return reject(e),
    };
    let worker = match state.worker(&input.market) {
        Ok(w) => w,
        Err(e) => return reject(e),
    };
    // consume the nonce before the order reaches the matching core: replays
    // of the same signed order fail here with BadNonce
    if let Err(e) = state.ledger.check_and_bump_nonce(&input.trader, input.nonce) {
        return reject(e);
    }
    match worker.submit(input).await {
        Ok(outcome) => Json(json!({
            "success": true,
            "orderId": outcome.order.id,
            "status": outcome.order.status,
            "filled": outcome.order.filled,
            "avgFillPrice": outcome.order.avg_fill_price,
            "matches": outcome.fills,
        }))
        .into_response(),
        Err(e) => reject(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub trader: String,
    pub signature: String,
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<u64>,
    Json(body): Json<CancelBody>,
) -> Response {
    let message = format!("Cancel order {order_id}");
    if let Err(e) = state.auth.verify_text(&body.trader, &message, &body.signature) {
        return reject(e);
    }
    let trader = body.trader.to_lowercase();
    let Some(worker) = state.worker_for_order(order_id, &trader).await else {
        return reject(EngineError::UnknownOrder(order_id));
    };
    match worker.cancel(order_id, trader).await {
        Ok(order) => Json(json!({ "success": true, "status": order.status })).into_response(),
        Err(e) => reject(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CloseBody {
    pub trader: String,
    pub signature: String,
    /// Optional partial close quantity in base units; whole pair otherwise.
    #[serde(default)]
    pub size: Option<String>,
}

pub async fn close_position(
    State(state): State<AppState>,
    Path(pair_id): Path<u64>,
    Json(body): Json<CloseBody>,
) -> Response {
    let trader = body.trader.to_lowercase();
    let message = format!("Close pair {pair_id} for {trader}");
    if let Err(e) = state.auth.verify_text(&body.trader, &message, &body.signature) {
        return reject(e);
    }
    let q = match &body.size {
        None => None,
        Some(s) => match s.parse::<i128>() {
            Ok(v) => Some(v),
            Err(_) => return reject(EngineError::BadSize(0)),
        },
    };
    let Some(worker) = state.worker_for_pair(pair_id).await else {
        return reject(EngineError::UnknownPair(pair_id));
    };
    match worker.close(pair_id, trader, q).await {
        Ok(pair) => Json(json!({ "success": true, "pair": pair })).into_response(),
        Err(e) => reject(e),
    }
}

pub async fn balance(State(state): State<AppState>, Path(addr): Path<String>) -> Response {
    let trader = addr.to_lowercase();
    let account = state.ledger.snapshot(&trader);
    let mut locked_margin = 0;
    let mut unrealized = 0;
    for worker in state.workers.values() {
        let t = trader.clone();
        if let Ok(summary) = worker.inspect(move |eng| query::margin_summary(eng, &t)).await {
            locked_margin += summary.locked_margin;
            unrealized += summary.unrealized_pnl;
        }
    }
    Json(json!({
        "trader": trader,
        "free": account.free,
        "lockedOrders": account.locked_orders,
        "lockedMargin": account.locked_margin,
        "marginInPairs": locked_margin,
        "unrealizedPnl": unrealized,
        "nonce": account.nonce,
    }))
    .into_response()
}

pub async fn positions(State(state): State<AppState>, Path(addr): Path<String>) -> Response {
    let trader = addr.to_lowercase();
    let mut out = Vec::new();
    for worker in state.workers.values() {
        let t = trader.clone();
        if let Ok(mut views) = worker.inspect(move |eng| query::positions_for(eng, &t)).await {
            out.append(&mut views);
        }
    }
    Json(out).into_response()
}

#[derive(Debug, Deserialize)]
pub struct OrdersParams {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn orders(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Query(params): Query<OrdersParams>,
) -> Response {
    let status = match params.status.as_deref() {
        None => None,
        Some(s) => match serde_json::from_value::<OrderStatus>(json!(s)) {
            Ok(st) => Some(st),
            Err(_) => return reject(EngineError::Internal(format!("unknown status {s}"))),
        },
    };
    let trader = addr.to_lowercase();
    let mut out = Vec::new();
    for worker in state.workers.values() {
        let t = trader.clone();
        if let Ok(mut orders) =
            worker.inspect(move |eng| query::orders_for(eng, &t, status)).await
        {
            out.append(&mut orders);
        }
    }
    Json(out).into_response()
}

pub async fn nonce(State(state): State<AppState>, Path(addr): Path<String>) -> Response {
    let trader = addr.to_lowercase();
    Json(json!({ "trader": trader, "nonce": state.ledger.nonce(&trader) })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DepthParams {
    #[serde(default = "default_depth")]
    pub depth: usize,
}

fn default_depth() -> usize {
    20
}

pub async fn orderbook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<DepthParams>,
) -> Response {
    let worker = match state.worker(&token) {
        Ok(w) => w,
        Err(e) => return reject(e),
    };
    match worker.inspect(move |eng| query::book_snapshot(eng, params.depth)).await {
        Ok(snap) => Json(snap).into_response(),
        Err(e) => reject(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TradesParams {
    #[serde(default = "default_trades_limit")]
    pub limit: usize,
}

fn default_trades_limit() -> usize {
    100
}

pub async fn trades(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<TradesParams>,
) -> Response {
    let worker = match state.worker(&token) {
        Ok(w) => w,
        Err(e) => return reject(e),
    };
    match worker.inspect(move |eng| query::trades(eng, params.limit)).await {
        Ok(t) => Json(t).into_response(),
        Err(e) => reject(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct KlinesParams {
    #[serde(default = "default_resolution")]
    pub resolution: u64,
}

fn default_resolution() -> u64 {
    60
}

pub async fn klines(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<KlinesParams>,
) -> Response {
    let worker = match state.worker(&token) {
        Ok(w) => w,
        Err(e) => return reject(e),
    };
    match worker
        .inspect(move |eng| {
            eng.klines(params.resolution).map(|ring| ring.iter().copied().collect::<Vec<_>>())
        })
        .await
    {
        Ok(Some(candles)) => Json(candles).into_response(),
        Ok(None) => reject(EngineError::Internal(format!(
            "resolution {} not aggregated",
            params.resolution
        ))),
        Err(e) => reject(e),
    }
}

pub async fn market_risk(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let worker = match state.worker(&token) {
        Ok(w) => w,
        Err(e) => return reject(e),
    };
    match worker.inspect(query::market_risk).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => reject(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LiquidationMapParams {
    /// Bucket width as a decimal price string; defaults to 0.1.
    #[serde(default)]
    pub bucket: Option<String>,
}

pub async fn liquidation_map(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<LiquidationMapParams>,
) -> Response {
    let width = match params.bucket.as_deref() {
        None => PRICE_SCALE / 10,
        Some(s) => match parse_fixed(s) {
            Some(w) if w > 0 => w,
            _ => return reject(EngineError::BadPrice(0)),
        },
    };
    let worker = match state.worker(&token) {
        Ok(w) => w,
        Err(e) => return reject(e),
    };
    match worker.inspect(move |eng| query::liquidation_map(eng, width)).await {
        Ok(map) => Json(map).into_response(),
        Err(e) => reject(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    /// Decimal string in collateral units.
    pub amount: String,
}

/// Custody entry for development deployments; production custody arrives
/// through the settlement contract.
pub async fn deposit(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Json(body): Json<TransferBody>,
) -> Response {
    let trader = addr.to_lowercase();
    let Some(amount) = parse_fixed(&body.amount).filter(|a| *a > 0) else {
        return reject(EngineError::BadSize(0));
    };
    let now = state.clock.now();
    state.journal.append(&JournalEvent::Deposit { trader: trader.clone(), amount, ts: now });
    state.ledger.deposit(&trader, amount);
    publish_balance(&state, &trader);
    Json(json!({ "success": true })).into_response()
}

pub async fn withdraw(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Json(body): Json<TransferBody>,
) -> Response {
    let trader = addr.to_lowercase();
    let Some(amount) = parse_fixed(&body.amount).filter(|a| *a > 0) else {
        return reject(EngineError::BadSize(0));
    };
    let now = state.clock.now();
    match state.ledger.withdraw(&trader, amount) {
        Ok(()) => {
            state
                .journal
                .append(&JournalEvent::Withdraw { trader: trader.clone(), amount, ts: now });
            publish_balance(&state, &trader);
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => reject(e),
    }
}

fn publish_balance(state: &AppState, trader: &str) {
    let account = state.ledger.snapshot(trader);
    state.hub.publish(
        &format!("trader:{trader}:balance"),
        "balance",
        json!({
            "trader": trader,
            "free": account.free,
            "lockedOrders": account.locked_orders,
            "lockedMargin": account.locked_margin,
            "nonce": account.nonce,
        }),
    );
}
