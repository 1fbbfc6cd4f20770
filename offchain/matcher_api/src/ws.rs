//! Realtime channel: subscribe/unsubscribe over a persistent websocket.
//! The first message after a subscribe is a snapshot stamped with the
//! topic's current sequence number; deltas follow with increasing seqs, so
//! a gap on the client side means "resubscribe for a fresh snapshot".

use crate::api::AppState;
use crate::broadcast::OutboundMsg;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use engine::query;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

const HEARTBEAT: Duration = Duration::from_secs(15);
/// Two missed heartbeats close the connection.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ClientMsg {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    trader: Option<String>,
    #[serde(default)]
    resolution: Option<u64>,
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| handle_socket(state, socket))
}

fn topic_for(msg: &ClientMsg) -> Option<String> {
    let channel = msg.channel.as_deref()?;
    match channel {
        "orderbook" => Some(format!("market:{}:book", msg.token.as_deref()?.to_lowercase())),
        "trades" => Some(format!("market:{}:trades", msg.token.as_deref()?.to_lowercase())),
        "klines" => Some(format!(
            "market:{}:klines:{}",
            msg.token.as_deref()?.to_lowercase(),
            msg.resolution.unwrap_or(60)
        )),
        "liquidations" => {
            Some(format!("market:{}:liquidations", msg.token.as_deref()?.to_lowercase()))
        }
        "risk" => Some(format!("market:{}:risk", msg.token.as_deref()?.to_lowercase())),
        "balance" => Some(format!("trader:{}:balance", msg.trader.as_deref()?.to_lowercase())),
        "positions" => Some(format!("trader:{}:positions", msg.trader.as_deref()?.to_lowercase())),
        "orders" => Some(format!("trader:{}:orders", msg.trader.as_deref()?.to_lowercase())),
        _ => None,
    }
}

/// Self-sufficient payload for the first message on a topic.
async fn snapshot_data(state: &AppState, msg: &ClientMsg) -> serde_json::Value {
    let channel = msg.channel.as_deref().unwrap_or("");
    match channel {
        "orderbook" => {
            if let Ok(worker) = worker_for(state, msg) {
                if let Ok(snap) = worker.inspect(|eng| query::book_snapshot(eng, 20)).await {
                    return serde_json::to_value(snap).unwrap_or_default();
                }
            }
            json!(null)
        }
        "trades" => {
            if let Ok(worker) = worker_for(state, msg) {
                if let Ok(t) = worker.inspect(|eng| query::trades(eng, 100)).await {
                    return serde_json::to_value(t).unwrap_or_default();
                }
            }
            json!([])
        }
        "klines" => {
            let resolution = msg.resolution.unwrap_or(60);
            if let Ok(worker) = worker_for(state, msg) {
                if let Ok(candles) = worker
                    .inspect(move |eng| {
                        eng.klines(resolution)
                            .map(|ring| ring.iter().copied().collect::<Vec<_>>())
                            .unwrap_or_default()
                    })
                    .await
                {
                    return serde_json::to_value(candles).unwrap_or_default();
                }
            }
            json!([])
        }
        "risk" => {
            if let Ok(worker) = worker_for(state, msg) {
                if let Ok(view) = worker.inspect(query::market_risk).await {
                    return serde_json::to_value(view).unwrap_or_default();
                }
            }
            json!(null)
        }
        "liquidations" => json!([]),
        "balance" => {
            let trader = msg.trader.as_deref().unwrap_or("").to_lowercase();
            let account = state.ledger.snapshot(&trader);
            json!({
                "trader": trader,
                "free": account.free,
                "lockedOrders": account.locked_orders,
                "lockedMargin": account.locked_margin,
                "nonce": account.nonce,
            })
        }
        "positions" => {
            let trader = msg.trader.as_deref().unwrap_or("").to_lowercase();
            let mut out = Vec::new();
            for worker in state.workers.values() {
                let t = trader.clone();
                if let Ok(mut views) =
                    worker.inspect(move |eng| query::positions_for(eng, &t)).await
                {
                    out.append(&mut views);
                }
            }
            serde_json::to_value(out).unwrap_or_default()
        }
        "orders" => {
            let trader = msg.trader.as_deref().unwrap_or("").to_lowercase();
            let mut out = Vec::new();
            for worker in state.workers.values() {
                let t = trader.clone();
                if let Ok(mut orders) =
                    worker.inspect(move |eng| query::orders_for(eng, &t, None)).await
                {
                    out.append(&mut orders);
                }
            }
            serde_json::to_value(out).unwrap_or_default()
        }
        _ => json!(null),
    }
}

fn worker_for<'a>(
    state: &'a AppState,
    msg: &ClientMsg,
) -> Result<&'a crate::worker::WorkerHandle, ()> {
    let token = msg.token.as_deref().ok_or(())?.to_lowercase();
    state.workers.get(&token).ok_or(())
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (client_id, mut rx) = state.hub.register();
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();
    let mut close_reason: Option<&'static str> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    let Ok(msg) = serde_json::from_str::<ClientMsg>(&text) else {
                        continue;
                    };
                    match msg.kind.as_str() {
                        "subscribe" => {
                            let Some(topic) = topic_for(&msg) else { continue };
                            let seq = state.hub.subscribe(client_id, &topic);
                            let data = snapshot_data(&state, &msg).await;
                            state.hub.send_to(client_id, OutboundMsg {
                                kind: "snapshot".to_string(),
                                channel: topic,
                                seq,
                                data,
                            });
                        }
                        "unsubscribe" => {
                            if let Some(topic) = topic_for(&msg) {
                                state.hub.unsubscribe(client_id, &topic);
                            }
                        }
                        "ping" => {
                            let pong = json!({ "type": "pong" }).to_string();
                            if sink.send(Message::Text(pong)).await.is_err() {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            outgoing = rx.recv() => match outgoing {
                Some(msg) => {
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // the hub dropped us: the queue overflowed
                None => {
                    close_reason = Some("slow_consumer");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > CLIENT_TIMEOUT {
                    close_reason = Some("heartbeat_timeout");
                    break;
                }
                let hb = json!({ "type": "heartbeat", "ts": state.clock.now() }).to_string();
                if sink.send(Message::Text(hb)).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(reason) = close_reason {
        debug!(target: "ws", client = client_id, reason, "closing client");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: reason.into(),
            })))
            .await;
    }
    state.hub.unregister(client_id);
}
