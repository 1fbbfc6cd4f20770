//! One tokio task per market owns that market's engine: all book, pair,
//! and risk mutation for a market is serialized through its command
//! channel, while the account ledger is shared across workers.

use crate::broadcast::BroadcastHub;
use crate::chain::ChainClient;
use crate::oracle::{Clock, OracleSource};
use engine::journal::JournalEvent;
use engine::market::EngineEvent;
use engine::{AccountLedger, EngineError, MarketEngine, Order, OrderInput, Pair, SubmitOutcome};
use serde_json::json;
use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

const RISK_TICK: Duration = Duration::from_millis(100);

/// Append-only journal of authenticated inputs. Shared by workers and the
/// deposit/withdraw handlers; replayed at startup by `main`.
#[derive(Clone, Default)]
pub struct JournalStore {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl JournalStore {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Read existing events, then reopen the file for appending.
    pub fn load_and_open(path: &Path) -> anyhow::Result<(Vec<JournalEvent>, JournalStore)> {
        let mut events = Vec::new();
        if path.exists() {
            let reader = std::io::BufReader::new(std::fs::File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                events.push(serde_json::from_str(&line)?);
            }
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok((events, JournalStore { file: Some(Arc::new(Mutex::new(file))) }))
    }

    pub fn append(&self, event: &JournalEvent) {
        if let Some(file) = &self.file {
            let mut f = file.lock().unwrap_or_else(|e| e.into_inner());
            if let Ok(line) = serde_json::to_string(event) {
                let _ = writeln!(f, "{line}");
                let _ = f.flush();
            }
        }
    }
}

pub enum WorkerCmd {
    Submit {
        input: OrderInput,
        resp: oneshot::Sender<Result<SubmitOutcome, EngineError>>,
    },
    Cancel {
        order_id: u64,
        trader: String,
        resp: oneshot::Sender<Result<Order, EngineError>>,
    },
    Close {
        pair_id: u64,
        trader: String,
        q: Option<i128>,
        resp: oneshot::Sender<Result<Pair, EngineError>>,
    },
    /// Read access on the worker, so every query is a consistent point-in-
    /// time view of the market.
    Inspect(Box<dyn FnOnce(&MarketEngine) + Send>),
}

#[derive(Clone)]
pub struct WorkerHandle {
    pub token: String,
    tx: mpsc::Sender<WorkerCmd>,
}

fn worker_gone() -> EngineError {
    EngineError::Internal("market worker unavailable".to_string())
}

impl WorkerHandle {
    pub async fn submit(&self, input: OrderInput) -> Result<SubmitOutcome, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WorkerCmd::Submit { input, resp: tx })
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    pub async fn cancel(&self, order_id: u64, trader: String) -> Result<Order, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WorkerCmd::Cancel { order_id, trader, resp: tx })
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    pub async fn close(
        &self,
        pair_id: u64,
        trader: String,
        q: Option<i128>,
    ) -> Result<Pair, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WorkerCmd::Close { pair_id, trader, q, resp: tx })
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    pub async fn inspect<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&MarketEngine) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WorkerCmd::Inspect(Box::new(move |eng| {
                let _ = tx.send(f(eng));
            })))
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())
    }
}

pub struct MarketWorker {
    engine: MarketEngine,
    ledger: Arc<AccountLedger>,
    oracle: Arc<dyn OracleSource>,
    clock: Arc<dyn Clock>,
    hub: BroadcastHub,
    journal: JournalStore,
    chain: ChainClient,
    rx: mpsc::Receiver<WorkerCmd>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    engine: MarketEngine,
    ledger: Arc<AccountLedger>,
    oracle: Arc<dyn OracleSource>,
    clock: Arc<dyn Clock>,
    hub: BroadcastHub,
    journal: JournalStore,
    chain: ChainClient,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(256);
    let token = engine.token().to_string();
    info!(target: "worker", %token, "market worker starting");
    let worker = MarketWorker { engine, ledger, oracle, clock, hub, journal, chain, rx };
    tokio::spawn(worker.run());
    WorkerHandle { token, tx }
}

impl MarketWorker {
    async fn run(mut self) {
        // a backlogged loop skips stale ticks instead of accumulating them
        let mut ticker = interval(RISK_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
            self.flush_events();
        }
        info!(target: "worker", token = %self.engine.token(), "market worker stopped");
    }

    fn handle(&mut self, cmd: WorkerCmd) {
        let now = self.clock.now();
        match cmd {
            WorkerCmd::Submit { input, resp } => {
                // the nonce was consumed by the authenticator: journal the
                // attempt whether or not admission accepts it
                self.journal.append(&JournalEvent::OrderAdmitted { input: input.clone(), ts: now });
                let result = self.engine.submit(&self.ledger, input, now);
                if let Ok(out) = &result {
                    for fill in &out.fills {
                        self.chain.spawn_submit_fill(fill);
                    }
                }
                let _ = resp.send(result);
            }
            WorkerCmd::Cancel { order_id, trader, resp } => {
                self.journal.append(&JournalEvent::CancelOrder {
                    market: self.engine.token().to_string(),
                    order_id,
                    trader: trader.clone(),
                    ts: now,
                });
                let _ = resp.send(self.engine.cancel(&self.ledger, order_id, &trader, now));
            }
            WorkerCmd::Close { pair_id, trader, q, resp } => {
                self.journal.append(&JournalEvent::ClosePair {
                    market: self.engine.token().to_string(),
                    pair_id,
                    trader: trader.clone(),
                    q,
                    ts: now,
                });
                let _ = resp.send(self.engine.close_pair(&self.ledger, pair_id, &trader, q, now));
            }
            WorkerCmd::Inspect(f) => f(&self.engine),
        }
    }

    fn on_tick(&mut self) {
        let now = self.clock.now();
        let oracle = self.oracle.latest(self.engine.token());
        self.journal.append(&JournalEvent::Tick {
            market: self.engine.token().to_string(),
            oracle,
            ts: now,
        });
        let out = self.engine.tick(&self.ledger, oracle, now);
        if !out.liquidated_pairs.is_empty() {
            warn!(
                target: "worker",
                token = %self.engine.token(),
                pairs = ?out.liquidated_pairs,
                "liquidated under-margined pairs"
            );
        }
    }

    /// Route engine events to broadcast topics. Messages are hand-off
    /// values; the hub never blocks this worker.
    fn flush_events(&mut self) {
        let token = self.engine.token().to_string();
        let mut balance_touched: HashSet<String> = HashSet::new();
        for event in self.engine.drain_events() {
            match event {
                EngineEvent::OrderAccepted { order } | EngineEvent::OrderUpdated { order } => {
                    self.hub.publish(
                        &format!("trader:{}:orders", order.trader),
                        "orders",
                        serde_json::to_value(&order).unwrap_or_default(),
                    );
                }
                EngineEvent::Trade { fill } => {
                    self.hub.publish(
                        &format!("market:{token}:trades"),
                        "trade",
                        serde_json::to_value(&fill).unwrap_or_default(),
                    );
                }
                EngineEvent::Book { market, bids, asks } => {
                    self.hub.publish_coalesced(
                        &format!("market:{market}:book"),
                        "orderbook",
                        json!({ "market": market, "bids": bids, "asks": asks }),
                    );
                }
                EngineEvent::PairOpened { pair } | EngineEvent::PairUpdated { pair } => {
                    for trader in [&pair.long_trader, &pair.short_trader] {
                        self.hub.publish(
                            &format!("trader:{trader}:positions"),
                            "positions",
                            serde_json::to_value(&pair).unwrap_or_default(),
                        );
                    }
                }
                EngineEvent::PositionRisk { pair, mark, long, short } => {
                    let pair_value = serde_json::to_value(&pair).unwrap_or_default();
                    for (trader, risk) in
                        [(&pair.long_trader, &long), (&pair.short_trader, &short)]
                    {
                        self.hub.publish(
                            &format!("trader:{trader}:positions"),
                            "positions",
                            json!({ "pair": pair_value.clone(), "mark": mark, "risk": risk }),
                        );
                    }
                }
                EngineEvent::BalanceTouched { trader } => {
                    balance_touched.insert(trader);
                }
                EngineEvent::Liquidation { event } => {
                    self.hub.publish(
                        &format!("market:{token}:liquidations"),
                        "liquidation",
                        serde_json::to_value(&event).unwrap_or_default(),
                    );
                }
                EngineEvent::Funding { tick } => {
                    self.hub.publish(
                        &format!("market:{token}:risk"),
                        "funding",
                        serde_json::to_value(&tick).unwrap_or_default(),
                    );
                }
                EngineEvent::MarketRisk { market, mark, insurance, open_interest, funding_index } => {
                    self.hub.publish_coalesced(
                        &format!("market:{market}:risk"),
                        "risk",
                        json!({
                            "market": market,
                            "mark": mark,
                            "insurance": insurance,
                            "openInterest": open_interest,
                            "fundingIndex": funding_index,
                        }),
                    );
                }
                EngineEvent::Halt { market, halted, reason } => {
                    self.hub.publish(
                        &format!("market:{market}:risk"),
                        "halt",
                        json!({ "market": market, "halted": halted, "reason": reason }),
                    );
                }
                EngineEvent::Kline { market, resolution_s, candle } => {
                    self.hub.publish(
                        &format!("market:{market}:klines:{resolution_s}"),
                        "kline",
                        serde_json::to_value(&candle).unwrap_or_default(),
                    );
                }
            }
        }
        for trader in balance_touched {
            let account = self.ledger.snapshot(&trader);
            self.hub.publish(
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
    }
}
