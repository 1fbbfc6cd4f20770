use crate::ledger::AccountLedger;
use crate::market::MarketEngine;
use crate::types::{MarketParams, OraclePrice, OrderInput};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Append-only journal record. The journal captures *inputs* after
/// authentication, not derived state: orders are logged once the nonce was
/// consumed (even if admission later rejects them), and ticks log the oracle
/// sample, so replaying any prefix through the same deterministic engine
/// code reproduces the exact in-memory state at that prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEvent {
    Deposit { trader: String, amount: i128, ts: u64 },
    Withdraw { trader: String, amount: i128, ts: u64 },
    OrderAdmitted { input: OrderInput, ts: u64 },
    CancelOrder { market: String, order_id: u64, trader: String, ts: u64 },
    ClosePair { market: String, pair_id: u64, trader: String, q: Option<i128>, ts: u64 },
    Tick { market: String, oracle: Option<OraclePrice>, ts: u64 },
}

/// Crash recovery: drive fresh engines through the journaled inputs.
pub struct Replay {
    pub ledger: AccountLedger,
    pub markets: HashMap<String, MarketEngine>,
}

impl Replay {
    pub fn new(markets: Vec<(MarketParams, i128)>, genesis_ts: u64) -> Self {
        let markets = markets
            .into_iter()
            .map(|(params, seed)| {
                (params.token.clone(), MarketEngine::new(params, seed, genesis_ts))
            })
            .collect();
        Replay { ledger: AccountLedger::new(), markets }
    }

    /// Outcomes are intentionally discarded: whatever failed the first time
    /// fails identically on replay.
    pub fn apply(&mut self, event: &JournalEvent) {
        match event {
            JournalEvent::Deposit { trader, amount, .. } => {
                self.ledger.deposit(trader, *amount);
            }
            JournalEvent::Withdraw { trader, amount, .. } => {
                let _ = self.ledger.withdraw(trader, *amount);
            }
            JournalEvent::OrderAdmitted { input, ts } => {
                let _ = self.ledger.check_and_bump_nonce(&input.trader, input.nonce);
                if let Some(market) = self.markets.get_mut(&input.market) {
                    let _ = market.submit(&self.ledger, input.clone(), *ts);
                    market.drain_events();
                }
            }
            JournalEvent::CancelOrder { market, order_id, trader, ts } => {
                if let Some(m) = self.markets.get_mut(market) {
                    let _ = m.cancel(&self.ledger, *order_id, trader, *ts);
                    m.drain_events();
                }
            }
            JournalEvent::ClosePair { market, pair_id, trader, q, ts } => {
                if let Some(m) = self.markets.get_mut(market) {
                    let _ = m.close_pair(&self.ledger, *pair_id, trader, *q, *ts);
                    m.drain_events();
                }
            }
            JournalEvent::Tick { market, oracle, ts } => {
                if let Some(m) = self.markets.get_mut(market) {
                    m.tick(&self.ledger, *oracle, *ts);
                    m.drain_events();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, Side, Tif, LEVERAGE_SCALE, PRICE_SCALE};

    fn params() -> MarketParams {
        MarketParams {
            token: "0xmeme".into(),
            max_leverage: 100 * LEVERAGE_SCALE,
            maintenance_margin_bps: 100,
            taker_fee_bps: 5,
            maker_fee_bps: 2,
            funding_interval_s: 3_600,
            funding_clamp_bps: 50,
            insurance_fee_bps: 1_000,
            oracle_staleness_s: 10,
            allow_negative_insurance: false,
            kline_resolutions_s: vec![60],
        }
    }

    fn order(trader: &str, side: Side, price: i128, size: i128, nonce: u64) -> OrderInput {
        OrderInput {
            client_id: None,
            trader: trader.into(),
            market: "0xmeme".into(),
            side,
            order_type: if price == 0 { OrderType::Market } else { OrderType::Limit },
            size,
            leverage: 5 * LEVERAGE_SCALE,
            price,
            tif: if price == 0 { Tif::Ioc } else { Tif::Gtc },
            reduce_only: false,
            tp: None,
            sl: None,
            deadline: u64::MAX,
            nonce,
        }
    }

    fn journal_fixture() -> Vec<JournalEvent> {
        vec![
            JournalEvent::Deposit { trader: "alice".into(), amount: 10_000 * PRICE_SCALE, ts: 1 },
            JournalEvent::Deposit { trader: "bob".into(), amount: 10_000 * PRICE_SCALE, ts: 1 },
            JournalEvent::OrderAdmitted { input: order("alice", Side::Long, 10 * PRICE_SCALE, 100, 0), ts: 2 },
            JournalEvent::Tick {
                market: "0xmeme".into(),
                oracle: Some(OraclePrice { price: 10 * PRICE_SCALE, ts: 3 }),
                ts: 3,
            },
            JournalEvent::OrderAdmitted { input: order("bob", Side::Short, 0, 60, 0), ts: 4 },
            JournalEvent::Tick {
                market: "0xmeme".into(),
                oracle: Some(OraclePrice { price: 11 * PRICE_SCALE, ts: 5 }),
                ts: 5,
            },
            JournalEvent::ClosePair { market: "0xmeme".into(), pair_id: 1, trader: "bob".into(), q: None, ts: 6 },
        ]
    }

    fn state_digest(replay: &Replay) -> (Vec<(String, i128, i128, i128, u64)>, i128, i128, u64) {
        let mut accounts: Vec<(String, i128, i128, i128, u64)> = replay
            .ledger
            .traders()
            .into_iter()
            .map(|t| {
                let a = replay.ledger.snapshot(&t);
                (t, a.free, a.locked_orders, a.locked_margin, a.nonce)
            })
            .collect();
        accounts.sort();
        let m = &replay.markets["0xmeme"];
        (accounts, m.insurance(), m.pairs().open_interest(), m.orders_iter().count() as u64)
    }

    #[test]
    fn test_replay_prefix_reproduces_state() {
        let events = journal_fixture();
        // full run
        let mut full = Replay::new(vec![(params(), 0)], 0);
        for e in &events {
            full.apply(e);
        }
        // prefix run continued with the suffix must land in the same state
        for split in 0..events.len() {
            let mut replay = Replay::new(vec![(params(), 0)], 0);
            for e in &events[..split] {
                replay.apply(e);
            }
            for e in &events[split..] {
                replay.apply(e);
            }
            assert_eq!(state_digest(&replay), state_digest(&full), "split at {split}");
        }
    }

    #[test]
    fn test_rejected_submission_replays_identically() {
        let mut events = journal_fixture();
        // a nonce-consumed but rejected order (bad leverage) is journaled too
        let mut bad = order("alice", Side::Long, 10 * PRICE_SCALE, 10, 1);
        bad.leverage = 500 * LEVERAGE_SCALE;
        events.push(JournalEvent::OrderAdmitted { input: bad, ts: 7 });

        let mut a = Replay::new(vec![(params(), 0)], 0);
        let mut b = Replay::new(vec![(params(), 0)], 0);
        for e in &events {
            a.apply(e);
            b.apply(e);
        }
        assert_eq!(state_digest(&a), state_digest(&b));
        assert_eq!(a.ledger.nonce("alice"), 2);
    }

    #[test]
    fn test_journal_event_round_trips_json() {
        for e in journal_fixture() {
            let s = serde_json::to_string(&e).unwrap();
            let back: JournalEvent = serde_json::from_str(&s).unwrap();
            assert_eq!(back, e);
        }
    }
}
