//! Point-in-time read projections for the REST surface. Every function
//! reads one market engine synchronously on its worker, so a response is
//! internally consistent; nothing here mutates state.

use crate::book::BookLevel;
use crate::market::MarketEngine;
use crate::risk::{self, SideRisk};
use crate::types::{Fill, Order, OrderStatus, PairStatus, Side};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionView {
    pub pair_id: u64,
    pub market: String,
    pub side: Side,
    pub size: i128,
    pub entry_price: i128,
    pub leverage: u32,
    pub collateral: i128,
    pub mark: i128,
    pub risk: SideRisk,
    pub opened_at: u64,
    pub status: PairStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookSnapshot {
    pub market: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub mark: Option<i128>,
    pub last_trade: Option<i128>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketRiskView {
    pub market: String,
    pub mark: Option<i128>,
    pub insurance: i128,
    pub open_interest: i128,
    pub funding_index: i128,
    pub halted: bool,
}

/// Aggregated projected liquidations per price bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquidationBucket {
    pub price_low: i128,
    pub price_high: i128,
    pub notional_long: i128,
    pub notional_short: i128,
}

/// Margin committed and live uPnL for one trader in one market; the server
/// sums these across markets for the balance endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MarginSummary {
    pub locked_margin: i128,
    pub unrealized_pnl: i128,
}

pub fn positions_for(engine: &MarketEngine, trader: &str) -> Vec<PositionView> {
    let mark = match engine.mark() {
        Some(m) => m,
        None => return Vec::new(),
    };
    let mmr = engine.params().maintenance_margin_bps;
    let idx = engine.funding_index();
    let mut out = Vec::new();
    for pair in engine.pairs().open_iter() {
        for side in [Side::Long, Side::Short] {
            if pair.trader(side) != trader {
                continue;
            }
            out.push(PositionView {
                pair_id: pair.pair_id,
                market: pair.market.clone(),
                side,
                size: pair.size,
                entry_price: pair.entry_price,
                leverage: pair.leverage(side),
                collateral: pair.collateral(side),
                mark,
                risk: risk::side_risk(pair, side, mark, idx, mmr),
                opened_at: pair.opened_at,
                status: pair.status,
            });
        }
    }
    out.sort_by_key(|p| p.pair_id);
    out
}

pub fn margin_summary(engine: &MarketEngine, trader: &str) -> MarginSummary {
    let mark = engine.mark();
    let mut summary = MarginSummary::default();
    for pair in engine.pairs().open_iter() {
        for side in [Side::Long, Side::Short] {
            if pair.trader(side) != trader {
                continue;
            }
            summary.locked_margin += pair.collateral(side);
            if let Some(m) = mark {
                summary.unrealized_pnl += risk::upnl(pair, side, m);
            }
        }
    }
    summary
}

pub fn orders_for(engine: &MarketEngine, trader: &str, status: Option<OrderStatus>) -> Vec<Order> {
    let mut out: Vec<Order> = engine
        .orders_iter()
        .filter(|o| o.trader == trader)
        .filter(|o| status.map_or(true, |s| o.status == s))
        .cloned()
        .collect();
    out.sort_by_key(|o| o.id);
    out
}

pub fn book_snapshot(engine: &MarketEngine, depth: usize) -> BookSnapshot {
    BookSnapshot {
        market: engine.token().to_string(),
        bids: engine.book().depth(Side::Long, depth),
        asks: engine.book().depth(Side::Short, depth),
        mark: engine.mark(),
        last_trade: engine.recent_trades().back().map(|f| f.price),
    }
}

pub fn trades(engine: &MarketEngine, limit: usize) -> Vec<Fill> {
    engine.recent_trades().iter().rev().take(limit).cloned().collect()
}

pub fn market_risk(engine: &MarketEngine) -> MarketRiskView {
    MarketRiskView {
        market: engine.token().to_string(),
        mark: engine.mark(),
        insurance: engine.insurance(),
        open_interest: engine.pairs().open_interest(),
        funding_index: engine.funding_index(),
        halted: engine.is_halted(),
    }
}

/// Bucket every open pair side's projected liquidation price.
pub fn liquidation_map(engine: &MarketEngine, bucket_width: i128) -> Vec<LiquidationBucket> {
    let width = bucket_width.max(1);
    let mmr = engine.params().maintenance_margin_bps;
    let idx = engine.funding_index();
    let mut buckets: BTreeMap<i128, (i128, i128)> = BTreeMap::new();
    for pair in engine.pairs().open_iter() {
        for side in [Side::Long, Side::Short] {
            let liq = risk::liquidation_price(pair, side, idx, mmr);
            if liq <= 0 {
                continue;
            }
            let key = liq - liq % width;
            let entry = buckets.entry(key).or_default();
            let notional = pair.size * liq;
            match side {
                Side::Long => entry.0 += notional,
                Side::Short => entry.1 += notional,
            }
        }
    }
    buckets
        .into_iter()
        .map(|(low, (notional_long, notional_short))| LiquidationBucket {
            price_low: low,
            price_high: low + width,
            notional_long,
            notional_short,
        })
        .collect()
}
