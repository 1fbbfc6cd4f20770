use crate::book::{BookLevel, OrderBook};
use crate::error::EngineError;
use crate::funding::{FundingState, FundingTick};
use crate::ledger::{AccountLedger, PROTOCOL_ACCOUNT};
use crate::liquidation;
use crate::matching;
use crate::pairs::PairLedger;
use crate::risk::{self, SideRisk};
use crate::types::{
    fee, notional, required_margin, Fill, LiquidationEvent, MarketParams, Order, OrderInput,
    OrderStatus, OrderType, OraclePrice, Pair, PairStatus, Side, Tif, BPS,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Protective collar for market orders, in bps of the admission price hint.
/// The reservation is sized to the collar, so a fill can never consume more
/// than was locked; residual beyond the collar is cancelled IOC-style.
const MARKET_COLLAR_BPS: i128 = 500;

const TRADES_RING: usize = 1_000;
const KLINES_RING: usize = 500;
const BOOK_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Kline {
    /// Bucket start, seconds.
    pub ts: u64,
    pub open: i128,
    pub high: i128,
    pub low: i128,
    pub close: i128,
    pub volume: i128,
}

#[derive(Debug, Clone, Copy, Default)]
struct OrderLock {
    reserved: i128,
    remaining: i128,
}

#[derive(Debug, Clone, Copy, Default)]
struct PairTriggers {
    tp_long: Option<i128>,
    sl_long: Option<i128>,
    tp_short: Option<i128>,
    sl_short: Option<i128>,
}

/// Everything the server needs to journal and broadcast, emitted in
/// processing order. Events are hand-off values: once drained, the engine
/// keeps no reference.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderAccepted { order: Order },
    OrderUpdated { order: Order },
    Trade { fill: Fill },
    Book { market: String, bids: Vec<BookLevel>, asks: Vec<BookLevel> },
    PairOpened { pair: Pair },
    PairUpdated { pair: Pair },
    PositionRisk { pair: Pair, mark: i128, long: SideRisk, short: SideRisk },
    BalanceTouched { trader: String },
    Liquidation { event: LiquidationEvent },
    Funding { tick: FundingTick },
    MarketRisk { market: String, mark: i128, insurance: i128, open_interest: i128, funding_index: i128 },
    Halt { market: String, halted: bool, reason: String },
    Kline { market: String, resolution_s: u64, candle: Kline },
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub order: Order,
    pub fills: Vec<Fill>,
}

#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub mark: Option<i128>,
    pub liquidated_pairs: Vec<u64>,
    pub funding_ticks: usize,
    pub expired_orders: usize,
    pub halted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HaltReason {
    OracleStale,
    InsuranceExhausted,
}

/// One market's entire mutable state. Logically single-writer: the server
/// drives each instance from exactly one worker task, so no locking happens
/// here; the shared account ledger carries its own per-account locks.
pub struct MarketEngine {
    params: MarketParams,
    book: OrderBook,
    orders: HashMap<u64, Order>,
    locks: HashMap<u64, OrderLock>,
    pairs: PairLedger,
    triggers: HashMap<u64, PairTriggers>,
    funding: FundingState,
    insurance: i128,
    mark: Option<i128>,
    last_trade: Option<i128>,
    last_oracle: Option<OraclePrice>,
    trades: VecDeque<Fill>,
    klines: HashMap<u64, VecDeque<Kline>>,
    halt: Option<HaltReason>,
    next_order_id: u64,
    fill_seq: u64,
    events: Vec<EngineEvent>,
}

impl MarketEngine {
    pub fn new(params: MarketParams, insurance_seed: i128, now: u64) -> Self {
        let klines = params.kline_resolutions_s.iter().map(|r| (*r, VecDeque::new())).collect();
        MarketEngine {
            params,
            book: OrderBook::new(),
            orders: HashMap::new(),
            locks: HashMap::new(),
            pairs: PairLedger::new(),
            triggers: HashMap::new(),
            funding: FundingState::new(now),
            insurance: insurance_seed,
            mark: None,
            last_trade: None,
            last_oracle: None,
            trades: VecDeque::new(),
            klines,
            halt: None,
            next_order_id: 0,
            fill_seq: 0,
            events: Vec::new(),
        }
    }

    pub fn params(&self) -> &MarketParams {
        &self.params
    }

    pub fn token(&self) -> &str {
        &self.params.token
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    pub fn insurance(&self) -> i128 {
        self.insurance
    }

    pub fn mark(&self) -> Option<i128> {
        self.mark
    }

    pub fn funding_index(&self) -> i128 {
        self.funding.index
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn pairs(&self) -> &PairLedger {
        &self.pairs
    }

    pub fn order(&self, id: u64) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn orders_iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn recent_trades(&self) -> &VecDeque<Fill> {
        &self.trades
    }

    pub fn klines(&self, resolution_s: u64) -> Option<&VecDeque<Kline>> {
        self.klines.get(&resolution_s)
    }

    /// Drain accumulated events for broadcast and journaling.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    fn push_book_event(&mut self) {
        self.events.push(EngineEvent::Book {
            market: self.params.token.clone(),
            bids: self.book.depth(Side::Long, BOOK_DEPTH),
            asks: self.book.depth(Side::Short, BOOK_DEPTH),
        });
    }

    fn mark_fallback(&self) -> Option<i128> {
        self.mark.or(self.book.mid()).or(self.last_trade)
    }

    /// Admission price hint: the best opposing quote for market orders, the
    /// limit price otherwise.
    fn price_hint(&self, input: &OrderInput) -> i128 {
        match input.order_type {
            OrderType::Limit => input.price,
            OrderType::Market => self
                .book
                .best(input.side.opposite())
                .or_else(|| self.mark_fallback())
                .unwrap_or(0),
        }
    }

    /// Worst price a fill may execute at, which sizes the reservation.
    fn reserve_price(&self, input: &OrderInput, hint: i128) -> i128 {
        match (input.order_type, input.side) {
            // long limit fills at or below its limit
            (OrderType::Limit, Side::Long) => input.price,
            // short limit can fill up at the best bid when crossing
            (OrderType::Limit, Side::Short) => {
                self.book.best(Side::Long).unwrap_or(input.price).max(input.price)
            }
            // market long pays at most the collar above the hint
            (OrderType::Market, Side::Long) => hint + hint * MARKET_COLLAR_BPS / BPS,
            // market short fills at the best bid or below
            (OrderType::Market, Side::Short) => hint,
        }
    }

    fn price_cap(&self, order: &Order, hint: i128) -> Option<i128> {
        match (order.order_type, order.side) {
            (OrderType::Limit, _) => Some(order.price),
            (OrderType::Market, Side::Long) => Some(hint + hint * MARKET_COLLAR_BPS / BPS),
            (OrderType::Market, Side::Short) => Some(hint - hint * MARKET_COLLAR_BPS / BPS),
        }
    }

    fn validate(&self, input: &OrderInput) -> Result<(), EngineError> {
        if input.market != self.params.token {
            return Err(EngineError::UnknownMarket(input.market.clone()));
        }
        if self.halt.is_some() {
            return Err(EngineError::MarketHalted(self.params.token.clone()));
        }
        if input.size <= 0 {
            return Err(EngineError::BadSize(input.size));
        }
        if input.leverage < crate::types::LEVERAGE_SCALE || input.leverage > self.params.max_leverage {
            return Err(EngineError::BadLeverage {
                got: input.leverage,
                max: self.params.max_leverage,
            });
        }
        match input.order_type {
            OrderType::Limit if input.price <= 0 => return Err(EngineError::BadPrice(input.price)),
            OrderType::Market if input.price != 0 => return Err(EngineError::BadPrice(input.price)),
            _ => {}
        }
        if input.reduce_only
            && self.pairs.exposure(&input.trader, input.side.opposite()) < input.size
        {
            return Err(EngineError::BadSize(input.size));
        }
        Ok(())
    }

    /// Admit, reserve, and match one authenticated order. Signature, nonce,
    /// and deadline were already checked by the authenticator.
    pub fn submit(
        &mut self,
        ledger: &AccountLedger,
        input: OrderInput,
        now: u64,
    ) -> Result<SubmitOutcome, EngineError> {
        self.validate(&input)?;

        let hint = self.price_hint(&input);

        // FOK is all-or-nothing before any state change, reservation included
        if input.tif == Tif::Fok {
            let cap = match input.order_type {
                OrderType::Limit => Some(input.price),
                OrderType::Market => Some(match input.side {
                    Side::Long => hint + hint * MARKET_COLLAR_BPS / BPS,
                    Side::Short => hint - hint * MARKET_COLLAR_BPS / BPS,
                }),
            };
            let available = self.book.fillable(input.side, cap, &input.trader);
            if available < input.size {
                return Err(EngineError::NotFillable { required: input.size, available });
            }
        }

        let reserve_price = self.reserve_price(&input, hint);
        let reserve_fee_bps = self.params.taker_fee_bps.max(self.params.maker_fee_bps);
        let reserve = required_margin(input.size, reserve_price, input.leverage)
            + fee(notional(reserve_price, input.size), reserve_fee_bps);
        ledger.reserve_for_order(&input.trader, reserve)?;

        self.next_order_id += 1;
        let order = Order::from_input(self.next_order_id, input, now);
        self.locks.insert(order.id, OrderLock { reserved: reserve, remaining: reserve });
        let cap = self.price_cap(&order, hint);

        let result = match matching::execute(&mut self.book, order.clone(), cap, now) {
            Ok(r) => r,
            Err(e) => {
                // FOK pre-walk rejection: roll the reservation back whole
                ledger.release_order(&order.trader, reserve);
                self.locks.remove(&order.id);
                return Err(e);
            }
        };

        self.events.push(EngineEvent::OrderAccepted { order: order.clone() });

        let mut taker = result.taker;
        let mut fills = Vec::with_capacity(result.execs.len());
        for exec in &result.execs {
            let fill = self.settle_exec(ledger, &taker, exec, now);
            fills.push(fill);
        }

        for mut cancelled in result.stp_cancelled {
            self.finish_order_lock(ledger, cancelled.id, &cancelled.trader);
            cancelled.status = OrderStatus::Cancelled;
            self.orders.insert(cancelled.id, cancelled.clone());
            self.events.push(EngineEvent::OrderUpdated { order: cancelled });
        }

        // residual disposition by TIF
        if taker.remaining() > 0 && !result.taker_stp_cancelled {
            let rests = taker.order_type == OrderType::Limit && taker.tif == Tif::Gtc;
            if rests {
                self.book.insert(taker.clone());
            } else {
                taker.status = OrderStatus::Cancelled;
                taker.updated_at = now;
            }
        }
        if taker.status.is_terminal() || taker.remaining() == 0 {
            self.finish_order_lock(ledger, taker.id, &taker.trader);
        }

        self.orders.insert(taker.id, taker.clone());
        self.events.push(EngineEvent::OrderUpdated { order: taker.clone() });
        self.events.push(EngineEvent::BalanceTouched { trader: taker.trader.clone() });
        self.push_book_event();

        Ok(SubmitOutcome { order: taker, fills })
    }

    /// Money and pair bookkeeping for one execution.
    fn settle_exec(
        &mut self,
        ledger: &AccountLedger,
        taker: &Order,
        exec: &matching::MatchExec,
        now: u64,
    ) -> Fill {
        let q = exec.size;
        let price = exec.price;
        let maker = &exec.maker;
        let fill_notional = notional(price, q);
        let taker_fee = fee(fill_notional, self.params.taker_fee_bps);
        let maker_fee = fee(fill_notional, self.params.maker_fee_bps);

        let taker_margin = required_margin(q, price, taker.leverage);
        let maker_margin = required_margin(q, price, maker.leverage);
        self.consume_lock(ledger, taker, q, taker_margin, taker_fee);
        self.consume_lock(ledger, maker, q, maker_margin, maker_fee);

        // route fees: a configured fraction accrues to the insurance fund
        let fees = taker_fee + maker_fee;
        let insurance_cut = fees * self.params.insurance_fee_bps / BPS;
        self.insurance += insurance_cut;
        ledger.settle_pnl(PROTOCOL_ACCOUNT, fees - insurance_cut);

        let (long_order, short_order, long_margin, short_margin) = match taker.side {
            Side::Long => (taker, maker, taker_margin, maker_margin),
            Side::Short => (maker, taker, maker_margin, taker_margin),
        };
        let pair = self.pairs.open(
            &self.params.token,
            long_order.trader.clone(),
            short_order.trader.clone(),
            q,
            price,
            long_order.leverage,
            short_order.leverage,
            long_margin,
            short_margin,
            self.funding.index,
            now,
        );
        let triggers = PairTriggers {
            tp_long: long_order.tp,
            sl_long: long_order.sl,
            tp_short: short_order.tp,
            sl_short: short_order.sl,
        };
        if triggers.tp_long.is_some()
            || triggers.sl_long.is_some()
            || triggers.tp_short.is_some()
            || triggers.sl_short.is_some()
        {
            self.triggers.insert(pair.pair_id, triggers);
        }

        self.fill_seq += 1;
        let fill = Fill {
            seq: self.fill_seq,
            market: self.params.token.clone(),
            taker_order: taker.id,
            maker_order: maker.id,
            taker: taker.trader.clone(),
            maker: maker.trader.clone(),
            taker_side: taker.side,
            price,
            size: q,
            taker_fee,
            maker_fee,
            ts: now,
        };
        self.last_trade = Some(price);
        self.record_kline(price, q, now);
        self.trades.push_back(fill.clone());
        if self.trades.len() > TRADES_RING {
            self.trades.pop_front();
        }

        // maker book copy already advanced inside the matching walk
        self.orders.insert(maker.id, maker.clone());
        if maker.status.is_terminal() {
            self.finish_order_lock(ledger, maker.id, &maker.trader);
        }
        self.events.push(EngineEvent::Trade { fill: fill.clone() });
        self.events.push(EngineEvent::PairOpened { pair });
        self.events.push(EngineEvent::OrderUpdated { order: maker.clone() });
        self.events.push(EngineEvent::BalanceTouched { trader: maker.trader.clone() });
        fill
    }

    /// Consume the order lock for a fill: fee out, margin committed, price
    /// improvement released.
    fn consume_lock(&mut self, ledger: &AccountLedger, order: &Order, q: i128, margin: i128, fee: i128) {
        let lock = self.locks.entry(order.id).or_default();
        let pro_rata = lock.reserved * q / order.size.max(1);
        let consume = pro_rata.max(margin + fee).min(lock.remaining);
        lock.remaining -= consume;
        if ledger.fee_from_lock(&order.trader, fee).is_ok() {
            let _ = ledger.commit_margin(&order.trader, consume - fee, margin);
        }
    }

    /// Release whatever is left of an order's reservation once it is
    /// terminal.
    fn finish_order_lock(&mut self, ledger: &AccountLedger, order_id: u64, trader: &str) {
        if let Some(lock) = self.locks.remove(&order_id) {
            if lock.remaining > 0 {
                ledger.release_order(trader, lock.remaining);
            }
        }
    }

    /// Client cancel. Either the order is still resting (cancel wins) or it
    /// is already terminal (`AlreadyTerminal`): both run on the market
    /// worker, so a cancel can never race an in-flight fill.
    pub fn cancel(
        &mut self,
        ledger: &AccountLedger,
        order_id: u64,
        trader: &str,
        now: u64,
    ) -> Result<Order, EngineError> {
        let known = self.orders.get(&order_id).ok_or(EngineError::UnknownOrder(order_id))?;
        if known.trader != trader {
            return Err(EngineError::UnknownOrder(order_id));
        }
        match self.book.remove(order_id) {
            Some(mut resting) => {
                resting.status = OrderStatus::Cancelled;
                resting.updated_at = now;
                self.finish_order_lock(ledger, order_id, trader);
                self.orders.insert(order_id, resting.clone());
                self.events.push(EngineEvent::OrderUpdated { order: resting.clone() });
                self.events.push(EngineEvent::BalanceTouched { trader: trader.to_string() });
                self.push_book_event();
                Ok(resting)
            }
            None => Err(EngineError::AlreadyTerminal(order_id)),
        }
    }

    /// Voluntary close of `q` (default: all) of a pair by one of its
    /// parties. The requester pays the taker close fee, the counterparty the
    /// maker fee.
    pub fn close_pair(
        &mut self,
        ledger: &AccountLedger,
        pair_id: u64,
        trader: &str,
        q: Option<i128>,
        now: u64,
    ) -> Result<Pair, EngineError> {
        let pair = self
            .pairs
            .get(pair_id)
            .filter(|p| p.status == PairStatus::Open)
            .ok_or(EngineError::UnknownPair(pair_id))?
            .clone();
        let requester_side = if pair.long_trader == trader {
            Side::Long
        } else if pair.short_trader == trader {
            Side::Short
        } else {
            return Err(EngineError::NotPairParty(pair_id));
        };
        let q = q.unwrap_or(pair.size);
        if q <= 0 || q > pair.size {
            return Err(EngineError::BadSize(q));
        }
        let mark = self
            .mark_fallback()
            .ok_or_else(|| EngineError::OracleStale {
                market: self.params.token.clone(),
                last_ts: self.last_oracle.map(|o| o.ts).unwrap_or(0),
                now,
            })?;
        let (fee_long_bps, fee_short_bps) = match requester_side {
            Side::Long => (self.params.taker_fee_bps, self.params.maker_fee_bps),
            Side::Short => (self.params.maker_fee_bps, self.params.taker_fee_bps),
        };
        self.do_close(ledger, pair_id, q, mark, fee_long_bps, fee_short_bps, now)
    }

    fn do_close(
        &mut self,
        ledger: &AccountLedger,
        pair_id: u64,
        q: i128,
        mark: i128,
        fee_long_bps: i128,
        fee_short_bps: i128,
        now: u64,
    ) -> Result<Pair, EngineError> {
        let breakdown = self
            .pairs
            .compute_close(pair_id, q, mark, self.funding.index, fee_long_bps, fee_short_bps)
            .ok_or(EngineError::UnknownPair(pair_id))?;
        let pair = self.pairs.get(pair_id).ok_or(EngineError::UnknownPair(pair_id))?.clone();

        let mut shortfall = 0;
        shortfall += ledger.close_out(
            &pair.long_trader,
            breakdown.release(Side::Long),
            breakdown.delta(Side::Long),
        );
        shortfall += ledger.close_out(
            &pair.short_trader,
            breakdown.release(Side::Short),
            breakdown.delta(Side::Short),
        );
        if shortfall > 0 {
            self.insurance -= shortfall;
            if self.insurance < 0 && !self.params.allow_negative_insurance {
                self.set_halt(HaltReason::InsuranceExhausted, now);
            }
        }

        let fees = breakdown.total_fees();
        let insurance_cut = fees * self.params.insurance_fee_bps / BPS;
        self.insurance += insurance_cut;
        ledger.settle_pnl(PROTOCOL_ACCOUNT, fees - insurance_cut);

        let after = self
            .pairs
            .apply_close(pair_id, &breakdown, PairStatus::Closed)
            .ok_or(EngineError::UnknownPair(pair_id))?;
        if breakdown.closes {
            self.triggers.remove(&pair_id);
        }
        self.events.push(EngineEvent::PairUpdated { pair: after.clone() });
        self.events.push(EngineEvent::BalanceTouched { trader: pair.long_trader.clone() });
        self.events.push(EngineEvent::BalanceTouched { trader: pair.short_trader.clone() });
        Ok(after)
    }

    fn set_halt(&mut self, reason: HaltReason, _now: u64) {
        if self.halt.is_none() {
            self.halt = Some(reason);
            self.events.push(EngineEvent::Halt {
                market: self.params.token.clone(),
                halted: true,
                reason: match reason {
                    HaltReason::OracleStale => "oracle_stale".to_string(),
                    HaltReason::InsuranceExhausted => "insurance_exhausted".to_string(),
                },
            });
        }
    }

    /// The 100 ms risk tick. Idempotent: a missed tick is caught up on the
    /// next call through the funding interval arithmetic and the sweep
    /// below; no state depends on tick count.
    pub fn tick(&mut self, ledger: &AccountLedger, oracle: Option<OraclePrice>, now: u64) -> TickOutcome {
        let mut out = TickOutcome::default();
        if let Some(o) = oracle {
            self.last_oracle = Some(o);
        }

        let fresh_oracle = self
            .last_oracle
            .filter(|o| risk::oracle_fresh(o, now, self.params.oracle_staleness_s));

        match (fresh_oracle, self.halt) {
            (None, None) => {
                // stale oracle pauses admission; open pairs are left alone
                self.set_halt(HaltReason::OracleStale, now);
                out.halted = true;
                return out;
            }
            (None, Some(_)) => {
                out.halted = true;
                return out;
            }
            (Some(_), Some(HaltReason::OracleStale)) => {
                self.halt = None;
                self.events.push(EngineEvent::Halt {
                    market: self.params.token.clone(),
                    halted: false,
                    reason: "oracle_recovered".to_string(),
                });
            }
            _ => {}
        }
        let oracle_spot = match fresh_oracle {
            Some(o) => o.price,
            None => return out,
        };

        // expire resting orders past their deadline
        let expired = self.book.sweep_expired(now);
        out.expired_orders = expired.len();
        for mut order in expired {
            self.finish_order_lock(ledger, order.id, &order.trader);
            order.status = OrderStatus::Expired;
            order.updated_at = now;
            self.events.push(EngineEvent::OrderUpdated { order: order.clone() });
            self.events.push(EngineEvent::BalanceTouched { trader: order.trader.clone() });
            self.orders.insert(order.id, order);
        }
        if out.expired_orders > 0 {
            self.push_book_event();
        }

        // recompute mark and advance funding
        let mark = match risk::mark_price(Some(oracle_spot), self.book.mid(), self.last_trade) {
            Some(m) => m,
            None => return out,
        };
        self.mark = Some(mark);
        out.mark = Some(mark);
        for tick in self.funding.advance(now, mark, oracle_spot, &self.params) {
            out.funding_ticks += 1;
            self.events.push(EngineEvent::Funding { tick });
        }

        self.run_triggers(ledger, mark, now);
        out.liquidated_pairs = self.run_liquidations(ledger, mark, now);
        self.publish_position_risk(mark);
        self.events.push(EngineEvent::MarketRisk {
            market: self.params.token.clone(),
            mark,
            insurance: self.insurance,
            open_interest: self.pairs.open_interest(),
            funding_index: self.funding.index,
        });
        out.halted = self.halt.is_some();
        out
    }

    /// Convert touched take-profit / stop-loss triggers into full closes at
    /// mark. The triggered side is the fee taker.
    fn run_triggers(&mut self, ledger: &AccountLedger, mark: i128, now: u64) {
        let hits: Vec<(u64, Side)> = self
            .triggers
            .iter()
            .filter_map(|(pair_id, t)| {
                let pair = self.pairs.get(*pair_id)?;
                if pair.status != PairStatus::Open {
                    return None;
                }
                let long_hit = t.tp_long.is_some_and(|p| mark >= p)
                    || t.sl_long.is_some_and(|p| mark <= p);
                let short_hit = t.tp_short.is_some_and(|p| mark <= p)
                    || t.sl_short.is_some_and(|p| mark >= p);
                if long_hit {
                    Some((*pair_id, Side::Long))
                } else if short_hit {
                    Some((*pair_id, Side::Short))
                } else {
                    None
                }
            })
            .collect();
        for (pair_id, side) in hits {
            let size = match self.pairs.get(pair_id) {
                Some(p) => p.size,
                None => continue,
            };
            let (fl, fs) = match side {
                Side::Long => (self.params.taker_fee_bps, self.params.maker_fee_bps),
                Side::Short => (self.params.maker_fee_bps, self.params.taker_fee_bps),
            };
            let _ = self.do_close(ledger, pair_id, size, mark, fl, fs, now);
            self.triggers.remove(&pair_id);
        }
    }

    /// Post-tick pass: no open pair may stay below maintenance margin.
    fn run_liquidations(&mut self, ledger: &AccountLedger, mark: i128, now: u64) -> Vec<u64> {
        let mmr = self.params.maintenance_margin_bps;
        let liquidatable: Vec<(u64, Side)> = self
            .pairs
            .open_iter()
            .filter_map(|p| {
                for side in [Side::Long, Side::Short] {
                    if risk::side_risk(p, side, mark, self.funding.index, mmr).liquidatable {
                        return Some((p.pair_id, side));
                    }
                }
                None
            })
            .collect();
        let mut closed = Vec::new();
        for (pair_id, side) in liquidatable {
            let insurance = self.insurance;
            if let Some(outcome) = liquidation::liquidate(
                &mut self.pairs,
                ledger,
                insurance,
                &self.params,
                pair_id,
                side,
                mark,
                self.funding.index,
                now,
            ) {
                self.insurance = outcome.insurance_after;
                self.triggers.remove(&pair_id);
                closed.push(pair_id);
                self.events.push(EngineEvent::Liquidation { event: outcome.event });
                self.events.push(EngineEvent::PairUpdated { pair: outcome.pair_after });
                for pair in outcome.adl_pairs {
                    self.triggers.remove(&pair.pair_id);
                    self.events.push(EngineEvent::PairUpdated { pair });
                }
                for trader in outcome.touched {
                    self.events.push(EngineEvent::BalanceTouched { trader });
                }
                if outcome.halt {
                    self.set_halt(HaltReason::InsuranceExhausted, now);
                }
            }
        }
        closed
    }

    fn publish_position_risk(&mut self, mark: i128) {
        let mmr = self.params.maintenance_margin_bps;
        let updates: Vec<EngineEvent> = self
            .pairs
            .open_iter()
            .map(|p| EngineEvent::PositionRisk {
                pair: p.clone(),
                mark,
                long: risk::side_risk(p, Side::Long, mark, self.funding.index, mmr),
                short: risk::side_risk(p, Side::Short, mark, self.funding.index, mmr),
            })
            .collect();
        self.events.extend(updates);
    }

    fn record_kline(&mut self, price: i128, size: i128, now: u64) {
        for (resolution, ring) in self.klines.iter_mut() {
            let step = (*resolution).max(1);
            let bucket = now - now % step;
            match ring.back_mut() {
                Some(candle) if candle.ts == bucket => {
                    candle.high = candle.high.max(price);
                    candle.low = candle.low.min(price);
                    candle.close = price;
                    candle.volume += size;
                }
                _ => {
                    ring.push_back(Kline {
                        ts: bucket,
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        volume: size,
                    });
                    if ring.len() > KLINES_RING {
                        ring.pop_front();
                    }
                }
            }
        }
        let candles: Vec<(u64, Kline)> = self
            .klines
            .iter()
            .filter_map(|(r, ring)| ring.back().map(|c| (*r, *c)))
            .collect();
        for (resolution_s, candle) in candles {
            self.events.push(EngineEvent::Kline {
                market: self.params.token.clone(),
                resolution_s,
                candle,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LEVERAGE_SCALE, PRICE_SCALE};

    fn params() -> MarketParams {
        MarketParams {
            token: "0xmeme".into(),
            max_leverage: 100 * LEVERAGE_SCALE,
            maintenance_margin_bps: 100,
            taker_fee_bps: 0,
            maker_fee_bps: 0,
            funding_interval_s: 3_600,
            funding_clamp_bps: 50,
            insurance_fee_bps: 1_000,
            oracle_staleness_s: 10,
            allow_negative_insurance: false,
            kline_resolutions_s: vec![60],
        }
    }

    fn engine() -> (MarketEngine, AccountLedger) {
        let ledger = AccountLedger::new();
        for t in ["alice", "bob", "carol"] {
            ledger.deposit(t, 1_000_000 * PRICE_SCALE);
        }
        (MarketEngine::new(params(), 0, 0), ledger)
    }

    fn limit_input(trader: &str, side: Side, price: i128, size: i128) -> OrderInput {
        OrderInput {
            client_id: None,
            trader: trader.into(),
            market: "0xmeme".into(),
            side,
            order_type: OrderType::Limit,
            size,
            leverage: 5 * LEVERAGE_SCALE,
            price,
            tif: Tif::Gtc,
            reduce_only: false,
            tp: None,
            sl: None,
            deadline: u64::MAX,
            nonce: 0,
        }
    }

    fn market_input(trader: &str, side: Side, size: i128) -> OrderInput {
        OrderInput {
            order_type: OrderType::Market,
            price: 0,
            tif: Tif::Ioc,
            ..limit_input(trader, side, 0, size)
        }
    }

    #[test]
    fn test_limit_rest_then_market_fill_creates_pair() {
        let (mut eng, ledger) = engine();
        let r = eng.submit(&ledger, limit_input("alice", Side::Long, 10 * PRICE_SCALE, 100), 1).unwrap();
        assert!(r.fills.is_empty());
        assert_eq!(r.order.status, OrderStatus::Pending);

        let r = eng.submit(&ledger, market_input("bob", Side::Short, 100), 2).unwrap();
        assert_eq!(r.fills.len(), 1);
        let fill = &r.fills[0];
        assert_eq!(fill.price, 10 * PRICE_SCALE);
        assert_eq!(fill.size, 100);

        let pair = eng.pairs().open_iter().next().unwrap();
        assert_eq!(pair.long_trader, "alice");
        assert_eq!(pair.short_trader, "bob");
        assert_eq!(pair.entry_price, 10 * PRICE_SCALE);
        // 5x leverage: collateral = 1000/5 = 200 each
        assert_eq!(pair.collateral_long, 200 * PRICE_SCALE);
        assert_eq!(pair.collateral_short, 200 * PRICE_SCALE);

        // margin committed, remainder of reservations released
        let a = ledger.snapshot("alice");
        assert_eq!(a.locked_margin, 200 * PRICE_SCALE);
        assert_eq!(a.locked_orders, 0);
        assert_eq!(a.free, 999_800 * PRICE_SCALE);
    }

    #[test]
    fn test_market_against_empty_book_cancelled_funds_released() {
        let (mut eng, ledger) = engine();
        let r = eng.submit(&ledger, market_input("bob", Side::Long, 50), 1).unwrap();
        assert_eq!(r.order.status, OrderStatus::Cancelled);
        assert!(r.fills.is_empty());
        let a = ledger.snapshot("bob");
        assert_eq!(a.free, 1_000_000 * PRICE_SCALE);
        assert_eq!(a.locked_orders, 0);
    }

    #[test]
    fn test_cancel_resting_releases_lock() {
        let (mut eng, ledger) = engine();
        let r = eng.submit(&ledger, limit_input("alice", Side::Long, 10 * PRICE_SCALE, 100), 1).unwrap();
        assert!(ledger.snapshot("alice").locked_orders > 0);
        let cancelled = eng.cancel(&ledger, r.order.id, "alice", 2).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(ledger.snapshot("alice").locked_orders, 0);
        assert_eq!(ledger.snapshot("alice").free, 1_000_000 * PRICE_SCALE);
        // cancelling again: terminal
        let err = eng.cancel(&ledger, r.order.id, "alice", 3).unwrap_err();
        assert_eq!(err, EngineError::AlreadyTerminal(r.order.id));
    }

    #[test]
    fn test_close_flat_mark_zero_pnl() {
        let (mut eng, ledger) = engine();
        eng.submit(&ledger, limit_input("alice", Side::Long, 10 * PRICE_SCALE, 100), 1).unwrap();
        eng.submit(&ledger, market_input("bob", Side::Short, 100), 2).unwrap();
        eng.tick(&ledger, Some(OraclePrice { price: 10 * PRICE_SCALE, ts: 3 }), 3);

        let pair_id = eng.pairs().open_iter().next().unwrap().pair_id;
        let after = eng.close_pair(&ledger, pair_id, "alice", None, 4).unwrap();
        assert_eq!(after.status, PairStatus::Closed);
        assert_eq!(ledger.snapshot("alice").free, 1_000_000 * PRICE_SCALE);
        assert_eq!(ledger.snapshot("bob").free, 1_000_000 * PRICE_SCALE);
        assert_eq!(ledger.snapshot("alice").locked_margin, 0);
    }

    #[test]
    fn test_close_transfers_profit() {
        let (mut eng, ledger) = engine();
        eng.submit(&ledger, limit_input("alice", Side::Long, 10 * PRICE_SCALE, 100), 1).unwrap();
        eng.submit(&ledger, market_input("bob", Side::Short, 100), 2).unwrap();
        // oracle 12, last trade 10, empty book -> mark 11
        eng.tick(&ledger, Some(OraclePrice { price: 12 * PRICE_SCALE, ts: 3 }), 3);
        let mark = eng.mark().unwrap();
        let pair_id = eng.pairs().open_iter().next().unwrap().pair_id;
        eng.close_pair(&ledger, pair_id, "bob", None, 4).unwrap();
        let gain = (mark - 10 * PRICE_SCALE) * 100;
        assert_eq!(ledger.snapshot("alice").free, 1_000_000 * PRICE_SCALE + gain);
        assert_eq!(ledger.snapshot("bob").free, 1_000_000 * PRICE_SCALE - gain);
    }

    #[test]
    fn test_oracle_staleness_halts_and_recovers() {
        let (mut eng, ledger) = engine();
        eng.tick(&ledger, Some(OraclePrice { price: 10 * PRICE_SCALE, ts: 1 }), 1);
        assert!(!eng.is_halted());
        // no oracle for longer than the bound
        let out = eng.tick(&ledger, None, 20);
        assert!(out.halted);
        assert!(eng.is_halted());
        let err = eng.submit(&ledger, market_input("bob", Side::Long, 10), 21).unwrap_err();
        assert_eq!(err, EngineError::MarketHalted("0xmeme".into()));
        // oracle recovers
        let out = eng.tick(&ledger, Some(OraclePrice { price: 10 * PRICE_SCALE, ts: 25 }), 25);
        assert!(!out.halted);
        assert!(!eng.is_halted());
    }

    #[test]
    fn test_tick_liquidates_underwater_pair() {
        let (mut eng, ledger) = engine();
        let mut long = limit_input("alice", Side::Long, 10 * PRICE_SCALE, 100);
        long.leverage = 100 * LEVERAGE_SCALE;
        eng.submit(&ledger, long, 1).unwrap();
        let mut short = market_input("bob", Side::Short, 100);
        short.leverage = 100 * LEVERAGE_SCALE;
        eng.submit(&ledger, short, 2).unwrap();

        // 100x: collateral 10 each; mark 9.85 breaches 1% maintenance
        let out = eng.tick(&ledger, Some(OraclePrice { price: 9_850_000, ts: 3 }), 3);
        // mark = median(9.85, none, 10) = (9.85 + 10) / 2
        assert_eq!(out.mark, Some((9_850_000 + 10_000_000) / 2));
        assert_eq!(out.liquidated_pairs.len(), 1);
        let pair = eng.pairs().iter().next().unwrap();
        assert_eq!(pair.status, PairStatus::Liquidated);
        assert!(eng.pairs().open_iter().next().is_none());
    }

    #[test]
    fn test_take_profit_trigger_closes_pair() {
        let (mut eng, ledger) = engine();
        let mut long = limit_input("alice", Side::Long, 10 * PRICE_SCALE, 100);
        long.tp = Some(11 * PRICE_SCALE);
        eng.submit(&ledger, long, 1).unwrap();
        eng.submit(&ledger, market_input("bob", Side::Short, 100), 2).unwrap();
        // mark rises through the TP
        eng.tick(&ledger, Some(OraclePrice { price: 13 * PRICE_SCALE, ts: 3 }), 3);
        let pair = eng.pairs().iter().next().unwrap();
        assert_eq!(pair.status, PairStatus::Closed);
        // alice banked the move from 10 to the mark
        assert!(ledger.snapshot("alice").free > 1_000_000 * PRICE_SCALE);
    }

    #[test]
    fn test_events_drained_once() {
        let (mut eng, ledger) = engine();
        eng.submit(&ledger, limit_input("alice", Side::Long, 10 * PRICE_SCALE, 100), 1).unwrap();
        let events = eng.drain_events();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::OrderAccepted { .. })));
        assert!(eng.drain_events().is_empty());
    }

    #[test]
    fn test_kline_aggregation() {
        let (mut eng, ledger) = engine();
        eng.submit(&ledger, limit_input("alice", Side::Long, 10 * PRICE_SCALE, 60), 10).unwrap();
        eng.submit(&ledger, market_input("bob", Side::Short, 30), 20).unwrap();
        eng.submit(&ledger, market_input("carol", Side::Short, 30), 70).unwrap();
        let ring = eng.klines(60).unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0].ts, 0);
        assert_eq!(ring[0].volume, 30);
        assert_eq!(ring[1].ts, 60);
    }
}
