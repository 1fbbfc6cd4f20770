use serde::{Deserialize, Serialize};

/// Prices and collateral amounts are fixed-point integers scaled by 1e6
/// (USD-margined deployment). `size` is a base-asset quantity, never notional.
pub const PRICE_SCALE: i128 = 1_000_000;

/// Leverage is scaled by 1e4 on the wire and internally: 10_000 = 1x.
pub const LEVERAGE_SCALE: u32 = 10_000;

pub const BPS: i128 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tif {
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Open,
    Closed,
    Liquidated,
    AdlReduced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Immutable input fields of an order, as admitted by the authenticator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderInput {
    pub client_id: Option<String>,
    pub trader: String,
    pub market: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: i128,
    /// 1e4-scaled leverage multiplier.
    pub leverage: u32,
    /// Limit price, 0 for market orders.
    pub price: i128,
    pub tif: Tif,
    pub reduce_only: bool,
    pub tp: Option<i128>,
    pub sl: Option<i128>,
    pub deadline: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: u64,
    pub client_id: Option<String>,
    pub trader: String,
    pub market: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: i128,
    pub leverage: u32,
    pub price: i128,
    pub tif: Tif,
    pub reduce_only: bool,
    pub tp: Option<i128>,
    pub sl: Option<i128>,
    pub deadline: u64,
    pub nonce: u64,
    pub filled: i128,
    pub avg_fill_price: i128,
    pub status: OrderStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Order {
    pub fn from_input(id: u64, input: OrderInput, now: u64) -> Self {
        Order {
            id,
            client_id: input.client_id,
            trader: input.trader,
            market: input.market,
            side: input.side,
            order_type: input.order_type,
            size: input.size,
            leverage: input.leverage,
            price: input.price,
            tif: input.tif,
            reduce_only: input.reduce_only,
            tp: input.tp,
            sl: input.sl,
            deadline: input.deadline,
            nonce: input.nonce,
            filled: 0,
            avg_fill_price: 0,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> i128 {
        self.size - self.filled
    }

    /// Record a fill of `q` at `price`, keeping the weighted-average entry.
    pub fn apply_fill(&mut self, q: i128, price: i128, now: u64) {
        let new_filled = self.filled + q;
        self.avg_fill_price = (self.avg_fill_price * self.filled + price * q) / new_filled;
        self.filled = new_filled;
        self.status = if self.filled == self.size {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.updated_at = now;
    }
}

/// One execution between a taker and a maker order. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    /// Per-market engine sequence number; fills are totally ordered within
    /// a market.
    pub seq: u64,
    pub market: String,
    pub taker_order: u64,
    pub maker_order: u64,
    pub taker: String,
    pub maker: String,
    pub taker_side: Side,
    pub price: i128,
    pub size: i128,
    pub taker_fee: i128,
    pub maker_fee: i128,
    pub ts: u64,
}

/// A matched long/short counterparty record; the unit of position accounting.
/// Neither trader mutates it directly: every state change is mediated by the
/// market engine that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pair {
    pub pair_id: u64,
    pub market: String,
    pub long_trader: String,
    pub short_trader: String,
    pub size: i128,
    pub entry_price: i128,
    pub leverage_long: u32,
    pub leverage_short: u32,
    pub collateral_long: i128,
    pub collateral_short: i128,
    pub funding_index_at_open: i128,
    pub opened_at: u64,
    pub status: PairStatus,
}

impl Pair {
    pub fn trader(&self, side: Side) -> &str {
        match side {
            Side::Long => &self.long_trader,
            Side::Short => &self.short_trader,
        }
    }

    pub fn collateral(&self, side: Side) -> i128 {
        match side {
            Side::Long => self.collateral_long,
            Side::Short => self.collateral_short,
        }
    }

    pub fn leverage(&self, side: Side) -> u32 {
        match side {
            Side::Long => self.leverage_long,
            Side::Short => self.leverage_short,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquidationEvent {
    pub pair_id: u64,
    pub market: String,
    pub side_closed: Side,
    pub mark_price: i128,
    pub collateral_lost: i128,
    pub insurance_delta: i128,
    pub adl_affected_pair_ids: Vec<u64>,
    pub ts: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OraclePrice {
    pub price: i128,
    pub ts: u64,
}

/// Static per-market parameters from deployment config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketParams {
    pub token: String,
    /// 1e4-scaled; e.g. 1_000_000 = 100x.
    pub max_leverage: u32,
    pub maintenance_margin_bps: i128,
    pub taker_fee_bps: i128,
    pub maker_fee_bps: i128,
    pub funding_interval_s: u64,
    /// Clamp on the per-interval funding rate, in bps of mark.
    pub funding_clamp_bps: i128,
    /// Fraction of protocol fees routed to the insurance fund, in bps.
    pub insurance_fee_bps: i128,
    /// Oracle staleness bound in seconds before the market halts.
    pub oracle_staleness_s: u64,
    pub allow_negative_insurance: bool,
    /// Kline resolutions to aggregate, in seconds.
    pub kline_resolutions_s: Vec<u64>,
}

pub fn notional(price: i128, size: i128) -> i128 {
    price.abs() * size.abs()
}

/// Initial margin = notional / leverage.
pub fn required_margin(size: i128, price: i128, leverage: u32) -> i128 {
    let lev = leverage.max(1) as i128;
    notional(price, size) * LEVERAGE_SCALE as i128 / lev
}

/// Divide rounding half-to-even, so fee rounding does not drift across
/// millions of fills.
pub fn div_round_half_even(n: i128, d: i128) -> i128 {
    debug_assert!(d > 0);
    let q = n.div_euclid(d);
    let r = n.rem_euclid(d);
    let twice = r * 2;
    if twice > d || (twice == d && q % 2 != 0) {
        q + 1
    } else {
        q
    }
}

pub fn fee(notional: i128, fee_bps: i128) -> i128 {
    div_round_half_even(notional * fee_bps, BPS)
}

/// Parse a decimal string into 1e6 fixed point. The wire carries all
/// monetary fields as decimal strings; floats never touch the write path.
pub fn parse_fixed(s: &str) -> Option<i128> {
    let s = s.trim();
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s),
    };
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.len() > 6 {
        return None;
    }
    let int: i128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac: i128 = if frac_part.is_empty() { 0 } else { frac_part.parse().ok()? };
    for _ in frac_part.len()..6 {
        frac *= 10;
    }
    Some(sign * (int * PRICE_SCALE + frac))
}

/// Render 1e6 fixed point as a decimal string, trimming trailing zeros.
pub fn format_fixed(v: i128) -> String {
    let sign = if v < 0 { "-" } else { "" };
    let v = v.abs();
    let int = v / PRICE_SCALE;
    let frac = v % PRICE_SCALE;
    if frac == 0 {
        return format!("{sign}{int}");
    }
    let frac = format!("{frac:06}");
    format!("{sign}{int}.{}", frac.trim_end_matches('0'))
}
