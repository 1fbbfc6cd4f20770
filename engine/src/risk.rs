use crate::types::{OraclePrice, Pair, RiskLevel, Side, BPS};
use serde::{Deserialize, Serialize};

/// Mark price = median of oracle spot, book mid, and last trade, over
/// whichever of the three are currently available. The oracle input must
/// already be freshness-checked by the caller.
pub fn mark_price(
    oracle: Option<i128>,
    book_mid: Option<i128>,
    last_trade: Option<i128>,
) -> Option<i128> {
    let mut inputs: Vec<i128> = [oracle, book_mid, last_trade].into_iter().flatten().collect();
    if inputs.is_empty() {
        return None;
    }
    inputs.sort_unstable();
    let n = inputs.len();
    Some(if n % 2 == 1 {
        inputs[n / 2]
    } else {
        (inputs[n / 2 - 1] + inputs[n / 2]) / 2
    })
}

pub fn oracle_fresh(oracle: &OraclePrice, now: u64, staleness_s: u64) -> bool {
    now.saturating_sub(oracle.ts) <= staleness_s
}

/// Live risk numbers for one side of an open pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SideRisk {
    pub side: Side,
    pub upnl: i128,
    /// Signed funding owed by this side since open; negative is a credit.
    pub pending_funding: i128,
    pub equity: i128,
    pub margin_ratio_bps: i128,
    /// Price at which equity hits maintenance margin; 0 when unreachable.
    pub liquidation_price: i128,
    pub level: RiskLevel,
    pub liquidatable: bool,
}

pub fn upnl(pair: &Pair, side: Side, mark: i128) -> i128 {
    let long = (mark - pair.entry_price) * pair.size;
    match side {
        Side::Long => long,
        Side::Short => -long,
    }
}

pub fn pending_funding(pair: &Pair, side: Side, funding_index_now: i128) -> i128 {
    let long_owes = (funding_index_now - pair.funding_index_at_open) * pair.size;
    match side {
        Side::Long => long_owes,
        Side::Short => -long_owes,
    }
}

/// Solve `equity(p) == mmr * size * p` for the given side.
pub fn liquidation_price(pair: &Pair, side: Side, funding_index_now: i128, mmr_bps: i128) -> i128 {
    let size = pair.size;
    if size == 0 {
        return 0;
    }
    let f_long = (funding_index_now - pair.funding_index_at_open) * size;
    match side {
        Side::Long => {
            let numer = (pair.entry_price * size - pair.collateral_long + f_long) * BPS;
            let denom = size * (BPS - mmr_bps);
            if denom <= 0 || numer <= 0 {
                0
            } else {
                numer / denom
            }
        }
        Side::Short => {
            let numer = (pair.collateral_short + pair.entry_price * size + f_long) * BPS;
            let denom = size * (BPS + mmr_bps);
            numer / denom
        }
    }
}

pub fn side_risk(pair: &Pair, side: Side, mark: i128, funding_index_now: i128, mmr_bps: i128) -> SideRisk {
    let upnl = upnl(pair, side, mark);
    let pending = pending_funding(pair, side, funding_index_now);
    let equity = pair.collateral(side) + upnl - pending;
    let position_value = pair.size * mark;
    let margin_ratio_bps = if position_value > 0 {
        equity * BPS / position_value
    } else {
        i128::MAX
    };
    let liquidatable = margin_ratio_bps <= mmr_bps;
    let level = if liquidatable || margin_ratio_bps <= mmr_bps * 3 / 2 {
        RiskLevel::Critical
    } else if margin_ratio_bps <= mmr_bps * 3 {
        RiskLevel::High
    } else if margin_ratio_bps <= mmr_bps * 6 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    SideRisk {
        side,
        upnl,
        pending_funding: pending,
        equity,
        margin_ratio_bps,
        liquidation_price: liquidation_price(pair, side, funding_index_now, mmr_bps),
        level,
        liquidatable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PairStatus, LEVERAGE_SCALE, PRICE_SCALE};

    fn pair(size: i128, entry: i128, collateral: i128) -> Pair {
        Pair {
            pair_id: 1,
            market: "0xmeme".into(),
            long_trader: "alice".into(),
            short_trader: "bob".into(),
            size,
            entry_price: entry,
            leverage_long: 5 * LEVERAGE_SCALE,
            leverage_short: 5 * LEVERAGE_SCALE,
            collateral_long: collateral,
            collateral_short: collateral,
            funding_index_at_open: 0,
            opened_at: 0,
            status: PairStatus::Open,
        }
    }

    #[test]
    fn test_mark_median_of_three() {
        assert_eq!(mark_price(Some(100), Some(110), Some(105)), Some(105));
        assert_eq!(mark_price(Some(100), None, Some(110)), Some(105));
        assert_eq!(mark_price(None, None, Some(110)), Some(110));
        assert_eq!(mark_price(None, None, None), None);
    }

    #[test]
    fn test_upnl_is_zero_sum() {
        let p = pair(100, 10 * PRICE_SCALE, 200 * PRICE_SCALE);
        let mark = 12 * PRICE_SCALE;
        assert_eq!(upnl(&p, Side::Long, mark) + upnl(&p, Side::Short, mark), 0);
        assert_eq!(upnl(&p, Side::Long, mark), 200 * PRICE_SCALE);
    }

    #[test]
    fn test_margin_ratio_at_entry_equals_inverse_leverage() {
        // 5x leverage, flat mark: equity/notional = 1/5 = 2000 bps
        let p = pair(100, 10 * PRICE_SCALE, 200 * PRICE_SCALE);
        let r = side_risk(&p, Side::Long, 10 * PRICE_SCALE, 0, 100);
        assert_eq!(r.margin_ratio_bps, 2_000);
        assert_eq!(r.level, RiskLevel::Low);
        assert!(!r.liquidatable);
    }

    #[test]
    fn test_long_liquidation_price() {
        // 100x long: entry 10, collateral = 10, mmr 1%
        let p = pair(100, 10 * PRICE_SCALE, 10 * PRICE_SCALE);
        let liq = liquidation_price(&p, Side::Long, 0, 100);
        // numer = (1000 - 10) * 1e6 * 1e4, denom = 100 * 9900
        assert_eq!(liq, 990 * PRICE_SCALE * BPS / (100 * 9_900));
        // falling through the liquidation price flips liquidatable
        let r = side_risk(&p, Side::Long, liq - 1, 0, 100);
        assert!(r.liquidatable);
        assert_eq!(r.level, RiskLevel::Critical);
        let r = side_risk(&p, Side::Long, liq + PRICE_SCALE / 100, 0, 100);
        assert!(!r.liquidatable);
    }

    #[test]
    fn test_short_liquidation_price_above_entry() {
        let p = pair(100, 10 * PRICE_SCALE, 10 * PRICE_SCALE);
        let liq = liquidation_price(&p, Side::Short, 0, 100);
        assert!(liq > 10 * PRICE_SCALE);
        let r = side_risk(&p, Side::Short, liq + PRICE_SCALE, 0, 100);
        assert!(r.liquidatable);
    }

    #[test]
    fn test_funding_shifts_equity() {
        let p = pair(100, 10 * PRICE_SCALE, 200 * PRICE_SCALE);
        // positive index: long owes, short is credited
        let rl = side_risk(&p, Side::Long, 10 * PRICE_SCALE, 50, 100);
        let rs = side_risk(&p, Side::Short, 10 * PRICE_SCALE, 50, 100);
        assert_eq!(rl.pending_funding, 5_000);
        assert_eq!(rs.pending_funding, -5_000);
        assert_eq!(rl.equity + rs.equity, 400 * PRICE_SCALE);
    }

    #[test]
    fn test_risk_level_bands() {
        let p = pair(100, 10 * PRICE_SCALE, 10 * PRICE_SCALE);
        // 100x at entry: ratio = 100 bps = mmr -> critical
        let r = side_risk(&p, Side::Long, 10 * PRICE_SCALE, 0, 100);
        assert_eq!(r.level, RiskLevel::Critical);
        assert!(r.liquidatable);
    }
}
