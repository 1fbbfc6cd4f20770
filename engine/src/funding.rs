use crate::types::{MarketParams, BPS};
use serde::{Deserialize, Serialize};

/// One funding-interval advance, journaled and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingTick {
    pub market: String,
    pub ts: u64,
    /// Clamped per-interval rate in bps of mark; positive means longs pay.
    pub rate_bps: i128,
    pub index: i128,
}

/// Per-market monotone funding accumulator. The index is in price units per
/// base unit: a pair's pending funding is `(index_now - index_at_open) * size`,
/// paid long -> short when positive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingState {
    pub index: i128,
    pub last_update: u64,
}

impl FundingState {
    pub fn new(now: u64) -> Self {
        Self { index: 0, last_update: now }
    }

    /// Advance through every funding interval boundary that has elapsed.
    /// Catch-up is automatic: a missed tick applies on the next call using
    /// the same interval arithmetic.
    pub fn advance(
        &mut self,
        now: u64,
        mark: i128,
        oracle_spot: i128,
        params: &MarketParams,
    ) -> Vec<FundingTick> {
        let interval = params.funding_interval_s.max(1);
        let mut ticks = Vec::new();
        while now.saturating_sub(self.last_update) >= interval {
            self.last_update += interval;
            let rate_bps = premium_bps(mark, oracle_spot).clamp(
                -params.funding_clamp_bps,
                params.funding_clamp_bps,
            );
            self.index += mark * rate_bps / BPS;
            ticks.push(FundingTick {
                market: params.token.clone(),
                ts: self.last_update,
                rate_bps,
                index: self.index,
            });
        }
        ticks
    }
}

/// Premium of mark over oracle spot, in bps.
pub fn premium_bps(mark: i128, oracle_spot: i128) -> i128 {
    if oracle_spot == 0 {
        return 0;
    }
    (mark - oracle_spot) * BPS / oracle_spot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PRICE_SCALE;

    fn params() -> MarketParams {
        MarketParams {
            token: "0xmeme".into(),
            max_leverage: 1_000_000,
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

    #[test]
    fn test_no_tick_before_interval() {
        let mut f = FundingState::new(0);
        assert!(f.advance(3_599, 100, 100, &params()).is_empty());
        assert_eq!(f.index, 0);
    }

    #[test]
    fn test_clamped_rate() {
        let mut f = FundingState::new(0);
        // mark 10% above oracle -> 1000 bps premium, clamped to 50
        let ticks = f.advance(3_600, 110 * PRICE_SCALE, 100 * PRICE_SCALE, &params());
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].rate_bps, 50);
        assert_eq!(f.index, 110 * PRICE_SCALE * 50 / BPS);
    }

    #[test]
    fn test_catch_up_multiple_intervals() {
        let mut f = FundingState::new(0);
        let ticks = f.advance(3 * 3_600 + 10, 101 * PRICE_SCALE, 100 * PRICE_SCALE, &params());
        assert_eq!(ticks.len(), 3);
        assert_eq!(f.last_update, 3 * 3_600);
        // index is monotone under positive premium
        assert!(ticks.windows(2).all(|w| w[0].index <= w[1].index));
    }

    #[test]
    fn test_negative_premium() {
        assert_eq!(premium_bps(99 * PRICE_SCALE, 100 * PRICE_SCALE), -100);
    }
}
