use crate::adl;
use crate::ledger::AccountLedger;
use crate::pairs::PairLedger;
use crate::types::{LiquidationEvent, MarketParams, Pair, PairStatus, Side};

/// Everything a liquidation changed, for the market engine to journal and
/// broadcast.
#[derive(Debug, Clone)]
pub struct LiquidationOutcome {
    pub event: LiquidationEvent,
    pub pair_after: Pair,
    /// Post-close snapshots of ADL-reduced pairs, in selection order.
    pub adl_pairs: Vec<Pair>,
    /// Traders whose balances moved.
    pub touched: Vec<String>,
    pub insurance_after: i128,
    /// Set when the insurance fund could not absorb the bankruptcy and the
    /// operator does not permit a negative fund.
    pub halt: bool,
}

/// Close the under-margined side `side_closed` of `pair_id` at `mark`.
///
/// The loser's margin absorbs the loss first; a bankruptcy (counterparty
/// gain beyond the loser's collateral) draws from the insurance fund, and an
/// exhausted fund hands the remainder to the ADL selector. Liquidation
/// charges no close fee: the taxonomy treats it as an event, not a trade.
#[allow(clippy::too_many_arguments)]
pub fn liquidate(
    pairs: &mut PairLedger,
    ledger: &AccountLedger,
    insurance: i128,
    params: &MarketParams,
    pair_id: u64,
    side_closed: Side,
    mark: i128,
    funding_index: i128,
    now: u64,
) -> Option<LiquidationOutcome> {
    let pair = pairs.get(pair_id)?.clone();
    if pair.status != PairStatus::Open {
        return None;
    }
    let winner_side = side_closed.opposite();
    let loser = pair.trader(side_closed).to_string();
    let winner = pair.trader(winner_side).to_string();

    let breakdown = pairs.compute_close(pair_id, pair.size, mark, funding_index, 0, 0)?;
    let loss = (-breakdown.delta(side_closed)).max(0);
    let loser_collateral = breakdown.release(side_closed);

    // loser pays out of margin, bounded by what they posted
    let collateral_lost = loss.min(loser_collateral);
    let residual = loser_collateral - collateral_lost;
    ledger.forfeit_margin(&loser, collateral_lost);
    if residual > 0 {
        ledger.release_margin(&loser, residual);
    }

    // bankruptcy: gain beyond the loser's collateral comes from insurance
    let shortfall = loss - collateral_lost;
    let mut insurance_after = insurance;
    let mut halt = false;
    let mut adl_pairs = Vec::new();
    let mut touched = vec![loser.clone(), winner.clone()];
    let mut adl_ids = Vec::new();

    let covered = if shortfall == 0 {
        0
    } else if params.allow_negative_insurance {
        insurance_after -= shortfall;
        shortfall
    } else {
        let draw = shortfall.min(insurance_after.max(0));
        insurance_after -= draw;
        draw
    };
    let uncovered = shortfall - covered;

    if uncovered > 0 {
        // insurance exhausted: force-reduce profitable counterparties to
        // take risk off the book; the winner absorbs the uncovered part and
        // the market halts
        halt = true;
        let selections = adl::select(pairs, pair_id, winner_side, pair.size, mark, funding_index);
        for sel in selections {
            if let Some(b) = pairs.compute_close(sel.pair_id, sel.q, mark, funding_index, 0, 0) {
                if let Some(p) = pairs.get(sel.pair_id) {
                    let long = p.long_trader.clone();
                    let short = p.short_trader.clone();
                    let long_shortfall = ledger.close_out(&long, b.release(Side::Long), b.delta(Side::Long));
                    let short_shortfall =
                        ledger.close_out(&short, b.release(Side::Short), b.delta(Side::Short));
                    insurance_after -= long_shortfall + short_shortfall;
                    touched.push(long);
                    touched.push(short);
                }
                if let Some(after) = pairs.apply_close(sel.pair_id, &b, PairStatus::AdlReduced) {
                    adl_ids.push(after.pair_id);
                    adl_pairs.push(after);
                }
            }
        }
    }

    // the winner is paid what the loser and the fund could cover
    let winner_paid = breakdown.delta(winner_side) - uncovered;
    ledger.close_out(&winner, breakdown.release(winner_side), winner_paid);

    let pair_after = pairs.apply_close(pair_id, &breakdown, PairStatus::Liquidated)?;

    Some(LiquidationOutcome {
        event: LiquidationEvent {
            pair_id,
            market: pair.market.clone(),
            side_closed,
            mark_price: mark,
            collateral_lost,
            insurance_delta: insurance_after - insurance,
            adl_affected_pair_ids: adl_ids,
            ts: now,
        },
        pair_after,
        adl_pairs,
        touched,
        insurance_after,
        halt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PairStatus, LEVERAGE_SCALE, PRICE_SCALE};

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

    fn setup(collateral_each: i128) -> (PairLedger, AccountLedger, u64) {
        let mut pairs = PairLedger::new();
        let ledger = AccountLedger::new();
        for t in ["alice", "bob"] {
            ledger.deposit(t, collateral_each);
            ledger.reserve_for_order(t, collateral_each).unwrap();
            ledger.commit_margin(t, collateral_each, collateral_each).unwrap();
        }
        let p = pairs.open(
            "0xmeme",
            "alice".into(),
            "bob".into(),
            100,
            10 * PRICE_SCALE,
            100 * LEVERAGE_SCALE,
            100 * LEVERAGE_SCALE,
            collateral_each,
            collateral_each,
            0,
            0,
        );
        (pairs, ledger, p.pair_id)
    }

    #[test]
    fn test_bankruptcy_draws_insurance() {
        // 100x pair, entry 10, collateral 10 each; mark 9.85 -> long loses 15
        let (mut pairs, ledger, id) = setup(10 * PRICE_SCALE);
        let mark = 9_850_000;
        let out = liquidate(&mut pairs, &ledger, 50 * PRICE_SCALE, &params(), id, Side::Long, mark, 0, 1)
            .unwrap();
        assert_eq!(out.pair_after.status, PairStatus::Liquidated);
        assert!(!out.halt);
        assert!(out.adl_pairs.is_empty());
        // loss of 15 fits in alice's 10? no: 0.15 * 100 = 15 > 10 -> bankruptcy of 5
        assert_eq!(out.event.collateral_lost, 10 * PRICE_SCALE);
        assert_eq!(out.event.insurance_delta, -5 * PRICE_SCALE);
        // bob got his collateral back plus the full gain
        assert_eq!(ledger.snapshot("bob").free, 25 * PRICE_SCALE);
        assert_eq!(ledger.snapshot("alice").free, 0);
    }

    #[test]
    fn test_liquidation_with_residual_refund() {
        // loss smaller than collateral: residual back to the loser
        let (mut pairs, ledger, id) = setup(10 * PRICE_SCALE);
        let mark = 9_920_000; // long loses 8
        let out = liquidate(&mut pairs, &ledger, 0, &params(), id, Side::Long, mark, 0, 1).unwrap();
        assert_eq!(out.event.collateral_lost, 8 * PRICE_SCALE);
        assert_eq!(out.event.insurance_delta, 0);
        assert!(!out.halt);
        assert_eq!(ledger.snapshot("alice").free, 2 * PRICE_SCALE);
        assert_eq!(ledger.snapshot("bob").free, 18 * PRICE_SCALE);
    }

    #[test]
    fn test_bankruptcy_without_insurance_halts_and_adls() {
        // mark 9.50: long loses 50, collateral 10, no insurance -> 40 uncovered
        let (mut pairs, ledger, id) = setup(10 * PRICE_SCALE);
        // carol's profitable levered short joins the book
        for t in ["dave", "carol"] {
            ledger.deposit(t, 500 * PRICE_SCALE);
            ledger.reserve_for_order(t, 100 * PRICE_SCALE).unwrap();
            ledger.commit_margin(t, 100 * PRICE_SCALE, 100 * PRICE_SCALE).unwrap();
        }
        pairs.open(
            "0xmeme",
            "dave".into(),
            "carol".into(),
            60,
            10 * PRICE_SCALE,
            5 * LEVERAGE_SCALE,
            5 * LEVERAGE_SCALE,
            100 * PRICE_SCALE,
            100 * PRICE_SCALE,
            0,
            0,
        );
        let out =
            liquidate(&mut pairs, &ledger, 0, &params(), id, Side::Long, 9_500_000, 0, 1).unwrap();
        assert!(out.halt);
        assert_eq!(out.event.adl_affected_pair_ids.len(), 1);
        assert_eq!(out.adl_pairs[0].status, PairStatus::AdlReduced);
        // carol realized her mark pnl: 0.5 * 60 = 30
        assert_eq!(
            ledger.snapshot("carol").free,
            400 * PRICE_SCALE + 100 * PRICE_SCALE + 30 * PRICE_SCALE
        );
        // bob received only alice's collateral, not the uncovered 40
        assert_eq!(ledger.snapshot("bob").free, 20 * PRICE_SCALE);
        assert_eq!(out.insurance_after, 0);
    }

    #[test]
    fn test_negative_insurance_when_permitted() {
        let (mut pairs, ledger, id) = setup(10 * PRICE_SCALE);
        let mut p = params();
        p.allow_negative_insurance = true;
        let out = liquidate(&mut pairs, &ledger, 0, &p, id, Side::Long, 9_500_000, 0, 1).unwrap();
        assert!(!out.halt);
        assert_eq!(out.insurance_after, -40 * PRICE_SCALE);
        // winner made whole
        assert_eq!(ledger.snapshot("bob").free, 60 * PRICE_SCALE);
    }
}
