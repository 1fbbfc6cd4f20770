use crate::pairs::PairLedger;
use crate::risk;
use crate::types::{Side, BPS};

/// One side of an open pair picked for forced reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct AdlSelection {
    pub pair_id: u64,
    /// Side being reduced (the profitable one).
    pub side: Side,
    pub trader: String,
    /// uPnL_ratio * effective_leverage, bps-squared scale; ranking only.
    pub score: i128,
    /// Quantity to force-close.
    pub q: i128,
}

/// Rank profitable `reduce_side` holders by `uPnL_ratio * effective_leverage`
/// and pick pairs best-first until `needed` base quantity is covered. The
/// bankrupt pair itself is excluded.
pub fn select(
    pairs: &PairLedger,
    exclude_pair: u64,
    reduce_side: Side,
    needed: i128,
    mark: i128,
    funding_index: i128,
) -> Vec<AdlSelection> {
    let mut candidates: Vec<AdlSelection> = pairs
        .open_iter()
        .filter(|p| p.pair_id != exclude_pair)
        .filter_map(|p| {
            let upnl = risk::upnl(p, reduce_side, mark);
            if upnl <= 0 {
                return None;
            }
            let collateral = p.collateral(reduce_side);
            let pending = risk::pending_funding(p, reduce_side, funding_index);
            let equity = collateral + upnl - pending;
            if collateral <= 0 || equity <= 0 {
                return None;
            }
            let upnl_ratio_bps = upnl * BPS / collateral;
            let effective_leverage_bps = p.size * mark * BPS / equity;
            Some(AdlSelection {
                pair_id: p.pair_id,
                side: reduce_side,
                trader: p.trader(reduce_side).to_string(),
                score: upnl_ratio_bps * effective_leverage_bps / BPS,
                q: 0,
            })
        })
        .collect();
    candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.pair_id.cmp(&b.pair_id)));

    let mut remaining = needed;
    let mut selected = Vec::new();
    for mut c in candidates {
        if remaining <= 0 {
            break;
        }
        let size = pairs.get(c.pair_id).map(|p| p.size).unwrap_or(0);
        c.q = size.min(remaining);
        remaining -= c.q;
        selected.push(c);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LEVERAGE_SCALE, PRICE_SCALE};

    fn pairs_fixture() -> PairLedger {
        let mut pairs = PairLedger::new();
        // entry 10, carol short 100 at 20x: very profitable and levered when
        // mark drops
        pairs.open(
            "0xmeme",
            "dave".into(),
            "carol".into(),
            100,
            10 * PRICE_SCALE,
            2 * LEVERAGE_SCALE,
            20 * LEVERAGE_SCALE,
            500 * PRICE_SCALE,
            50 * PRICE_SCALE,
            0,
            0,
        );
        // erin short 80 at 2x: profitable but low leverage
        pairs.open(
            "0xmeme",
            "frank".into(),
            "erin".into(),
            80,
            10 * PRICE_SCALE,
            2 * LEVERAGE_SCALE,
            2 * LEVERAGE_SCALE,
            400 * PRICE_SCALE,
            400 * PRICE_SCALE,
            0,
            0,
        );
        // underwater short: never a candidate when mark is above its entry
        pairs.open(
            "0xmeme",
            "gus".into(),
            "hana".into(),
            50,
            8 * PRICE_SCALE,
            2 * LEVERAGE_SCALE,
            2 * LEVERAGE_SCALE,
            200 * PRICE_SCALE,
            200 * PRICE_SCALE,
            0,
            0,
        );
        pairs
    }

    #[test]
    fn test_ranking_prefers_levered_profit() {
        let pairs = pairs_fixture();
        let sel = select(&pairs, 999, Side::Short, 150, 9 * PRICE_SCALE, 0);
        // hana's short (entry 8, mark 9) is losing and excluded
        assert_eq!(sel.len(), 2);
        assert_eq!(sel[0].trader, "carol");
        assert!(sel[0].score > sel[1].score);
        assert_eq!(sel[0].q, 100);
        assert_eq!(sel[1].trader, "erin");
        assert_eq!(sel[1].q, 50);
    }

    #[test]
    fn test_covers_only_what_is_needed() {
        let pairs = pairs_fixture();
        let sel = select(&pairs, 999, Side::Short, 60, 9 * PRICE_SCALE, 0);
        assert_eq!(sel.len(), 1);
        assert_eq!(sel[0].q, 60);
    }

    #[test]
    fn test_excludes_bankrupt_pair() {
        let pairs = pairs_fixture();
        let carol_pair = pairs.open_iter().find(|p| p.short_trader == "carol").unwrap().pair_id;
        let sel = select(&pairs, carol_pair, Side::Short, 60, 9 * PRICE_SCALE, 0);
        assert!(sel.iter().all(|s| s.pair_id != carol_pair));
    }

    #[test]
    fn test_no_profitable_candidates() {
        let pairs = pairs_fixture();
        // at mark 11 every short is losing
        let sel = select(&pairs, 999, Side::Short, 60, 11 * PRICE_SCALE, 0);
        assert!(sel.is_empty());
    }
}
