use crate::types::{fee, notional, Pair, PairStatus, Side};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Money movements implied by closing `q` of a pair at `mark`. The ledger
/// application happens in the market engine; this is pure arithmetic.
///
/// Close invariant: `delta_long + delta_short == -(fee_long + fee_short)` —
/// the pair is zero-sum less protocol fees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseBreakdown {
    pub q: i128,
    pub mark: i128,
    /// (mark - entry) * q; the short side realizes the negation.
    pub pnl_long: i128,
    /// (funding_index_now - funding_index_at_open) * q; long pays when
    /// positive.
    pub funding_long: i128,
    pub fee_long: i128,
    pub fee_short: i128,
    pub release_long: i128,
    pub release_short: i128,
    pub closes: bool,
}

impl CloseBreakdown {
    pub fn delta(&self, side: Side) -> i128 {
        match side {
            Side::Long => self.pnl_long - self.funding_long - self.fee_long,
            Side::Short => -self.pnl_long + self.funding_long - self.fee_short,
        }
    }

    pub fn release(&self, side: Side) -> i128 {
        match side {
            Side::Long => self.release_long,
            Side::Short => self.release_short,
        }
    }

    pub fn total_fees(&self) -> i128 {
        self.fee_long + self.fee_short
    }
}

/// Long/short pair lifecycle. Each fill creates a new pair; pairs are never
/// merged, which keeps close and funding accounting deterministic.
#[derive(Debug, Default)]
pub struct PairLedger {
    pairs: HashMap<u64, Pair>,
    next_id: u64,
}

impl PairLedger {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        market: &str,
        long_trader: String,
        short_trader: String,
        size: i128,
        entry_price: i128,
        leverage_long: u32,
        leverage_short: u32,
        collateral_long: i128,
        collateral_short: i128,
        funding_index: i128,
        now: u64,
    ) -> Pair {
        self.next_id += 1;
        let pair = Pair {
            pair_id: self.next_id,
            market: market.to_string(),
            long_trader,
            short_trader,
            size,
            entry_price,
            leverage_long,
            leverage_short,
            collateral_long,
            collateral_short,
            funding_index_at_open: funding_index,
            opened_at: now,
            status: PairStatus::Open,
        };
        self.pairs.insert(pair.pair_id, pair.clone());
        pair
    }

    pub fn get(&self, pair_id: u64) -> Option<&Pair> {
        self.pairs.get(&pair_id)
    }

    pub fn open_iter(&self) -> impl Iterator<Item = &Pair> {
        self.pairs.values().filter(|p| p.status == PairStatus::Open)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pair> {
        self.pairs.values()
    }

    pub fn for_trader<'a>(&'a self, trader: &'a str) -> impl Iterator<Item = &'a Pair> {
        self.pairs
            .values()
            .filter(move |p| p.long_trader == trader || p.short_trader == trader)
    }

    /// Open base-asset quantity held by `trader` on `side` across pairs.
    pub fn exposure(&self, trader: &str, side: Side) -> i128 {
        self.open_iter()
            .filter(|p| p.trader(side) == trader)
            .map(|p| p.size)
            .sum()
    }

    /// Sum of open pair sizes per side; long and short open interest are
    /// equal by construction of the pair model.
    pub fn open_interest(&self) -> i128 {
        self.open_iter().map(|p| p.size).sum()
    }

    /// Pure close arithmetic for `q <= pair.size`. Fee rates come from the
    /// caller: requester/counterparty rates for voluntary closes, zero for
    /// liquidation and ADL.
    pub fn compute_close(
        &self,
        pair_id: u64,
        q: i128,
        mark: i128,
        funding_index_now: i128,
        fee_long_bps: i128,
        fee_short_bps: i128,
    ) -> Option<CloseBreakdown> {
        let pair = self.pairs.get(&pair_id)?;
        debug_assert!(q > 0 && q <= pair.size);
        let closes = q == pair.size;
        let close_notional = notional(mark, q);
        let release_long = if closes {
            pair.collateral_long
        } else {
            pair.collateral_long * q / pair.size
        };
        let release_short = if closes {
            pair.collateral_short
        } else {
            pair.collateral_short * q / pair.size
        };
        Some(CloseBreakdown {
            q,
            mark,
            pnl_long: (mark - pair.entry_price) * q,
            funding_long: (funding_index_now - pair.funding_index_at_open) * q,
            fee_long: fee(close_notional, fee_long_bps),
            fee_short: fee(close_notional, fee_short_bps),
            release_long,
            release_short,
            closes,
        })
    }

    /// Shrink the pair in place, or mark it terminal with `final_status`.
    /// Returns the post-close state; a partially ADL-reduced pair stays open
    /// in the ledger but reports `adl_reduced` in the returned snapshot.
    pub fn apply_close(
        &mut self,
        pair_id: u64,
        breakdown: &CloseBreakdown,
        final_status: PairStatus,
    ) -> Option<Pair> {
        let pair = self.pairs.get_mut(&pair_id)?;
        if breakdown.closes {
            pair.size = 0;
            pair.collateral_long = 0;
            pair.collateral_short = 0;
            pair.status = final_status;
            Some(pair.clone())
        } else {
            pair.size -= breakdown.q;
            pair.collateral_long -= breakdown.release_long;
            pair.collateral_short -= breakdown.release_short;
            let mut snapshot = pair.clone();
            if final_status == PairStatus::AdlReduced {
                snapshot.status = PairStatus::AdlReduced;
            }
            Some(snapshot)
        }
    }
}
