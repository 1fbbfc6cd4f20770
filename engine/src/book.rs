use crate::types::{Order, Side};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Aggregated price level for snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookLevel {
    pub price: i128,
    pub size: i128,
    pub orders: u32,
}

#[derive(Debug, Default)]
struct BookSide {
    levels: BTreeMap<i128, VecDeque<Order>>,
    total_size: i128,
}

/// Two price-ordered sides of resting limit orders, FIFO within a level.
/// Bids (resting longs) match best-first descending, asks ascending.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BookSide,
    asks: BookSide,
    /// order id -> (side, price) for O(log n) removal.
    index: HashMap<u64, (Side, i128)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn side(&self, side: Side) -> &BookSide {
        match side {
            Side::Long => &self.bids,
            Side::Short => &self.asks,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BookSide {
        match side {
            Side::Long => &mut self.bids,
            Side::Short => &mut self.asks,
        }
    }

    fn best_key(&self, side: Side) -> Option<i128> {
        let s = self.side(side);
        match side {
            Side::Long => s.levels.keys().next_back().copied(),
            Side::Short => s.levels.keys().next().copied(),
        }
    }

    /// Best resting price on `side` (highest bid / lowest ask).
    pub fn best(&self, side: Side) -> Option<i128> {
        self.best_key(side)
    }

    pub fn mid(&self) -> Option<i128> {
        match (self.best(Side::Long), self.best(Side::Short)) {
            (Some(b), Some(a)) => Some((b + a) / 2),
            _ => None,
        }
    }

    /// Head of the FIFO queue at the best price on `side`.
    pub fn front(&self, side: Side) -> Option<&Order> {
        let price = self.best_key(side)?;
        self.side(side).levels.get(&price)?.front()
    }

    /// Fill the head order on `side` by `q` at its own price, removing it
    /// when fully filled. Returns the order's post-fill state. No order with
    /// `filled == size` ever remains resting.
    pub fn fill_front(&mut self, side: Side, q: i128, now: u64) -> Option<Order> {
        let price = self.best_key(side)?;
        let book_side = self.side_mut(side);
        let level = book_side.levels.get_mut(&price)?;
        let maker = level.front_mut()?;
        debug_assert!(q <= maker.remaining());
        maker.apply_fill(q, price, now);
        book_side.total_size -= q;
        let snapshot = maker.clone();
        if maker.remaining() == 0 {
            let order = level.pop_front();
            if level.is_empty() {
                book_side.levels.remove(&price);
            }
            if let Some(o) = order {
                self.index.remove(&o.id);
            }
        }
        Some(snapshot)
    }

    /// Remove and return the head order on `side` whole (self-trade cancel
    /// path).
    pub fn remove_front(&mut self, side: Side) -> Option<Order> {
        let price = self.best_key(side)?;
        let book_side = self.side_mut(side);
        let level = book_side.levels.get_mut(&price)?;
        let order = level.pop_front()?;
        book_side.total_size -= order.remaining();
        if level.is_empty() {
            book_side.levels.remove(&price);
        }
        self.index.remove(&order.id);
        Some(order)
    }

    pub fn insert(&mut self, order: Order) {
        debug_assert!(order.remaining() > 0);
        self.index.insert(order.id, (order.side, order.price));
        let book_side = self.side_mut(order.side);
        book_side.total_size += order.remaining();
        book_side.levels.entry(order.price).or_default().push_back(order);
    }

    pub fn remove(&mut self, order_id: u64) -> Option<Order> {
        let (side, price) = self.index.remove(&order_id)?;
        let book_side = self.side_mut(side);
        let level = book_side.levels.get_mut(&price)?;
        let pos = level.iter().position(|o| o.id == order_id)?;
        let order = level.remove(pos)?;
        book_side.total_size -= order.remaining();
        if level.is_empty() {
            book_side.levels.remove(&price);
        }
        Some(order)
    }

    pub fn contains(&self, order_id: u64) -> bool {
        self.index.contains_key(&order_id)
    }

    /// Liquidity on the opposing side that a taker could consume, for the
    /// FOK pre-walk. Own resting orders are excluded: a self-match is never
    /// a fill.
    pub fn fillable(&self, taker_side: Side, limit: Option<i128>, taker: &str) -> i128 {
        let maker_side = taker_side.opposite();
        let s = self.side(maker_side);
        let crosses = |price: i128| match (taker_side, limit) {
            (_, None) => true,
            (Side::Long, Some(l)) => price <= l,
            (Side::Short, Some(l)) => price >= l,
        };
        let mut total = 0;
        let iter: Box<dyn Iterator<Item = (&i128, &VecDeque<Order>)> + '_> = match maker_side {
            Side::Long => Box::new(s.levels.iter().rev()),
            Side::Short => Box::new(s.levels.iter()),
        };
        for (price, level) in iter {
            if !crosses(*price) {
                break;
            }
            total += level.iter().filter(|o| o.trader != taker).map(|o| o.remaining()).sum::<i128>();
        }
        total
    }

    /// Top-N aggregated levels, best first.
    pub fn depth(&self, side: Side, n: usize) -> Vec<BookLevel> {
        let s = self.side(side);
        let iter: Box<dyn Iterator<Item = (&i128, &VecDeque<Order>)> + '_> = match side {
            Side::Long => Box::new(s.levels.iter().rev()),
            Side::Short => Box::new(s.levels.iter()),
        };
        iter.take(n)
            .map(|(price, level)| BookLevel {
                price: *price,
                size: level.iter().map(|o| o.remaining()).sum(),
                orders: level.len() as u32,
            })
            .collect()
    }

    /// Pull out every resting order whose deadline has passed.
    pub fn sweep_expired(&mut self, now: u64) -> Vec<Order> {
        let expired: Vec<u64> = self
            .iter()
            .filter(|o| o.deadline < now)
            .map(|o| o.id)
            .collect();
        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.bids
            .levels
            .values()
            .chain(self.asks.levels.values())
            .flat_map(|level| level.iter())
    }

    pub fn resting_size(&self, side: Side) -> i128 {
        self.side(side).total_size
    }
}
