use crate::book::OrderBook;
use crate::error::EngineError;
use crate::types::{Order, OrderStatus, OrderType, Side, Tif};

/// One execution against a resting maker, at the maker's price.
#[derive(Debug, Clone)]
pub struct MatchExec {
    pub price: i128,
    pub size: i128,
    /// Maker order state after the fill was applied.
    pub maker: Order,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Taker order state after the walk.
    pub taker: Order,
    pub execs: Vec<MatchExec>,
    /// Resting orders cancelled by self-trade prevention.
    pub stp_cancelled: Vec<Order>,
    /// The taker itself was the smaller side of a self-trade and was
    /// cancelled; any fills before that point stand.
    pub taker_stp_cancelled: bool,
}

fn crosses(taker_side: Side, limit: Option<i128>, maker_price: i128) -> bool {
    match (taker_side, limit) {
        (_, None) => true,
        (Side::Long, Some(l)) => maker_price <= l,
        (Side::Short, Some(l)) => maker_price >= l,
    }
}

/// Walk the opposing side best-first, filling at maker prices, with
/// self-trade prevention. Book mutation happens only here and in the
/// explicit insert/remove paths of the market engine.
///
/// `price_cap` bounds how deep the walk may go: the limit price for limit
/// orders, the protective collar for market orders (whose reservation was
/// sized to that collar). `None` walks the whole side.
///
/// FOK orders are simulated first and rejected before any state change if
/// the book cannot fully fill them.
pub fn execute(
    book: &mut OrderBook,
    mut taker: Order,
    price_cap: Option<i128>,
    now: u64,
) -> Result<MatchResult, EngineError> {
    let limit = match taker.order_type {
        OrderType::Market => price_cap,
        OrderType::Limit => Some(taker.price),
    };

    if taker.tif == Tif::Fok {
        let available = book.fillable(taker.side, limit, &taker.trader);
        if available < taker.size {
            return Err(EngineError::NotFillable { required: taker.size, available });
        }
    }

    let maker_side = taker.side.opposite();
    let mut execs = Vec::new();
    let mut stp_cancelled = Vec::new();
    let mut taker_stp_cancelled = false;

    while taker.remaining() > 0 {
        let (maker_price, maker_remaining, maker_is_self) = match book.front(maker_side) {
            Some(front) => (front.price, front.remaining(), front.trader == taker.trader),
            None => break,
        };
        if !crosses(taker.side, limit, maker_price) {
            break;
        }
        if maker_is_self {
            // refuse the fill and cancel the smaller side
            if maker_remaining <= taker.remaining() {
                if let Some(mut cancelled) = book.remove_front(maker_side) {
                    cancelled.status = OrderStatus::Cancelled;
                    cancelled.updated_at = now;
                    stp_cancelled.push(cancelled);
                }
                continue;
            }
            taker.status = OrderStatus::Cancelled;
            taker.updated_at = now;
            taker_stp_cancelled = true;
            break;
        }
        let q = taker.remaining().min(maker_remaining);
        let maker = match book.fill_front(maker_side, q, now) {
            Some(m) => m,
            None => break,
        };
        taker.apply_fill(q, maker_price, now);
        execs.push(MatchExec { price: maker_price, size: q, maker });
    }

    Ok(MatchResult { taker, execs, stp_cancelled, taker_stp_cancelled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderInput, LEVERAGE_SCALE, PRICE_SCALE};

    fn order(
        id: u64,
        trader: &str,
        side: Side,
        order_type: OrderType,
        price: i128,
        size: i128,
        tif: Tif,
    ) -> Order {
        let input = OrderInput {
            client_id: None,
            trader: trader.into(),
            market: "0xmeme".into(),
            side,
            order_type,
            size,
            leverage: 5 * LEVERAGE_SCALE,
            price,
            tif,
            reduce_only: false,
            tp: None,
            sl: None,
            deadline: u64::MAX,
            nonce: 0,
        };
        Order::from_input(id, input, 0)
    }

    fn limit(id: u64, trader: &str, side: Side, price: i128, size: i128) -> Order {
        order(id, trader, side, OrderType::Limit, price, size, Tif::Gtc)
    }

    #[test]
    fn test_price_time_priority() {
        let mut book = OrderBook::new();
        book.insert(limit(1, "a", Side::Short, 101 * PRICE_SCALE, 10));
        book.insert(limit(2, "b", Side::Short, 100 * PRICE_SCALE, 10));
        book.insert(limit(3, "c", Side::Short, 100 * PRICE_SCALE, 10));

        let taker = limit(4, "d", Side::Long, 101 * PRICE_SCALE, 25);
        let r = execute(&mut book, taker, None, 1).unwrap();
        assert_eq!(r.execs.len(), 3);
        // best price first, FIFO within the level
        assert_eq!(r.execs[0].maker.id, 2);
        assert_eq!(r.execs[0].price, 100 * PRICE_SCALE);
        assert_eq!(r.execs[1].maker.id, 3);
        assert_eq!(r.execs[2].maker.id, 1);
        assert_eq!(r.execs[2].size, 5);
        assert_eq!(r.taker.status, OrderStatus::Filled);
        // fills happen at maker prices
        assert_eq!(r.taker.avg_fill_price, (100 * 20 + 101 * 5) * PRICE_SCALE / 25);
    }

    #[test]
    fn test_no_cross_leaves_book_untouched() {
        let mut book = OrderBook::new();
        book.insert(limit(1, "a", Side::Short, 105 * PRICE_SCALE, 10));
        let taker = limit(2, "b", Side::Long, 100 * PRICE_SCALE, 10);
        let r = execute(&mut book, taker, None, 1).unwrap();
        assert!(r.execs.is_empty());
        assert_eq!(r.taker.remaining(), 10);
        assert!(book.contains(1));
    }

    #[test]
    fn test_market_order_walks_all_prices() {
        let mut book = OrderBook::new();
        book.insert(limit(1, "a", Side::Short, 100 * PRICE_SCALE, 5));
        book.insert(limit(2, "b", Side::Short, 130 * PRICE_SCALE, 5));
        let taker = order(3, "c", Side::Long, OrderType::Market, 0, 12, Tif::Ioc);
        let r = execute(&mut book, taker, None, 1).unwrap();
        assert_eq!(r.execs.len(), 2);
        // book exhausted, residual left for the caller's IOC handling
        assert_eq!(r.taker.remaining(), 2);
        assert_eq!(r.taker.status, OrderStatus::Partial);
    }

    #[test]
    fn test_fok_rejected_before_state_change() {
        let mut book = OrderBook::new();
        book.insert(limit(1, "a", Side::Short, 100 * PRICE_SCALE, 5));
        let taker = order(2, "b", Side::Long, OrderType::Limit, 100 * PRICE_SCALE, 10, Tif::Fok);
        let err = execute(&mut book, taker, None, 1).unwrap_err();
        assert_eq!(err, EngineError::NotFillable { required: 10, available: 5 });
        // maker untouched
        assert_eq!(book.front(Side::Short).unwrap().remaining(), 5);
    }

    #[test]
    fn test_self_trade_cancels_smaller_resting() {
        let mut book = OrderBook::new();
        book.insert(limit(1, "a", Side::Short, 100 * PRICE_SCALE, 5));
        book.insert(limit(2, "b", Side::Short, 100 * PRICE_SCALE, 10));
        let taker = limit(3, "a", Side::Long, 100 * PRICE_SCALE, 8);
        let r = execute(&mut book, taker, None, 1).unwrap();
        // own order (smaller) cancelled, then matching continues against b
        assert_eq!(r.stp_cancelled.len(), 1);
        assert_eq!(r.stp_cancelled[0].id, 1);
        assert_eq!(r.execs.len(), 1);
        assert_eq!(r.execs[0].maker.id, 2);
        assert_eq!(r.taker.status, OrderStatus::Filled);
    }

    #[test]
    fn test_self_trade_cancels_smaller_taker() {
        let mut book = OrderBook::new();
        book.insert(limit(1, "a", Side::Short, 100 * PRICE_SCALE, 50));
        let taker = limit(2, "a", Side::Long, 100 * PRICE_SCALE, 8);
        let r = execute(&mut book, taker, None, 1).unwrap();
        assert!(r.taker_stp_cancelled);
        assert_eq!(r.taker.status, OrderStatus::Cancelled);
        assert!(r.execs.is_empty());
        // larger resting side stays
        assert_eq!(book.front(Side::Short).unwrap().remaining(), 50);
    }
}
