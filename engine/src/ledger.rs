use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Protocol fee sink. Lives in the ledger like any trader account so the
/// custody invariant covers fees too.
pub const PROTOCOL_ACCOUNT: &str = "protocol";

/// Per-trader balances. Invariant: all three buckets are non-negative and
/// `free + locked_orders + locked_margin` equals total custody.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub free: i128,
    pub locked_orders: i128,
    pub locked_margin: i128,
    pub nonce: u64,
}

impl Account {
    pub fn total(&self) -> i128 {
        self.free + self.locked_orders + self.locked_margin
    }
}

/// Shared across all market workers. The outer map is read-locked for
/// lookups; mutation of a single account happens under that account's own
/// mutex, held only across one operation.
#[derive(Default)]
pub struct AccountLedger {
    accounts: RwLock<HashMap<String, Arc<Mutex<Account>>>>,
}

impl AccountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, trader: &str) -> Arc<Mutex<Account>> {
        if let Some(acct) = self.accounts.read().unwrap_or_else(|e| e.into_inner()).get(trader) {
            return acct.clone();
        }
        let mut map = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        map.entry(trader.to_string()).or_default().clone()
    }

    fn existing(&self, trader: &str) -> Result<Arc<Mutex<Account>>, EngineError> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(trader)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTrader(trader.to_string()))
    }

    pub fn deposit(&self, trader: &str, amount: i128) {
        let acct = self.entry(trader);
        let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
        a.free += amount;
    }

    pub fn withdraw(&self, trader: &str, amount: i128) -> Result<(), EngineError> {
        let acct = self.existing(trader)?;
        let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
        if a.free < amount {
            return Err(EngineError::InsufficientFunds { needed: amount, have: a.free });
        }
        a.free -= amount;
        Ok(())
    }

    /// Moves `free -> locked_orders` for a new order's margin + opening fee.
    pub fn reserve_for_order(&self, trader: &str, amount: i128) -> Result<(), EngineError> {
        let acct = self.existing(trader)?;
        let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
        if a.free < amount {
            return Err(EngineError::InsufficientFunds { needed: amount, have: a.free });
        }
        a.free -= amount;
        a.locked_orders += amount;
        Ok(())
    }

    /// Cancel/expire path: `locked_orders -> free`.
    pub fn release_order(&self, trader: &str, amount: i128) {
        if let Ok(acct) = self.existing(trader) {
            let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
            let amount = amount.min(a.locked_orders);
            a.locked_orders -= amount;
            a.free += amount;
        }
    }

    /// On fill: consume `order_lock` from the order reservation, committing
    /// `margin` of it as position margin; the remainder is released to free.
    pub fn commit_margin(&self, trader: &str, order_lock: i128, margin: i128) -> Result<(), EngineError> {
        let acct = self.existing(trader)?;
        let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
        if a.locked_orders < order_lock || order_lock < margin {
            return Err(EngineError::Internal(format!(
                "commit_margin over-consumes lock: lock={order_lock} margin={margin} held={}",
                a.locked_orders
            )));
        }
        a.locked_orders -= order_lock;
        a.locked_margin += margin;
        a.free += order_lock - margin;
        Ok(())
    }

    /// Takes a fee straight out of the order reservation. The caller credits
    /// the protocol account with the same amount.
    pub fn fee_from_lock(&self, trader: &str, amount: i128) -> Result<(), EngineError> {
        let acct = self.existing(trader)?;
        let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
        if a.locked_orders < amount {
            return Err(EngineError::Internal(format!(
                "fee {amount} exceeds order lock {}",
                a.locked_orders
            )));
        }
        a.locked_orders -= amount;
        Ok(())
    }

    /// Close path: returns position margin to free.
    pub fn release_margin(&self, trader: &str, amount: i128) {
        if let Ok(acct) = self.existing(trader) {
            let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
            let amount = amount.min(a.locked_margin);
            a.locked_margin -= amount;
            a.free += amount;
        }
    }

    /// Liquidation path: margin leaves the account entirely (paid to the
    /// counterparty or the insurance fund).
    pub fn forfeit_margin(&self, trader: &str, amount: i128) -> i128 {
        match self.existing(trader) {
            Ok(acct) => {
                let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
                let taken = amount.min(a.locked_margin);
                a.locked_margin -= taken;
                taken
            }
            Err(_) => 0,
        }
    }

    /// Adjusts `free` by a signed delta. `free` never goes negative: the
    /// uncovered portion of a loss is returned as a shortfall for the caller
    /// to draw from the insurance fund.
    pub fn settle_pnl(&self, trader: &str, delta: i128) -> i128 {
        let acct = self.entry(trader);
        let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
        let next = a.free + delta;
        if next >= 0 {
            a.free = next;
            0
        } else {
            a.free = 0;
            -next
        }
    }

    /// Close path for one pair side: return the proportional margin, then
    /// apply the signed settlement delta. Returns the uncovered shortfall.
    pub fn close_out(&self, trader: &str, margin_release: i128, delta: i128) -> i128 {
        self.release_margin(trader, margin_release);
        self.settle_pnl(trader, delta)
    }

    /// Authenticator nonce check: strictly sequential per trader.
    pub fn check_and_bump_nonce(&self, trader: &str, nonce: u64) -> Result<(), EngineError> {
        let acct = self.entry(trader);
        let mut a = acct.lock().unwrap_or_else(|e| e.into_inner());
        if a.nonce != nonce {
            return Err(EngineError::BadNonce { expected: a.nonce, got: nonce });
        }
        a.nonce += 1;
        Ok(())
    }

    pub fn nonce(&self, trader: &str) -> u64 {
        self.existing(trader)
            .map(|acct| acct.lock().unwrap_or_else(|e| e.into_inner()).nonce)
            .unwrap_or(0)
    }

    pub fn snapshot(&self, trader: &str) -> Account {
        self.existing(trader)
            .map(|acct| acct.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    pub fn traders(&self) -> Vec<String> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Sum of custody across every account, protocol sink included.
    pub fn total_custody(&self) -> i128 {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|acct| acct.lock().unwrap_or_else(|e| e.into_inner()).total())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release_roundtrip() {
        let ledger = AccountLedger::new();
        ledger.deposit("alice", 1_000);
        ledger.reserve_for_order("alice", 600).unwrap();
        let a = ledger.snapshot("alice");
        assert_eq!((a.free, a.locked_orders), (400, 600));

        // fill half: 250 margin committed, 50 fee taken, remainder of the
        // consumed lock released
        ledger.commit_margin("alice", 300, 250).unwrap();
        ledger.fee_from_lock("alice", 50).unwrap();
        let a = ledger.snapshot("alice");
        assert_eq!(a.free, 450);
        assert_eq!(a.locked_orders, 250);
        assert_eq!(a.locked_margin, 250);

        // cancel the rest
        ledger.release_order("alice", 250);
        let a = ledger.snapshot("alice");
        assert_eq!(a.free, 700);
        assert_eq!(a.locked_orders, 0);
        assert_eq!(a.total(), 950); // 50 left as fee
    }

    #[test]
    fn test_reserve_insufficient() {
        let ledger = AccountLedger::new();
        ledger.deposit("alice", 100);
        let err = ledger.reserve_for_order("alice", 200).unwrap_err();
        assert_eq!(err, EngineError::InsufficientFunds { needed: 200, have: 100 });
        // reservation rolled back atomically: nothing moved
        assert_eq!(ledger.snapshot("alice").free, 100);
    }

    #[test]
    fn test_settle_pnl_shortfall() {
        let ledger = AccountLedger::new();
        ledger.deposit("bob", 100);
        assert_eq!(ledger.settle_pnl("bob", -40), 0);
        assert_eq!(ledger.snapshot("bob").free, 60);
        // loss beyond free reports the uncovered part
        assert_eq!(ledger.settle_pnl("bob", -100), 40);
        assert_eq!(ledger.snapshot("bob").free, 0);
    }

    #[test]
    fn test_nonce_strictly_monotone() {
        let ledger = AccountLedger::new();
        ledger.deposit("alice", 1);
        ledger.check_and_bump_nonce("alice", 0).unwrap();
        // replay of the same nonce is rejected
        let err = ledger.check_and_bump_nonce("alice", 0).unwrap_err();
        assert_eq!(err, EngineError::BadNonce { expected: 1, got: 0 });
        ledger.check_and_bump_nonce("alice", 1).unwrap();
        assert_eq!(ledger.nonce("alice"), 2);
    }

    #[test]
    fn test_withdraw_bounded_by_free() {
        let ledger = AccountLedger::new();
        ledger.deposit("alice", 500);
        ledger.reserve_for_order("alice", 300).unwrap();
        assert!(ledger.withdraw("alice", 300).is_err());
        ledger.withdraw("alice", 200).unwrap();
        assert_eq!(ledger.snapshot("alice").free, 0);
    }

    #[test]
    fn test_total_custody() {
        let ledger = AccountLedger::new();
        ledger.deposit("alice", 500);
        ledger.deposit("bob", 300);
        ledger.reserve_for_order("alice", 200).unwrap();
        assert_eq!(ledger.total_custody(), 800);
    }
}
