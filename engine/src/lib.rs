//! Core matching and risk engine for the MemePerp off-chain matcher.
//!
//! Everything in this crate is synchronous and deterministic: the server
//! crate drives one `MarketEngine` per market from a single worker task and
//! shares the `AccountLedger` across markets. No I/O happens here.

pub mod adl;
pub mod book;
pub mod error;
pub mod funding;
pub mod journal;
pub mod ledger;
pub mod liquidation;
pub mod market;
pub mod matching;
pub mod pairs;
pub mod query;
pub mod risk;
pub mod types;

pub use error::EngineError;
pub use ledger::AccountLedger;
pub use market::{EngineEvent, MarketEngine, SubmitOutcome, TickOutcome};
pub use types::*;
