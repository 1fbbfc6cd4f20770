use thiserror::Error;

/// Stable rejection and failure taxonomy, surfaced verbatim over the API.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    // auth
    #[error("bad signature")]
    BadSignature,
    #[error("bad nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("order expired: deadline {deadline} < now {now}")]
    Expired { deadline: u64, now: u64 },
    #[error("unknown trader {0}")]
    UnknownTrader(String),

    // input
    #[error("bad size {0}")]
    BadSize(i128),
    #[error("bad leverage {got}: allowed 1e4..={max}")]
    BadLeverage { got: u32, max: u32 },
    #[error("bad price {0}")]
    BadPrice(i128),
    #[error("unknown market {0}")]
    UnknownMarket(String),
    #[error("market {0} is halted")]
    MarketHalted(String),
    #[error("unknown order type {0}")]
    UnknownOrderType(u8),

    // balance
    #[error("insufficient funds: needed {needed}, have {have}")]
    InsufficientFunds { needed: i128, have: i128 },
    #[error("insufficient margin: needed {needed}, have {have}")]
    InsufficientMargin { needed: i128, have: i128 },

    // order lifecycle
    #[error("self trade refused")]
    SelfTrade,
    #[error("not fillable: book depth {available} < required {required}")]
    NotFillable { required: i128, available: i128 },
    #[error("order {0} is already terminal")]
    AlreadyTerminal(u64),
    #[error("unknown order {0}")]
    UnknownOrder(u64),
    #[error("unknown pair {0}")]
    UnknownPair(u64),
    #[error("trader is not a party to pair {0}")]
    NotPairParty(u64),

    // runtime
    #[error("oracle stale for {market}: last update {last_ts}, now {now}")]
    OracleStale { market: String, last_ts: u64, now: u64 },
    #[error("broadcast client too slow")]
    BroadcastSlowConsumer,
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wire code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadSignature => "BadSignature",
            EngineError::BadNonce { .. } => "BadNonce",
            EngineError::Expired { .. } => "Expired",
            EngineError::UnknownTrader(_) => "UnknownTrader",
            EngineError::BadSize(_) => "BadSize",
            EngineError::BadLeverage { .. } => "BadLeverage",
            EngineError::BadPrice(_) => "BadPrice",
            EngineError::UnknownMarket(_) => "UnknownMarket",
            EngineError::MarketHalted(_) => "MarketHalted",
            EngineError::UnknownOrderType(_) => "UnknownOrderType",
            EngineError::InsufficientFunds { .. } => "InsufficientFunds",
            EngineError::InsufficientMargin { .. } => "InsufficientMargin",
            EngineError::SelfTrade => "SelfTrade",
            EngineError::NotFillable { .. } => "NotFillable",
            EngineError::AlreadyTerminal(_) => "AlreadyTerminal",
            EngineError::UnknownOrder(_) => "UnknownOrder",
            EngineError::UnknownPair(_) => "UnknownPair",
            EngineError::NotPairParty(_) => "NotPairParty",
            EngineError::OracleStale { .. } => "OracleStale",
            EngineError::BroadcastSlowConsumer => "BroadcastSlowConsumer",
            EngineError::Internal(_) => "Internal",
        }
    }
}
