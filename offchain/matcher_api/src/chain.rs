//! Settlement port (optional, behind the `onchain` feature). The engine
//! never waits on the chain: fills are forwarded fire-and-forget and a
//! failed submission only logs.

use engine::Fill;
#[cfg(feature = "onchain")]
use ethers::{
    prelude::*,
    types::{Address, I256},
};
#[cfg(feature = "onchain")]
use tracing::warn;

#[cfg(feature = "onchain")]
abigen!(
    SettlementContract,
    r#"[
        function submitFill(uint64 seq, address longTrader, address shortTrader, int256 price, int256 qty) external
    ]"#
);

#[cfg(feature = "onchain")]
type Signed = SettlementContract<SignerMiddleware<Provider<Http>, LocalWallet>>;

#[derive(Clone)]
pub struct ChainClient {
    #[cfg(feature = "onchain")]
    contract: Option<std::sync::Arc<Signed>>,
    pub contract_address: Option<String>,
}

impl ChainClient {
    /// Builds from `RPC_URL`, `PRIVATE_KEY`, and `CHAIN_ID` env vars plus
    /// the configured settlement address; inactive when any is missing.
    pub fn new(contract_address: Option<String>) -> Self {
        #[cfg(feature = "onchain")]
        {
            let rpc = std::env::var("RPC_URL").ok();
            let pk = std::env::var("PRIVATE_KEY").ok();
            let chain_id: u64 = std::env::var("CHAIN_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(421_614);
            if let (Some(rpc), Some(pk), Some(addr)) = (rpc, pk, contract_address.clone()) {
                if let (Ok(provider), Ok(wallet), Ok(address)) = (
                    Provider::<Http>::try_from(rpc),
                    pk.parse::<LocalWallet>(),
                    addr.parse::<Address>(),
                ) {
                    let signer =
                        SignerMiddleware::new(provider, wallet.with_chain_id(chain_id));
                    let contract =
                        SettlementContract::new(address, std::sync::Arc::new(signer));
                    return Self {
                        contract: Some(std::sync::Arc::new(contract)),
                        contract_address: Some(addr),
                    };
                }
            }
            return Self { contract: None, contract_address };
        }
        #[cfg(not(feature = "onchain"))]
        {
            Self { contract_address }
        }
    }

    pub fn is_active(&self) -> bool {
        #[cfg(feature = "onchain")]
        {
            self.contract.is_some()
        }
        #[cfg(not(feature = "onchain"))]
        {
            false
        }
    }

    /// Forward one fill for settlement. Never blocks the market worker.
    pub fn spawn_submit_fill(&self, fill: &Fill) {
        if !self.is_active() {
            return;
        }
        #[cfg(feature = "onchain")]
        {
            let Some(contract) = self.contract.clone() else { return };
            let fill = fill.clone();
            tokio::spawn(async move {
                let (Ok(long), Ok(short)) = (
                    fill.maker.parse::<Address>(),
                    fill.taker.parse::<Address>(),
                ) else {
                    warn!(target: "chain", seq = fill.seq, "unparseable trader address");
                    return;
                };
                let (long, short) = match fill.taker_side {
                    engine::Side::Long => (short, long),
                    engine::Side::Short => (long, short),
                };
                let call = contract.submit_fill(
                    fill.seq,
                    long,
                    short,
                    I256::from(fill.price),
                    I256::from(fill.size),
                );
                match call.send().await {
                    Ok(pending) => {
                        tracing::debug!(target: "chain", seq = fill.seq, tx = ?pending.tx_hash(), "fill submitted");
                    }
                    Err(e) => warn!(target: "chain", seq = fill.seq, "fill submission failed: {e}"),
                }
            });
        }
        #[cfg(not(feature = "onchain"))]
        {
            let _ = fill;
        }
    }
}
