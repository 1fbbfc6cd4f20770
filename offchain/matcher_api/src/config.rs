use anyhow::{Context, Result};
use clap::Parser;
use engine::{parse_fixed, MarketParams, LEVERAGE_SCALE};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "matcher_api", about = "MemePerp off-chain matching engine")]
pub struct Args {
    /// Path to the deployment config JSON.
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,
    /// Override the REST/WS listen address from the config.
    #[arg(long)]
    pub listen_addr: Option<String>,
    /// Override the journal path from the config.
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    pub token: String,
    /// Plain multiplier, e.g. 100 for 100x.
    pub max_leverage: u32,
    pub maintenance_margin_bps: i128,
    pub taker_fee_bps: i128,
    pub maker_fee_bps: i128,
    pub funding_interval_s: u64,
    #[serde(default = "default_funding_clamp_bps")]
    pub funding_clamp_bps: i128,
    #[serde(default = "default_insurance_fee_bps")]
    pub insurance_fee_bps: i128,
    #[serde(default = "default_oracle_staleness_s")]
    pub oracle_staleness_s: u64,
    #[serde(default)]
    pub allow_negative_insurance: bool,
    /// `http(s)://…` polled for `{"price":"…"}`, or `static:<price>` for
    /// development.
    pub oracle_source: String,
    #[serde(default = "default_kline_resolutions")]
    pub kline_resolutions_s: Vec<u64>,
}

fn default_funding_clamp_bps() -> i128 {
    50
}

fn default_insurance_fee_bps() -> i128 {
    1_000
}

fn default_oracle_staleness_s() -> u64 {
    10
}

fn default_kline_resolutions() -> Vec<u64> {
    vec![60, 300, 3_600]
}

impl MarketConfig {
    pub fn to_params(&self) -> MarketParams {
        MarketParams {
            token: self.token.to_lowercase(),
            max_leverage: self.max_leverage.saturating_mul(LEVERAGE_SCALE),
            maintenance_margin_bps: self.maintenance_margin_bps,
            taker_fee_bps: self.taker_fee_bps,
            maker_fee_bps: self.maker_fee_bps,
            funding_interval_s: self.funding_interval_s,
            funding_clamp_bps: self.funding_clamp_bps,
            insurance_fee_bps: self.insurance_fee_bps,
            oracle_staleness_s: self.oracle_staleness_s,
            allow_negative_insurance: self.allow_negative_insurance,
            kline_resolutions_s: self.kline_resolutions_s.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub settlement_address: String,
    pub markets: Vec<MarketConfig>,
    /// Decimal string, collateral units; seeds each market's insurance fund.
    #[serde(default)]
    pub insurance_seed: Option<String>,
    pub listen_addr: String,
    /// Separate websocket listener; omit to serve `/ws` on `listen_addr`.
    #[serde(default)]
    pub ws_addr: Option<String>,
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn load(args: &Args) -> Result<Self> {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading config {}", args.config.display()))?;
        let mut cfg: EngineConfig = serde_json::from_str(&raw).context("parsing config")?;
        if let Some(addr) = &args.listen_addr {
            cfg.listen_addr = addr.clone();
        }
        if let Some(journal) = &args.journal {
            cfg.journal_path = Some(journal.clone());
        }
        if cfg.markets.is_empty() {
            anyhow::bail!("config lists no markets");
        }
        Ok(cfg)
    }

    pub fn insurance_seed_fixed(&self) -> Result<i128> {
        match &self.insurance_seed {
            None => Ok(0),
            Some(s) => parse_fixed(s).with_context(|| format!("bad insurance_seed {s:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_with_defaults() {
        let raw = r#"{
            "rpc_url": "https://sepolia.example",
            "chain_id": 421614,
            "settlement_address": "0x0000000000000000000000000000000000000001",
            "listen_addr": "0.0.0.0:8787",
            "insurance_seed": "1000",
            "markets": [{
                "token": "0xmeme",
                "max_leverage": 100,
                "maintenance_margin_bps": 100,
                "taker_fee_bps": 5,
                "maker_fee_bps": 2,
                "funding_interval_s": 3600,
                "oracle_source": "static:10"
            }]
        }"#;
        let cfg: EngineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.insurance_seed_fixed().unwrap(), 1_000 * engine::PRICE_SCALE);
        let params = cfg.markets[0].to_params();
        assert_eq!(params.max_leverage, 100 * LEVERAGE_SCALE);
        assert_eq!(params.oracle_staleness_s, 10);
        assert_eq!(params.kline_resolutions_s, vec![60, 300, 3_600]);
        assert!(cfg.ws_addr.is_none());
    }
}
