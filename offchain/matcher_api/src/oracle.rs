//! Clock and spot-price oracle ports. The engine crate never does I/O:
//! workers pull `OraclePrice` samples from here and hand them to the risk
//! tick, which applies the staleness policy itself.

use engine::{parse_fixed, OraclePrice};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub trait Clock: Send + Sync {
    /// Monotonic seconds, anchored to the unix epoch at startup so signed
    /// order deadlines stay comparable. Never reads wall clock again.
    fn now(&self) -> u64;
}

pub struct SystemClock {
    epoch: u64,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        SystemClock { epoch, started: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.epoch + self.started.elapsed().as_secs()
    }
}

pub trait OracleSource: Send + Sync {
    /// Last good sample for `token`; staleness is judged by the caller
    /// against the sample timestamp.
    fn latest(&self, token: &str) -> Option<OraclePrice>;
}

/// Shared cache fed by one poller task per market. A failed poll keeps the
/// previous sample, whose aging timestamp eventually halts the market.
#[derive(Default)]
pub struct PolledOracle {
    cache: RwLock<HashMap<String, OraclePrice>>,
}

impl PolledOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn store(&self, token: &str, sample: OraclePrice) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.to_string(), sample);
    }

    /// Poll `source` every second. `static:<price>` pins a fixed price for
    /// development; anything else is fetched as JSON `{"price": …}`.
    pub fn spawn_poller(self: &Arc<Self>, token: String, source: String, clock: Arc<dyn Clock>) {
        let cache = self.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let static_price = source.strip_prefix("static:").and_then(parse_fixed);
            loop {
                let sample = match static_price {
                    Some(price) => Some(price),
                    None => match fetch_price(&client, &source).await {
                        Ok(p) => Some(p),
                        Err(e) => {
                            warn!(target: "oracle", %token, "poll failed: {e:#}");
                            None
                        }
                    },
                };
                if let Some(price) = sample {
                    debug!(target: "oracle", %token, price, "spot sample");
                    cache.store(&token, OraclePrice { price, ts: clock.now() });
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }
}

impl OracleSource for PolledOracle {
    fn latest(&self, token: &str) -> Option<OraclePrice> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .copied()
    }
}

async fn fetch_price(client: &reqwest::Client, url: &str) -> anyhow::Result<i128> {
    let body: serde_json::Value = client
        .get(url)
        .timeout(Duration::from_secs(2))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let raw = body
        .get("price")
        .ok_or_else(|| anyhow::anyhow!("no price field"))?;
    let price = match raw {
        serde_json::Value::String(s) => parse_fixed(s),
        other => parse_fixed(&other.to_string()),
    };
    price.ok_or_else(|| anyhow::anyhow!("unparseable price {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_returns_last_good() {
        let oracle = PolledOracle::new();
        assert!(oracle.latest("0xmeme").is_none());
        oracle.store("0xmeme", OraclePrice { price: 10_000_000, ts: 5 });
        assert_eq!(oracle.latest("0xmeme").unwrap().price, 10_000_000);
        // another market is independent
        assert!(oracle.latest("0xother").is_none());
    }

    #[test]
    fn test_system_clock_monotone() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
