//! Bitstamp ticker source (polling HTTP).
//!
//! E.g. `https://www.bitstamp.net/api/v2/ticker/btcusd`. Bitstamp reports
//! a source-side timestamp, which becomes the claimed time.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{effective_max_age, now_ts, PriceInfoSingle, PriceSource, SourceCache};

const URL_ROOT: &str = "https://www.bitstamp.net/api/v2/ticker/";

#[derive(Debug, Deserialize)]
struct BitstampTicker {
    last: Option<String>,
    timestamp: Option<String>,
}

pub struct BitstampPriceSource {
    client: Client,
    cache: SourceCache,
}

impl BitstampPriceSource {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            cache: SourceCache::new(),
        }
    }

    fn internal_symbol(symbol: &str) -> String {
        symbol.to_lowercase()
    }

    async fn do_get_price(&self, symbol: &str) -> Result<(f64, f64), String> {
        let url = format!("{URL_ROOT}{}", Self::internal_symbol(symbol));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Exception getting price, {url}, {e}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "Error getting price, {url}, {}",
                response.status().as_u16()
            ));
        }
        let ticker: BitstampTicker = response
            .json()
            .await
            .map_err(|e| format!("Error parsing price, {url}, {e}"))?;

        let price = ticker
            .last
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| "Missing price".to_string())?;
        let claimed_time = ticker
            .timestamp
            .as_deref()
            .and_then(|t| t.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok((price, claimed_time))
    }
}

impl Default for BitstampPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceSource for BitstampPriceSource {
    fn id(&self) -> &'static str {
        "Bitstamp"
    }

    fn fast(&self, symbol: &str, pref_max_age: f64) -> Option<PriceInfoSingle> {
        self.cache.get_fresh(symbol, effective_max_age(pref_max_age))
    }

    async fn fetch(&self, symbol: &str, pref_max_age: f64) -> PriceInfoSingle {
        if let Some(cached) = self.fast(symbol, pref_max_age) {
            return cached;
        }

        let now = now_ts();
        let info = match self.do_get_price(symbol).await {
            Ok((price, claimed_time)) => {
                let claimed = if claimed_time > 0.0 { claimed_time } else { now };
                PriceInfoSingle::new(price, symbol, now, claimed, self.id())
            }
            Err(error) => {
                debug!(symbol, error = %error, "bitstamp fetch failed");
                PriceInfoSingle::with_error(symbol, now, self.id(), error)
            }
        };
        // Errored results are cached too.
        self.cache.put(info.clone());
        info
    }
}
