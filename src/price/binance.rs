//! Binance ticker source (polling HTTP), in global and US variants.
//!
//! E.g. `https://api.binance.us/api/v3/ticker/price?symbol=BTCUSDT`.
//! Binance reports no source timestamp; claimed time equals retrieve
//! time. The US endpoint carries no EUR pairs.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{effective_max_age, now_ts, PriceInfoSingle, PriceSource, SourceCache};

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    price: Option<String>,
}

pub struct BinancePriceSource {
    client: Client,
    cache: SourceCache,
    global_or_us: bool,
    url_root: String,
    source_id: &'static str,
}

impl BinancePriceSource {
    pub fn new(global_or_us: bool) -> Self {
        let (host, source_id) = if global_or_us {
            ("api3.binance.com", "Binance")
        } else {
            ("api.binance.us", "BinanceUS")
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            cache: SourceCache::new(),
            global_or_us,
            url_root: format!("https://{host}/api/v3/ticker/price?symbol="),
            source_id,
        }
    }

    /// None when the symbol is not served in this region.
    fn internal_symbol(&self, symbol: &str) -> Option<String> {
        match symbol {
            "BTCUSD" => Some("BTCUSDT".to_string()),
            "BTCEUR" if self.global_or_us => Some("BTCEUR".to_string()),
            "BTCEUR" => None,
            other => Some(other.to_string()),
        }
    }

    async fn do_get_price(&self, internal: &str) -> Result<f64, String> {
        let url = format!("{}{internal}", self.url_root);
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
        let ticker: BinanceTicker = response
            .json()
            .await
            .map_err(|e| format!("Error parsing price, {url}, {e}"))?;
        ticker
            .price
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| "Missing price".to_string())
    }
}

#[async_trait]
impl PriceSource for BinancePriceSource {
    fn id(&self) -> &'static str {
        self.source_id
    }

    fn fast(&self, symbol: &str, pref_max_age: f64) -> Option<PriceInfoSingle> {
        self.cache.get_fresh(symbol, effective_max_age(pref_max_age))
    }

    async fn fetch(&self, symbol: &str, pref_max_age: f64) -> PriceInfoSingle {
        if let Some(cached) = self.fast(symbol, pref_max_age) {
            return cached;
        }

        let now = now_ts();
        let Some(internal) = self.internal_symbol(symbol) else {
            return PriceInfoSingle::with_error(
                symbol,
                now,
                self.id(),
                format!("Symbol not supported in this region, {symbol}"),
            );
        };

        let info = match self.do_get_price(&internal).await {
            Ok(price) => PriceInfoSingle::new(price, symbol, now, now, self.id()),
            Err(error) => {
                debug!(symbol, error = %error, "binance fetch failed");
                PriceInfoSingle::with_error(symbol, now, self.id(), error)
            }
        };
        self.cache.put(info.clone());
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_mapping_respects_region() {
        let us = BinancePriceSource::new(false);
        assert_eq!(us.internal_symbol("BTCUSD").as_deref(), Some("BTCUSDT"));
        assert_eq!(us.internal_symbol("BTCEUR"), None);

        let global = BinancePriceSource::new(true);
        assert_eq!(global.internal_symbol("BTCEUR").as_deref(), Some("BTCEUR"));
    }

    #[tokio::test]
    async fn unsupported_symbol_is_an_errored_single() {
        let us = BinancePriceSource::new(false);
        let info = us.fetch("BTCEUR", 15.0).await;
        assert_eq!(info.price, 0.0);
        assert!(info.error.as_deref().unwrap().contains("not supported"));
    }
}
