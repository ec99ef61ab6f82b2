//! Kraken ticker source (polling HTTP).
//!
//! E.g. `https://api.kraken.com/0/public/Ticker?pair=XBTUSD`. Kraken uses
//! one pair name in the request and another as the result key; the last
//! trade price is `result.<pair>.c[0]`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{effective_max_age, now_ts, PriceInfoSingle, PriceSource, SourceCache};

const URL_ROOT: &str = "https://api.kraken.com/0/public/Ticker?pair=";

pub struct KrakenPriceSource {
    client: Client,
    cache: SourceCache,
}

impl KrakenPriceSource {
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

    /// (request pair, result key), None for unsupported symbols.
    fn internal_symbol(symbol: &str) -> Option<(&'static str, &'static str)> {
        match symbol {
            "BTCUSD" => Some(("XBTUSD", "XXBTZUSD")),
            "BTCEUR" => Some(("XBTEUR", "XXBTZEUR")),
            _ => None,
        }
    }

    async fn do_get_price(&self, symbol: &str) -> Result<f64, String> {
        let (pair, result_key) = Self::internal_symbol(symbol)
            .ok_or_else(|| format!("Symbol is not supported, {symbol}"))?;
        let url = format!("{URL_ROOT}{pair}");
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
        let json: Value = response
            .json()
            .await
            .map_err(|e| format!("Error parsing price, {url}, {e}"))?;

        json["result"][result_key]["c"][0]
            .as_str()
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| format!("Error parsing price, {url}, {json}"))
    }
}

impl Default for KrakenPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceSource for KrakenPriceSource {
    fn id(&self) -> &'static str {
        "Kraken"
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
            // No claimed time from Kraken.
            Ok(price) => PriceInfoSingle::new(price, symbol, now, now, self.id()),
            Err(error) => {
                debug!(symbol, error = %error, "kraken fetch failed");
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
    fn pair_mapping() {
        assert_eq!(
            KrakenPriceSource::internal_symbol("BTCUSD"),
            Some(("XBTUSD", "XXBTZUSD"))
        );
        assert_eq!(KrakenPriceSource::internal_symbol("DOGEUSD"), None);
    }

    #[test]
    fn parses_last_trade_from_ticker_payload() {
        let json: Value = serde_json::from_str(
            r#"{"error":[],"result":{"XXBTZUSD":{"a":["60001.0","1","1.0"],"c":["60000.5","0.01"]}}}"#,
        )
        .unwrap();
        let price = json["result"]["XXBTZUSD"]["c"][0]
            .as_str()
            .and_then(|p| p.parse::<f64>().ok());
        assert_eq!(price, Some(60000.5));
    }
}
