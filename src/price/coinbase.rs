//! Coinbase ticker source (streaming websocket).
//!
//! A background task subscribes to the exchange ticker channel and folds
//! every message into the cache; `fast` and `fetch` both answer from the
//! cache. Freshness is a function of connection liveness rather than
//! request time, so cached entries are served regardless of age.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{now_ts, PriceInfoSingle, PriceSource};

const COINBASE_WSS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
const TICKER_CHANNEL: &str = "ticker";

#[derive(Debug, Deserialize)]
struct TickerMsg {
    #[serde(rename = "type")]
    kind: String,
    product_id: Option<String>,
    price: Option<String>,
    time: Option<String>,
}

pub struct CoinbasePriceSource {
    cache: RwLock<HashMap<String, PriceInfoSingle>>,
}

impl CoinbasePriceSource {
    /// Create the source and start its websocket listener task.
    pub fn spawn() -> Arc<Self> {
        let source = Arc::new(Self::new_detached());
        let worker = source.clone();
        tokio::spawn(async move {
            worker.run().await;
        });
        source
    }

    /// Cache-only instance with no listener; used by tests and as the
    /// building block of `spawn`.
    pub fn new_detached() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn product_ids() -> &'static [&'static str] {
        &["BTC-USD", "BTC-EUR"]
    }

    fn symbol_from_product(product: &str) -> Option<&'static str> {
        match product {
            "BTC-USD" => Some("BTCUSD"),
            "BTC-EUR" => Some("BTCEUR"),
            _ => None,
        }
    }

    /// Fold one raw websocket text frame into the cache. Non-ticker
    /// frames (subscription acks, heartbeats) are ignored.
    pub fn handle_message(&self, text: &str) {
        let msg: TickerMsg = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "coinbase: unparseable frame");
                return;
            }
        };
        if msg.kind != "ticker" {
            return;
        }
        let (Some(product_id), Some(price_str)) = (msg.product_id, msg.price) else {
            return;
        };
        let Some(symbol) = Self::symbol_from_product(&product_id) else {
            debug!(product_id, "coinbase: unexpected product");
            return;
        };
        let Ok(price) = price_str.parse::<f64>() else {
            return;
        };

        let now = now_ts();
        let claimed_time = msg
            .time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis() as f64 / 1000.0)
            .unwrap_or(now);

        let info = PriceInfoSingle::new(price, symbol, now, claimed_time, self.id());
        self.cache.write().insert(symbol.to_string(), info);
    }

    async fn run(self: Arc<Self>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(30);

        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    reconnect_delay = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, "coinbase ticker stream disconnected; reconnecting");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> anyhow::Result<()> {
        let (ws_stream, _resp) = connect_async(COINBASE_WSS_URL).await?;
        info!(uri = COINBASE_WSS_URL, "coinbase ticker stream connected");

        let (mut write, mut read) = ws_stream.split();
        let subscribe = serde_json::json!({
            "type": "subscribe",
            "channels": [{ "name": TICKER_CHANNEL, "product_ids": Self::product_ids() }],
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        while let Some(message) = read.next().await {
            match message? {
                Message::Text(text) => self.handle_message(&text),
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(frame) => {
                    anyhow::bail!("server closed connection: {frame:?}");
                }
                _ => {}
            }
        }
        anyhow::bail!("stream ended")
    }
}

#[async_trait]
impl PriceSource for CoinbasePriceSource {
    fn id(&self) -> &'static str {
        "Coinbase"
    }

    fn fast(&self, symbol: &str, _pref_max_age: f64) -> Option<PriceInfoSingle> {
        self.cache.read().get(symbol).cloned()
    }

    async fn fetch(&self, symbol: &str, pref_max_age: f64) -> PriceInfoSingle {
        match self.fast(symbol, pref_max_age) {
            Some(info) => info,
            None => PriceInfoSingle::with_error(
                symbol,
                now_ts(),
                self.id(),
                format!("Price info not available, {symbol}, uri {COINBASE_WSS_URL}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_message_updates_cache() {
        let source = CoinbasePriceSource::new_detached();
        assert!(source.fast("BTCUSD", 0.0).is_none());

        source.handle_message(
            r#"{"type":"ticker","product_id":"BTC-USD","price":"60123.45","time":"2026-01-01T00:00:00.000000Z"}"#,
        );
        let info = source.fast("BTCUSD", 0.0).unwrap();
        assert_eq!(info.price, 60123.45);
        assert_eq!(info.symbol, "BTCUSD");
        assert_eq!(info.source, "Coinbase");
        assert!(info.claimed_time > 0.0);
        assert!(info.error.is_none());
    }

    #[test]
    fn non_ticker_messages_are_ignored() {
        let source = CoinbasePriceSource::new_detached();
        source.handle_message(r#"{"type":"subscriptions","channels":[]}"#);
        source.handle_message("not json at all");
        source.handle_message(r#"{"type":"ticker","product_id":"ETH-USD","price":"1"}"#);
        assert!(source.fast("BTCUSD", 0.0).is_none());
    }

    #[tokio::test]
    async fn fetch_without_cache_is_an_error_single() {
        let source = CoinbasePriceSource::new_detached();
        let info = source.fetch("BTCUSD", 5.0).await;
        assert_eq!(info.price, 0.0);
        assert!(info.error.as_deref().unwrap().contains("not available"));
    }
}
