//! Multi-source price aggregation.
//!
//! Each source answers from its own freshness cache (`fast`, never any
//! I/O) or over the network (`fetch`, errors captured in the result,
//! never raised). The aggregator fans out to every source in parallel,
//! averages the valid subset, and keeps the hot path warm with a
//! fire-and-forget background prefetch.

pub mod binance;
pub mod bitstamp;
pub mod coinbase;
pub mod kraken;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub use binance::BinancePriceSource;
pub use bitstamp::BitstampPriceSource;
pub use coinbase::CoinbasePriceSource;
pub use kraken::KrakenPriceSource;

/// Cache lifetime used when the caller does not state a preference.
pub const DEFAULT_MAX_AGE_SECS: f64 = 15.0;
/// Callers cannot force refetches more often than this.
pub const MIN_PREF_MAX_AGE_SECS: f64 = 5.0;
/// Aggregates older than this are eligible for background refresh.
pub const PREFETCH_MIN_ACCEPTED_AGE_SECS: f64 = 2.0;
/// Max age passed to sources during a background refresh.
pub const PREFETCH_PREF_MAX_AGE_SECS: f64 = 5.0;

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Clamp a caller preference into an effective cache max age.
pub fn effective_max_age(pref_max_age: f64) -> f64 {
    let pref = if pref_max_age <= 0.0 {
        DEFAULT_MAX_AGE_SECS
    } else {
        pref_max_age
    };
    pref.max(MIN_PREF_MAX_AGE_SECS)
}

/// Price data from a single source.
#[derive(Debug, Clone, Serialize)]
pub struct PriceInfoSingle {
    pub price: f64,
    pub symbol: String,
    /// When this process received the value.
    pub retrieve_time: f64,
    /// Source-claimed validity time; equals `retrieve_time` when the
    /// source reports none.
    pub claimed_time: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Distance from the aggregate price; filled by the aggregator.
    pub delta_from_aggr: f64,
}

impl PriceInfoSingle {
    pub fn new(
        price: f64,
        symbol: &str,
        retrieve_time: f64,
        claimed_time: f64,
        source: &str,
    ) -> Self {
        Self {
            price,
            symbol: symbol.to_string(),
            retrieve_time,
            claimed_time,
            source: source.to_string(),
            error: None,
            delta_from_aggr: 0.0,
        }
    }

    pub fn with_error(symbol: &str, retrieve_time: f64, source: &str, error: String) -> Self {
        Self {
            price: 0.0,
            symbol: symbol.to_string(),
            retrieve_time,
            claimed_time: retrieve_time,
            source: source.to_string(),
            error: Some(error),
            delta_from_aggr: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.price > 0.0 && self.error.is_none()
    }
}

/// Aggregate price, carrying every contributing single.
#[derive(Debug, Clone, Serialize)]
pub struct PriceInfo {
    pub price: f64,
    pub symbol: String,
    pub retrieve_time: f64,
    pub claimed_time: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub aggr_sources: Vec<PriceInfoSingle>,
}

/// One upstream price feed.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn id(&self) -> &'static str;

    /// Cached value if its age is acceptable; never performs I/O.
    fn fast(&self, symbol: &str, pref_max_age: f64) -> Option<PriceInfoSingle>;

    /// Obtain a value, over the network if the cache is too old. Network
    /// and parse failures come back as a result with `error` set and
    /// `price = 0`; this never fails across the boundary.
    async fn fetch(&self, symbol: &str, pref_max_age: f64) -> PriceInfoSingle;
}

/// Per-symbol cache shared by the polling sources. Errored results are
/// cached too, so a failing upstream is not hammered on every request.
pub(crate) struct SourceCache {
    map: RwLock<HashMap<String, PriceInfoSingle>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_fresh(&self, symbol: &str, max_age: f64) -> Option<PriceInfoSingle> {
        let map = self.map.read();
        let cached = map.get(symbol)?;
        if now_ts() - cached.retrieve_time < max_age {
            Some(cached.clone())
        } else {
            None
        }
    }

    pub fn put(&self, info: PriceInfoSingle) {
        self.map.write().insert(info.symbol.clone(), info);
    }
}

/// Build the synthetic source descriptor, e.g.
/// `Multi{cnt:2,good:[Bitstamp,Kraken];bad:[BinanceUS]}`.
fn aggregate_source_descriptor(valid: &[&PriceInfoSingle], invalid: &[&PriceInfoSingle]) -> String {
    let good: Vec<&str> = valid.iter().map(|p| p.source.as_str()).collect();
    let bad: Vec<&str> = invalid.iter().map(|p| p.source.as_str()).collect();
    let mut s = format!("Multi{{cnt:{},", valid.len());
    if !good.is_empty() {
        s.push_str(&format!("good:[{}]", good.join(",")));
    }
    if !good.is_empty() && !bad.is_empty() {
        s.push(';');
    }
    if !bad.is_empty() {
        s.push_str(&format!("bad:[{}]", bad.join(",")));
    }
    s.push('}');
    s
}

/// Aggregate singles into one price: mean of the valid subset, the most
/// conservative (minimum) freshness times, and per-single deltas.
pub fn aggregate_singles(
    mut singles: Vec<PriceInfoSingle>,
    symbol: &str,
    now: f64,
) -> PriceInfo {
    let (valid, invalid): (Vec<&PriceInfoSingle>, Vec<&PriceInfoSingle>) =
        singles.iter().partition(|p| p.is_valid());
    let source = aggregate_source_descriptor(&valid, &invalid);

    let (price, retrieve_time, claimed_time, error) = if valid.is_empty() {
        (0.0, now, now, Some("No source with valid data".to_string()))
    } else {
        let price = valid.iter().map(|p| p.price).sum::<f64>() / valid.len() as f64;
        let retrieve_time = valid
            .iter()
            .map(|p| p.retrieve_time)
            .fold(f64::INFINITY, f64::min);
        let claimed_time = valid
            .iter()
            .map(|p| p.claimed_time)
            .fold(f64::INFINITY, f64::min);
        (price, retrieve_time, claimed_time, None)
    };

    for single in singles.iter_mut() {
        single.delta_from_aggr = single.price - price;
    }

    PriceInfo {
        price,
        symbol: symbol.to_string(),
        retrieve_time,
        claimed_time,
        source,
        error,
        aggr_sources: singles,
    }
}

pub struct PriceAggregator {
    sources: Vec<Arc<dyn PriceSource>>,
    symbols: Vec<String>,
}

impl PriceAggregator {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>, symbols: Vec<String>) -> Arc<Self> {
        Arc::new(Self { sources, symbols })
    }

    /// The symbols this aggregator serves.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub async fn get_price(&self, symbol: &str, pref_max_age: f64) -> f64 {
        self.get_price_info(symbol, pref_max_age).await.price
    }

    /// Fan out to every source and aggregate. Sources with an acceptable
    /// cached value answer without I/O; the rest are fetched in parallel.
    /// No deadline is imposed here: each source owns its network timeout.
    pub async fn get_price_info(&self, symbol: &str, pref_max_age: f64) -> PriceInfo {
        let symbol = symbol.to_uppercase();

        let mut singles: Vec<PriceInfoSingle> = Vec::with_capacity(self.sources.len());
        let mut missed: Vec<&Arc<dyn PriceSource>> = Vec::new();
        for source in &self.sources {
            match source.fast(&symbol, pref_max_age) {
                Some(info) => singles.push(info),
                None => missed.push(source),
            }
        }

        let fetched = futures_util::future::join_all(
            missed
                .iter()
                .map(|source| source.fetch(&symbol, pref_max_age)),
        )
        .await;
        singles.extend(fetched);

        let now = now_ts();
        let info = aggregate_singles(singles, &symbol, now);

        // Amortize latency across requests: refresh in the background once
        // the aggregate starts aging, without blocking this caller.
        let age = now - info.retrieve_time;
        if age > PREFETCH_MIN_ACCEPTED_AGE_SECS.max(pref_max_age / 2.0) {
            let sources = self.sources.clone();
            let prefetch_symbol = symbol.clone();
            tokio::spawn(async move {
                debug!(symbol = %prefetch_symbol, age, "background price prefetch");
                futures_util::future::join_all(
                    sources
                        .iter()
                        .map(|source| source.fetch(&prefetch_symbol, PREFETCH_PREF_MAX_AGE_SECS)),
                )
                .await;
            });
        }

        info
    }
}
