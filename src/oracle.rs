//! Oracle orchestrator.
//!
//! Thin layer binding the signer, the store, and the price aggregator;
//! everything the HTTP facade serves comes through here. Events hold only
//! a `class_id` back-reference, so range fields are resolved from the
//! class at render time.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{digit_message, EventDescriptor};
use crate::crypto::KeySigner;
use crate::price::{PriceAggregator, PriceInfo};
use crate::scheduler::next_event_time;
use crate::store::{EventClassRow, EventRow, EventStore};

/// Hard cap on `get_events_filter` responses.
const MAX_EVENTS_HARD_LIMIT: u32 = 100;
/// Hard cap on `get_event_ids_filter` responses.
const MAX_EVENT_IDS_HARD_LIMIT: u32 = 5000;

#[derive(Debug, Serialize)]
pub struct OracleInfo {
    pub main_public_key: String,
    pub public_keys: Vec<String>,
    pub horizon_days: u32,
}

#[derive(Debug, Serialize)]
pub struct OracleStatus {
    pub future_event_count: u64,
    pub total_event_count: u64,
    pub current_time_utc: f64,
}

#[derive(Debug, Serialize)]
pub struct EventDescInfo {
    pub definition: String,
    pub event_type: &'static str,
    pub range_digits: u32,
    pub range_digit_low_pos: u32,
    pub range_digit_high_pos: u32,
    pub range_unit: u64,
    pub range_min_value: f64,
    pub range_max_value: f64,
}

impl EventDescInfo {
    fn from_descriptor(desc: &EventDescriptor) -> Self {
        Self {
            definition: desc.definition.clone(),
            event_type: "numeric",
            range_digits: desc.range_digits,
            range_digit_low_pos: desc.range_digit_low_pos,
            range_digit_high_pos: desc.digit_high_pos(),
            range_unit: desc.unit(),
            range_min_value: desc.min_value(),
            range_max_value: desc.max_value(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventClassInfo {
    pub class_id: String,
    pub desc: EventDescInfo,
    pub repeat_first_time: i64,
    pub repeat_period: i64,
    pub repeat_offset: i64,
    pub repeat_last_time: i64,
}

#[derive(Debug, Serialize)]
pub struct DigitOutcomeInfo {
    pub index: u32,
    pub value: u8,
    pub nonce: String,
    pub signature: String,
    pub msg_str: String,
}

#[derive(Debug, Serialize)]
pub struct EventInfo {
    pub event_id: String,
    pub time_utc: i64,
    pub time_utc_nice: String,
    #[serde(flatten)]
    pub desc: EventDescInfo,
    pub event_class: String,
    pub signer_public_key: String,
    pub string_template: String,
    pub has_outcome: bool,
    pub nonces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digits: Option<Vec<DigitOutcomeInfo>>,
}

fn descriptor_for_class(class: &EventClassRow) -> EventDescriptor {
    EventDescriptor {
        definition: class.definition.clone(),
        range_digits: class.range_digits,
        range_digit_low_pos: class.range_digit_low_pos,
        string_template: class.string_template.clone(),
    }
}

fn time_utc_nice(time: i64) -> String {
    chrono::DateTime::from_timestamp(time, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S+00:00").to_string())
        .unwrap_or_default()
}

pub struct Oracle {
    store: Arc<dyn EventStore>,
    prices: Arc<PriceAggregator>,
    signer: Arc<KeySigner>,
    main_public_key: String,
    horizon_days: u32,
}

impl Oracle {
    pub fn new(
        store: Arc<dyn EventStore>,
        prices: Arc<PriceAggregator>,
        signer: Arc<KeySigner>,
        horizon_days: u32,
    ) -> Result<Arc<Self>> {
        let main_public_key = signer.public_key(0).context("derive main public key")?;
        Ok(Arc::new(Self {
            store,
            prices,
            signer,
            main_public_key,
            horizon_days,
        }))
    }

    pub fn main_public_key(&self) -> &str {
        &self.main_public_key
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub async fn get_oracle_info(&self) -> Result<OracleInfo> {
        let public_keys = self.store.all_public_keys().await?;
        Ok(OracleInfo {
            main_public_key: self.main_public_key.clone(),
            public_keys,
            horizon_days: self.horizon_days,
        })
    }

    pub async fn get_oracle_status(&self) -> Result<OracleStatus> {
        let now = Utc::now();
        Ok(OracleStatus {
            future_event_count: self.store.count_future(now.timestamp()).await?,
            total_event_count: self.store.count_events().await?,
            current_time_utc: now.timestamp_millis() as f64 / 1000.0,
        })
    }

    pub async fn get_event_classes(&self) -> Result<Vec<EventClassInfo>> {
        let classes = self.store.all_classes().await?;
        Ok(classes
            .iter()
            .map(|class| EventClassInfo {
                class_id: class.id.clone(),
                desc: EventDescInfo::from_descriptor(&descriptor_for_class(class)),
                repeat_first_time: class.repeat_first_time,
                repeat_period: class.repeat_period,
                repeat_offset: class.repeat_offset,
                repeat_last_time: class.repeat_last_time,
            })
            .collect())
    }

    async fn render_event(&self, event: &EventRow, signer_public_key: &str) -> Result<EventInfo> {
        let class = self
            .store
            .get_class_by_id(&event.class_id)
            .await?
            .with_context(|| format!("event class {} missing", event.class_id))?;
        let desc = descriptor_for_class(&class);

        let nonces: Vec<String> = self
            .store
            .get_nonces(&event.event_id)
            .await?
            .into_iter()
            .map(|n| n.nonce_pub)
            .collect();

        let outcome = self.store.get_outcome(&event.event_id).await?;
        let digits = if outcome.is_some() {
            Some(
                self.store
                    .get_digit_outcomes(&event.event_id)
                    .await?
                    .into_iter()
                    .map(|d| DigitOutcomeInfo {
                        index: d.digit_index,
                        value: d.digit_value,
                        nonce: d.nonce_pub,
                        signature: d.signature,
                        msg_str: d.msg_str,
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(EventInfo {
            event_id: event.event_id.clone(),
            time_utc: event.time,
            time_utc_nice: time_utc_nice(event.time),
            desc: EventDescInfo::from_descriptor(&desc),
            event_class: event.class_id.clone(),
            signer_public_key: signer_public_key.to_string(),
            string_template: event.string_template.clone(),
            has_outcome: outcome.is_some(),
            nonces,
            outcome_value: outcome.as_ref().map(|o| o.value.clone()),
            outcome_time: outcome.as_ref().map(|o| o.created_time),
            digits,
        })
    }

    pub async fn get_event_by_id(&self, event_id: &str) -> Result<Option<EventInfo>> {
        let Some((event, signer_public_key)) = self.store.get_event_by_id(event_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.render_event(&event, &signer_public_key).await?))
    }

    pub async fn get_events_filter(
        &self,
        start_time: i64,
        end_time: i64,
        definition: Option<&str>,
        max_count: u32,
    ) -> Result<Vec<EventInfo>> {
        let limit = max_count.min(MAX_EVENTS_HARD_LIMIT);
        let ids = self
            .store
            .filter_event_ids(start_time, end_time, definition, limit)
            .await?;
        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(info) = self.get_event_by_id(&id).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    pub async fn get_event_ids_filter(
        &self,
        start_time: i64,
        end_time: i64,
        definition: Option<&str>,
    ) -> Result<Vec<String>> {
        Ok(self
            .store
            .filter_event_ids(start_time, end_time, definition, MAX_EVENT_IDS_HARD_LIMIT)
            .await?)
    }

    /// Next existing event of `definition` at least `period_secs` ahead.
    ///
    /// Snapshot `now + max(period, 60)`; among the classes matching the
    /// definition, pick the earliest offset-aligned time that has an
    /// event in the store.
    pub async fn get_next_event(
        &self,
        definition: &str,
        period_secs: i64,
    ) -> Result<Option<EventInfo>> {
        let abs_time = Utc::now().timestamp() + period_secs.max(60);
        let classes = self.store.all_classes_by_def(definition).await?;

        let mut best: Option<(i64, EventRow, String)> = None;
        for class in &classes {
            let t = next_event_time(class, abs_time);
            if t == 0 {
                continue;
            }
            if best.as_ref().is_some_and(|(bt, _, _)| *bt <= t) {
                continue;
            }
            let event_id = crate::scheduler::event_id_for(&class.definition, t);
            if let Some((event, signer)) = self.store.get_event_by_id(&event_id).await? {
                best = Some((t, event, signer));
            }
        }

        match best {
            Some((_, event, signer)) => Ok(Some(self.render_event(&event, &signer).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_price(&self, symbol: &str, pref_max_age: f64) -> f64 {
        self.prices.get_price(symbol, pref_max_age).await
    }

    pub async fn get_price_info(&self, symbol: &str) -> PriceInfo {
        self.prices.get_price_info(symbol, 0.0).await
    }

    pub async fn get_current_prices(&self) -> HashMap<String, f64> {
        let mut prices = HashMap::new();
        for symbol in self.prices.symbols().to_vec() {
            let price = self.prices.get_price(&symbol, 0.0).await;
            prices.insert(symbol, price);
        }
        prices
    }

    pub async fn get_current_price_infos(&self) -> HashMap<String, PriceInfo> {
        let mut infos = HashMap::new();
        for symbol in self.prices.symbols().to_vec() {
            let info = self.prices.get_price_info(&symbol, 0.0).await;
            infos.insert(symbol, info);
        }
        infos
    }

    /// Preview what the signed outcome of a not-yet-signed event would
    /// look like at current prices. Nothing is persisted, and the
    /// signatures use dedicated preview nonces so the event's committed
    /// nonces never sign a speculative message.
    pub async fn dummy_outcome_for_event(&self, event_id: &str) -> Result<Option<EventInfo>> {
        let Some((event, signer_public_key)) = self.store.get_event_by_id(event_id).await? else {
            return Ok(None);
        };
        let mut info = self.render_event(&event, &signer_public_key).await?;
        if info.has_outcome {
            return Ok(Some(info));
        }

        let class = self
            .store
            .get_class_by_id(&event.class_id)
            .await?
            .with_context(|| format!("event class {} missing", event.class_id))?;
        let desc = descriptor_for_class(&class);

        let price_info = self.prices.get_price_info(&event.definition, 15.0).await;
        if price_info.error.is_some() {
            return Ok(None);
        }
        let digit_values = desc.value_to_digits(price_info.price);

        let mut digits = Vec::with_capacity(digit_values.len());
        for (i, d) in digit_values.iter().enumerate() {
            let preview_id = format!("{event_id}:preview");
            let (nonce_sec, nonce_pub) =
                self.signer.deterministic_nonce(&preview_id, i as u32)?;
            let msg_str = digit_message(&event.string_template, event_id, i as u32, *d);
            let signature = self.signer.sign_schnorr(&msg_str, &nonce_sec, 0)?;
            digits.push(DigitOutcomeInfo {
                index: i as u32,
                value: *d,
                nonce: nonce_pub,
                signature,
                msg_str,
            });
        }

        info.has_outcome = true;
        info.outcome_value = Some(desc.digits_to_value(&digit_values).to_string());
        info.outcome_time = Some(Utc::now().timestamp());
        info.digits = Some(digits);
        Ok(Some(info))
    }
}

/// Application-level handle constructed once at boot and shared by the
/// HTTP facade.
pub struct OracleApp {
    pub oracle: Arc<Oracle>,
    pub demo_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EVENT_STRING_TEMPLATE_DEFAULT;
    use crate::crypto::Network;
    use crate::price::{PriceInfoSingle, PriceSource};
    use crate::scheduler::{event_id_for, Scheduler};
    use crate::store::MemoryEventStore;
    use async_trait::async_trait;

    struct FixedPriceSource {
        price: f64,
    }

    #[async_trait]
    impl PriceSource for FixedPriceSource {
        fn id(&self) -> &'static str {
            "Fixed"
        }
        fn fast(&self, _symbol: &str, _pref_max_age: f64) -> Option<PriceInfoSingle> {
            None
        }
        async fn fetch(&self, symbol: &str, _pref_max_age: f64) -> PriceInfoSingle {
            let now = crate::price::now_ts();
            PriceInfoSingle::new(self.price, symbol, now, now, self.id())
        }
    }

    const PERIOD: i64 = 3600;

    fn test_class(now: i64, id: &str, definition: &str) -> EventClassRow {
        let repeat_first_time = (now / PERIOD) * PERIOD - 7 * PERIOD;
        EventClassRow {
            id: id.to_string(),
            create_time: now,
            definition: definition.to_string(),
            range_digits: 7,
            range_digit_low_pos: 0,
            string_template: EVENT_STRING_TEMPLATE_DEFAULT.to_string(),
            repeat_first_time,
            repeat_period: PERIOD,
            repeat_offset: repeat_first_time.rem_euclid(PERIOD),
            repeat_last_time: repeat_first_time + 370 * PERIOD,
            signer_public_key: "unused".to_string(),
        }
    }

    struct Fixture {
        store: Arc<MemoryEventStore>,
        oracle: Arc<Oracle>,
        scheduler: Arc<Scheduler>,
        now: i64,
    }

    async fn fixture() -> Fixture {
        let now = Utc::now().timestamp();
        let store = Arc::new(MemoryEventStore::new());
        let signer = Arc::new(KeySigner::init(&[0x01; 16], Network::Signet).unwrap());
        let prices = PriceAggregator::new(
            vec![Arc::new(FixedPriceSource { price: 98_765.0 }) as Arc<dyn PriceSource>],
            vec!["BTCUSD".to_string(), "BTCEUR".to_string()],
        );

        let main_pubkey = signer.public_key(0).unwrap();
        let mut class = test_class(now, "btcusd", "BTCUSD");
        class.signer_public_key = main_pubkey.clone();
        store.insert_class_if_missing(&class).await.unwrap();
        let mut class2 = test_class(now, "btceur", "BTCEUR");
        class2.signer_public_key = main_pubkey;
        store.insert_class_if_missing(&class2).await.unwrap();

        let scheduler = Scheduler::new(
            store.clone() as Arc<dyn EventStore>,
            signer.clone(),
            prices.clone(),
            30,
            false,
        );
        // Materialize a window of events around now.
        for _ in 0..12 {
            scheduler.create_future_events(now, 10).await.unwrap();
        }

        let oracle = Oracle::new(
            store.clone() as Arc<dyn EventStore>,
            prices,
            signer,
            30,
        )
        .unwrap();

        Fixture {
            store,
            oracle,
            scheduler,
            now,
        }
    }

    #[tokio::test]
    async fn oracle_info_and_status() {
        let f = fixture().await;
        let info = f.oracle.get_oracle_info().await.unwrap();
        assert_eq!(info.main_public_key.len(), 64);
        assert_eq!(info.public_keys, vec![info.main_public_key.clone()]);
        assert_eq!(info.horizon_days, 30);

        let status = f.oracle.get_oracle_status().await.unwrap();
        assert!(status.total_event_count > 0);
        assert!(status.future_event_count <= status.total_event_count);
        assert!(status.current_time_utc >= f.now as f64);
    }

    #[tokio::test]
    async fn event_classes_render() {
        let f = fixture().await;
        let classes = f.oracle.get_event_classes().await.unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].class_id, "btcusd");
        assert_eq!(classes[0].desc.definition, "BTCUSD");
        assert_eq!(classes[0].desc.event_type, "numeric");
        assert_eq!(classes[0].desc.range_digits, 7);
        assert_eq!(classes[0].desc.range_digit_high_pos, 6);
        assert_eq!(classes[0].desc.range_max_value, 9_999_999.0);
        assert_eq!(classes[0].repeat_period, PERIOD);
    }

    #[tokio::test]
    async fn event_info_shape_without_outcome() {
        let f = fixture().await;
        let ids = f
            .oracle
            .get_event_ids_filter(f.now, 0, Some("btcusd"))
            .await
            .unwrap();
        assert!(!ids.is_empty());

        let info = f.oracle.get_event_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(info.desc.definition, "BTCUSD");
        assert!(!info.has_outcome);
        assert_eq!(info.nonces.len(), 7);
        assert_eq!(info.nonces[0].len(), 64);
        assert!(info.digits.is_none());
        assert!(info
            .string_template
            .starts_with(&format!("Outcome:{}:", info.event_id)));
        // Nonces are immutable across reads.
        let again = f.oracle.get_event_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(info.nonces, again.nonces);

        assert!(f.oracle.get_event_by_id("missing01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filters_cap_and_normalize() {
        let f = fixture().await;
        // Case-insensitive definition.
        let lower = f
            .oracle
            .get_events_filter(0, 0, Some("btcusd"), 1000)
            .await
            .unwrap();
        let upper = f
            .oracle
            .get_events_filter(0, 0, Some("BTCUSD"), 1000)
            .await
            .unwrap();
        assert_eq!(lower.len(), upper.len());
        // The hard cap holds even when the caller asks for more.
        assert!(lower.len() <= 100);

        let few = f
            .oracle
            .get_events_filter(0, 0, None, 3)
            .await
            .unwrap();
        assert_eq!(few.len(), 3);
    }

    #[tokio::test]
    async fn next_event_is_aligned_and_exists() {
        let f = fixture().await;
        let next = f
            .oracle
            .get_next_event("BTCUSD", PERIOD)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.desc.definition, "BTCUSD");
        assert!(next.time_utc >= f.now + PERIOD.max(60));
        assert_eq!(next.time_utc % PERIOD, 0);

        assert!(f
            .oracle
            .get_next_event("NOSUCHDEF", 60)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn signed_event_renders_outcome() {
        let f = fixture().await;
        // Sign whatever has matured (the classes start 7 periods back).
        f.scheduler
            .create_past_outcomes(f.now, 86_400)
            .await
            .unwrap();

        let ids = f
            .oracle
            .get_event_ids_filter(0, f.now, Some("BTCUSD"))
            .await
            .unwrap();
        assert!(!ids.is_empty());
        let info = f.oracle.get_event_by_id(&ids[0]).await.unwrap().unwrap();
        assert!(info.has_outcome);
        assert_eq!(info.outcome_value.as_deref(), Some("98765"));
        let digits = info.digits.unwrap();
        assert_eq!(digits.len(), 7);
        assert_eq!(digits[3].index, 3);
        assert_eq!(digits[3].signature.len(), 128);
        // Digit nonces match the committed set, in order.
        for (digit, nonce_pub) in digits.iter().zip(&info.nonces) {
            assert_eq!(&digit.nonce, nonce_pub);
        }
    }

    #[tokio::test]
    async fn dummy_outcome_is_not_persisted_and_spares_committed_nonces() {
        let f = fixture().await;
        let next = f
            .oracle
            .get_next_event("BTCUSD", PERIOD)
            .await
            .unwrap()
            .unwrap();
        assert!(!next.has_outcome);

        let preview = f
            .oracle
            .dummy_outcome_for_event(&next.event_id)
            .await
            .unwrap()
            .unwrap();
        assert!(preview.has_outcome);
        assert_eq!(preview.outcome_value.as_deref(), Some("98765"));
        let digits = preview.digits.unwrap();
        assert_eq!(digits.len(), 7);
        for (digit, committed) in digits.iter().zip(&next.nonces) {
            assert_ne!(&digit.nonce, committed, "preview must not burn committed nonces");
        }

        // Nothing was stored.
        let after = f
            .oracle
            .get_event_by_id(&next.event_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!after.has_outcome);
        assert!(f
            .store
            .get_outcome(&next.event_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn prices_pass_through() {
        let f = fixture().await;
        let price = f.oracle.get_price("BTCUSD", 15.0).await;
        assert_eq!(price, 98_765.0);

        let infos = f.oracle.get_current_price_infos().await;
        assert_eq!(infos.len(), 2);
        assert!(infos.contains_key("BTCUSD"));

        let prices = f.oracle.get_current_prices().await;
        assert_eq!(prices["BTCEUR"], 98_765.0);
    }

    #[tokio::test]
    async fn event_id_derivation_matches() {
        assert_eq!(event_id_for("BTCUSD", 1_748_991_600), "btcusd1748991600");
    }
}
