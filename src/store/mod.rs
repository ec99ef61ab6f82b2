//! Durable event store.
//!
//! The store exclusively owns all persisted rows; every other component
//! holds plain value copies. The scheduler is the sole writer of events,
//! nonces and outcomes; HTTP handlers only read. One contract matters
//! above all: a reader must never observe an `Outcome` without its full
//! `DigitOutcome` set, so the two are always written in one transaction.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("database version {found} is newer than supported version {supported}")]
    VersionTooNew { found: i64, supported: i64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A periodic series of events. Inserted once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventClassRow {
    pub id: String,
    pub create_time: i64,
    pub definition: String,
    pub range_digits: u32,
    pub range_digit_low_pos: u32,
    pub string_template: String,
    pub repeat_first_time: i64,
    pub repeat_period: i64,
    /// `repeat_first_time mod repeat_period`; every event time of the
    /// class is congruent to this modulo the period.
    pub repeat_offset: i64,
    pub repeat_last_time: i64,
    pub signer_public_key: String,
}

/// One event instance. Holds only its `class_id` back-reference; range
/// fields are resolved from the class at render time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub event_id: String,
    pub class_id: String,
    pub definition: String,
    pub time: i64,
    /// Class template with `{event_id}` already substituted.
    pub string_template: String,
}

/// Pre-committed nonce pair for one digit of one event.
#[derive(Debug, Clone, PartialEq)]
pub struct NonceRow {
    pub event_id: String,
    pub digit_index: u32,
    pub nonce_pub: String,
    pub nonce_sec: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRow {
    pub event_id: String,
    /// String form of the signed number.
    pub value: String,
    pub created_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigitOutcomeRow {
    pub event_id: String,
    pub digit_index: u32,
    pub digit_value: u8,
    pub nonce_pub: String,
    pub signature: String,
    pub msg_str: String,
}

/// Signing intent recorded *before* the first signature of an event is
/// produced. After a crash the scheduler replays exactly these messages,
/// so a persisted nonce can never end up signing two different strings.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSignRow {
    pub event_id: String,
    pub digit_index: u32,
    pub digit_value: u8,
    pub msg_str: String,
}

/// Persistent-store contract. `SqliteEventStore` is the production
/// implementation; `MemoryEventStore` satisfies the same contract as a
/// test double.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent insert; returns 1 if inserted, 0 if the id was present.
    async fn insert_class_if_missing(&self, ec: &EventClassRow) -> Result<u32, StoreError>;
    async fn get_class_by_id(&self, id: &str) -> Result<Option<EventClassRow>, StoreError>;
    /// Newest class for a definition, by `create_time` descending.
    async fn latest_class_by_def(&self, definition: &str)
        -> Result<Option<EventClassRow>, StoreError>;
    async fn all_classes_by_def(&self, definition: &str) -> Result<Vec<EventClassRow>, StoreError>;
    async fn all_classes(&self) -> Result<Vec<EventClassRow>, StoreError>;

    /// Interns the signer pubkey, then inserts if missing. Returns 1 or 0.
    async fn insert_event_if_missing(
        &self,
        event: &EventRow,
        signer_public_key: &str,
    ) -> Result<u32, StoreError>;
    /// Batched variant; returns the number of rows actually inserted.
    async fn append_events_if_missing(
        &self,
        events: &[EventRow],
        signer_public_key: &str,
    ) -> Result<u32, StoreError>;
    /// Event joined with its interned signer public key.
    async fn get_event_by_id(
        &self,
        event_id: &str,
    ) -> Result<Option<(EventRow, String)>, StoreError>;

    /// Ids of events with `time <= now` and no outcome, time ascending.
    async fn events_past_without_outcome(&self, now: i64) -> Result<Vec<String>, StoreError>;
    /// `MIN(time)` over events without an outcome; 0 if none.
    async fn earliest_time_without_outcome(&self) -> Result<i64, StoreError>;
    async fn count_events(&self) -> Result<u64, StoreError>;
    async fn count_future(&self, now: i64) -> Result<u64, StoreError>;
    /// Inclusive bounds; a 0 bound means unbounded; `definition` is
    /// case-normalized. Ordered by time ascending.
    async fn filter_event_ids(
        &self,
        start_time: i64,
        end_time: i64,
        definition: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, StoreError>;
    /// Events that have no nonce rows yet, time ascending.
    async fn events_without_nonces(&self, limit: u32) -> Result<Vec<String>, StoreError>;

    /// Append-only; duplicate `(event_id, digit_index)` fails.
    async fn insert_nonces(&self, nonces: &[NonceRow]) -> Result<(), StoreError>;
    /// Ordered by digit index ascending.
    async fn get_nonces(&self, event_id: &str) -> Result<Vec<NonceRow>, StoreError>;

    async fn get_outcome(&self, event_id: &str) -> Result<Option<OutcomeRow>, StoreError>;
    async fn get_digit_outcomes(&self, event_id: &str)
        -> Result<Vec<DigitOutcomeRow>, StoreError>;
    /// Outcome, digit outcomes and the pending-sign cleanup are applied in
    /// one transaction: either all become visible or none do.
    async fn insert_outcome_with_digits(
        &self,
        outcome: &OutcomeRow,
        digits: &[DigitOutcomeRow],
    ) -> Result<(), StoreError>;

    async fn insert_pending_sign(&self, rows: &[PendingSignRow]) -> Result<(), StoreError>;
    async fn get_pending_sign(&self, event_id: &str) -> Result<Vec<PendingSignRow>, StoreError>;

    /// All interned signer public keys.
    async fn all_public_keys(&self) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod contract_tests {
    use super::*;
    use crate::codec::EVENT_STRING_TEMPLATE_DEFAULT;

    const DIGITS: u32 = 7;
    const START: i64 = 1_763_000_000;
    const PERIOD: i64 = 3600;

    fn test_class() -> EventClassRow {
        let repeat_first_time = (START / PERIOD) * PERIOD - 7 * PERIOD;
        EventClassRow {
            id: "btcusd01".to_string(),
            create_time: START,
            definition: "BTCUSD".to_string(),
            range_digits: DIGITS,
            range_digit_low_pos: 0,
            string_template: EVENT_STRING_TEMPLATE_DEFAULT.to_string(),
            repeat_first_time,
            repeat_period: PERIOD,
            repeat_offset: repeat_first_time.rem_euclid(PERIOD),
            repeat_last_time: repeat_first_time + 37 * PERIOD,
            signer_public_key: "signer_pubkey_001".to_string(),
        }
    }

    fn test_event(class: &EventClassRow, slot: i64) -> EventRow {
        let event_id = format!("ev_btcusd_01_{slot:03}");
        EventRow {
            event_id: event_id.clone(),
            class_id: class.id.clone(),
            definition: class.definition.clone(),
            time: class.repeat_first_time + slot * class.repeat_period,
            string_template: class.string_template.replace("{event_id}", &event_id),
        }
    }

    fn test_nonces(event_id: &str, digits: u32) -> Vec<NonceRow> {
        (0..digits)
            .map(|d| NonceRow {
                event_id: event_id.to_string(),
                digit_index: d,
                nonce_pub: format!("nonce_pub_{event_id}_{d}"),
                nonce_sec: format!("nonce_sec_{event_id}_{d}"),
            })
            .collect()
    }

    fn signed_digits(event: &EventRow, value: u64, nonces: &[NonceRow]) -> Vec<DigitOutcomeRow> {
        let s = format!("{:0width$}", value, width = DIGITS as usize);
        s.bytes()
            .enumerate()
            .map(|(d, b)| {
                let digit_value = b - b'0';
                DigitOutcomeRow {
                    event_id: event.event_id.clone(),
                    digit_index: d as u32,
                    digit_value,
                    nonce_pub: nonces[d].nonce_pub.clone(),
                    signature: format!("sig_{}_{d}", event.event_id),
                    msg_str: event
                        .string_template
                        .replace("{digit_index}", &d.to_string())
                        .replace("{digit_outcome}", &digit_value.to_string()),
                }
            })
            .collect()
    }

    /// The shared behavioral contract; both implementations must pass it.
    async fn exercise_store(store: &dyn EventStore) {
        let class = test_class();

        assert_eq!(store.all_classes().await.unwrap().len(), 0);
        assert_eq!(store.count_events().await.unwrap(), 0);

        // Class insert is idempotent.
        assert_eq!(store.insert_class_if_missing(&class).await.unwrap(), 1);
        assert_eq!(store.insert_class_if_missing(&class).await.unwrap(), 0);
        assert_eq!(
            store.get_class_by_id(&class.id).await.unwrap().unwrap(),
            class
        );
        assert_eq!(
            store
                .latest_class_by_def("BTCUSD")
                .await
                .unwrap()
                .unwrap()
                .id,
            class.id
        );
        assert!(store.latest_class_by_def("ETHUSD").await.unwrap().is_none());

        // Events at slots 5..=10.
        let events: Vec<EventRow> = (5..=10).map(|s| test_event(&class, s)).collect();
        for e in &events {
            assert_eq!(
                store
                    .insert_event_if_missing(e, &class.signer_public_key)
                    .await
                    .unwrap(),
                1
            );
            assert_eq!(
                store
                    .insert_event_if_missing(e, &class.signer_public_key)
                    .await
                    .unwrap(),
                0
            );
        }
        assert_eq!(store.count_events().await.unwrap(), 6);

        let (back, signer) = store
            .get_event_by_id(&events[0].event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, events[0]);
        assert_eq!(signer, class.signer_public_key);
        assert_eq!(
            back.string_template,
            "Outcome:ev_btcusd_01_005:{digit_index}:{digit_outcome}"
        );
        assert!(store.get_event_by_id("missing").await.unwrap().is_none());

        // Nonces for every event; uniqueness enforced per (event, digit).
        for e in &events {
            let nonces = test_nonces(&e.event_id, DIGITS);
            store.insert_nonces(&nonces).await.unwrap();
            let back = store.get_nonces(&e.event_id).await.unwrap();
            assert_eq!(back.len(), DIGITS as usize);
            assert_eq!(back[3].digit_index, 3);
            assert!(store.insert_nonces(&nonces[..1]).await.is_err());
        }
        assert_eq!(
            store.events_without_nonces(100).await.unwrap().len(),
            0
        );

        // Sign the first three events.
        for (i, e) in events.iter().take(3).enumerate() {
            let value = 100_000 + i as u64 * 1000;
            let nonces = store.get_nonces(&e.event_id).await.unwrap();
            let digits = signed_digits(e, value, &nonces);
            let outcome = OutcomeRow {
                event_id: e.event_id.clone(),
                value: value.to_string(),
                created_time: e.time + 3,
            };
            store
                .insert_outcome_with_digits(&outcome, &digits)
                .await
                .unwrap();

            let dos = store.get_digit_outcomes(&e.event_id).await.unwrap();
            assert_eq!(dos.len(), DIGITS as usize);
            assert_eq!(dos[3].digit_index, 3);
            assert_eq!(
                dos[3].msg_str,
                format!("Outcome:{}:3:{}", e.event_id, dos[3].digit_value)
            );
            assert!(store.get_outcome(&e.event_id).await.unwrap().is_some());
        }

        // Earliest unsigned is the fourth event.
        assert_eq!(
            store.earliest_time_without_outcome().await.unwrap(),
            events[3].time
        );

        // Past-without-outcome windows.
        assert_eq!(
            store
                .events_past_without_outcome(events[5].time + 1000)
                .await
                .unwrap(),
            vec![
                events[3].event_id.clone(),
                events[4].event_id.clone(),
                events[5].event_id.clone()
            ]
        );
        assert_eq!(
            store
                .events_past_without_outcome(events[3].time + 1000)
                .await
                .unwrap(),
            vec![events[3].event_id.clone()]
        );

        // Future counts.
        assert_eq!(store.count_future(events[5].time - 1000).await.unwrap(), 1);
        assert_eq!(store.count_future(events[3].time - 1000).await.unwrap(), 3);

        // Filters: inclusive bounds, 0 sentinel, definition, limit.
        let ids = store
            .filter_event_ids(events[1].time - 1000, events[5].time + 1000, None, 1000)
            .await
            .unwrap();
        assert_eq!(ids.len(), 5);
        let ids = store
            .filter_event_ids(events[2].time - 1000, events[4].time + 1000, Some("btcusd"), 1000)
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        let ids = store
            .filter_event_ids(events[2].time - 1000, events[4].time + 1000, Some("BTCEUR"), 1000)
            .await
            .unwrap();
        assert_eq!(ids.len(), 0);
        let ids = store
            .filter_event_ids(events[1].time - 1000, 0, None, 2)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        // Pending-sign rows live until the outcome transaction clears them.
        let target = &events[4];
        let pending: Vec<PendingSignRow> = (0..DIGITS)
            .map(|d| PendingSignRow {
                event_id: target.event_id.clone(),
                digit_index: d,
                digit_value: 5,
                msg_str: format!("Outcome:{}:{d}:5", target.event_id),
            })
            .collect();
        store.insert_pending_sign(&pending).await.unwrap();
        assert_eq!(
            store.get_pending_sign(&target.event_id).await.unwrap(),
            pending
        );

        let nonces = store.get_nonces(&target.event_id).await.unwrap();
        let digits = signed_digits(target, 5_555_555, &nonces);
        let outcome = OutcomeRow {
            event_id: target.event_id.clone(),
            value: "5555555".to_string(),
            created_time: target.time + 3,
        };
        store
            .insert_outcome_with_digits(&outcome, &digits)
            .await
            .unwrap();
        assert!(store
            .get_pending_sign(&target.event_id)
            .await
            .unwrap()
            .is_empty());

        // Batched insert skips the rows that already exist.
        let batch: Vec<EventRow> = (9..=12).map(|s| test_event(&class, s)).collect();
        assert_eq!(
            store
                .append_events_if_missing(&batch, &class.signer_public_key)
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.count_events().await.unwrap(), 8);

        // Pubkey interning: one distinct key.
        assert_eq!(
            store.all_public_keys().await.unwrap(),
            vec![class.signer_public_key.clone()]
        );
    }

    /// Referential integrity: dependents cannot be written before the
    /// event exists.
    async fn exercise_invalid_references(store: &dyn EventStore) {
        let class = test_class();
        let event = test_event(&class, 7);

        let outcome = OutcomeRow {
            event_id: event.event_id.clone(),
            value: "99999".to_string(),
            created_time: START,
        };
        assert!(store
            .insert_outcome_with_digits(&outcome, &[])
            .await
            .is_err());

        let nonce = test_nonces(&event.event_id, 1);
        assert!(store.insert_nonces(&nonce).await.is_err());
        assert_eq!(store.get_nonces(&event.event_id).await.unwrap().len(), 0);

        // Event before its class fails too.
        assert!(store
            .insert_event_if_missing(&event, "signer_pubkey")
            .await
            .is_err());

        // Once the class exists the chain goes through.
        store.insert_class_if_missing(&class).await.unwrap();
        assert_eq!(
            store
                .insert_event_if_missing(&event, "signer_pubkey")
                .await
                .unwrap(),
            1
        );
        store.insert_nonces(&nonce).await.unwrap();
        assert_eq!(store.get_nonces(&event.event_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        let store = MemoryEventStore::new();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn memory_store_invalid_references() {
        let store = MemoryEventStore::new();
        exercise_invalid_references(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().to_str().unwrap()).unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_invalid_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().to_str().unwrap()).unwrap();
        exercise_invalid_references(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        {
            let store = SqliteEventStore::open(&path).unwrap();
            let class = test_class();
            store.insert_class_if_missing(&class).await.unwrap();
            let event = test_event(&class, 5);
            store
                .insert_event_if_missing(&event, &class.signer_public_key)
                .await
                .unwrap();
        }
        let store = SqliteEventStore::open(&path).unwrap();
        assert_eq!(store.count_events().await.unwrap(), 1);
        assert_eq!(store.all_classes().await.unwrap().len(), 1);
    }
}
