//! In-memory event store.
//!
//! Satisfies the `EventStore` contract without touching disk, including
//! the referential-integrity failures the SQLite schema enforces. Used as
//! a test double by unit and integration tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{
    DigitOutcomeRow, EventClassRow, EventRow, EventStore, NonceRow, OutcomeRow, PendingSignRow,
    StoreError,
};

#[derive(Default)]
struct Inner {
    classes: Vec<EventClassRow>,
    /// Keyed by event id; value carries the interned pubkey index.
    events: HashMap<String, (EventRow, usize)>,
    nonces: HashMap<String, BTreeMap<u32, NonceRow>>,
    outcomes: HashMap<String, OutcomeRow>,
    digit_outcomes: HashMap<String, Vec<DigitOutcomeRow>>,
    pending_sign: HashMap<String, Vec<PendingSignRow>>,
    public_keys: Vec<String>,
}

impl Inner {
    fn intern_pubkey(&mut self, public_key: &str) -> usize {
        if let Some(pos) = self.public_keys.iter().position(|k| k == public_key) {
            return pos;
        }
        self.public_keys.push(public_key.to_string());
        self.public_keys.len() - 1
    }

    fn require_event(&self, event_id: &str) -> Result<(), StoreError> {
        if self.events.contains_key(event_id) {
            Ok(())
        } else {
            Err(StoreError::Constraint(format!(
                "event {event_id} does not exist"
            )))
        }
    }

    /// Event ids sorted by (time, id), optionally filtered.
    fn sorted_event_ids(&self, filter: impl Fn(&EventRow) -> bool) -> Vec<String> {
        let mut rows: Vec<(i64, &String)> = self
            .events
            .values()
            .filter(|(e, _)| filter(e))
            .map(|(e, _)| (e.time, &e.event_id))
            .collect();
        rows.sort();
        rows.into_iter().map(|(_, id)| id.clone()).collect()
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_class_if_missing(&self, ec: &EventClassRow) -> Result<u32, StoreError> {
        let mut inner = self.inner.write();
        if inner.classes.iter().any(|c| c.id == ec.id) {
            return Ok(0);
        }
        inner.classes.push(ec.clone());
        Ok(1)
    }

    async fn get_class_by_id(&self, id: &str) -> Result<Option<EventClassRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.classes.iter().find(|c| c.id == id).cloned())
    }

    async fn latest_class_by_def(
        &self,
        definition: &str,
    ) -> Result<Option<EventClassRow>, StoreError> {
        let def = definition.to_uppercase();
        let inner = self.inner.read();
        Ok(inner
            .classes
            .iter()
            .filter(|c| c.definition == def)
            .max_by_key(|c| c.create_time)
            .cloned())
    }

    async fn all_classes_by_def(
        &self,
        definition: &str,
    ) -> Result<Vec<EventClassRow>, StoreError> {
        let def = definition.to_uppercase();
        let inner = self.inner.read();
        let mut classes: Vec<EventClassRow> = inner
            .classes
            .iter()
            .filter(|c| c.definition == def)
            .cloned()
            .collect();
        classes.sort_by_key(|c| std::cmp::Reverse(c.create_time));
        Ok(classes)
    }

    async fn all_classes(&self) -> Result<Vec<EventClassRow>, StoreError> {
        let inner = self.inner.read();
        let mut classes = inner.classes.clone();
        classes.sort_by(|a, b| (a.create_time, &a.id).cmp(&(b.create_time, &b.id)));
        Ok(classes)
    }

    async fn insert_event_if_missing(
        &self,
        event: &EventRow,
        signer_public_key: &str,
    ) -> Result<u32, StoreError> {
        let mut inner = self.inner.write();
        if !inner.classes.iter().any(|c| c.id == event.class_id) {
            return Err(StoreError::Constraint(format!(
                "event class {} does not exist",
                event.class_id
            )));
        }
        if inner.events.contains_key(&event.event_id) {
            return Ok(0);
        }
        let pubkey_idx = inner.intern_pubkey(signer_public_key);
        inner
            .events
            .insert(event.event_id.clone(), (event.clone(), pubkey_idx));
        Ok(1)
    }

    async fn append_events_if_missing(
        &self,
        events: &[EventRow],
        signer_public_key: &str,
    ) -> Result<u32, StoreError> {
        let mut inserted = 0;
        for event in events {
            inserted += self.insert_event_if_missing(event, signer_public_key).await?;
        }
        Ok(inserted)
    }

    async fn get_event_by_id(
        &self,
        event_id: &str,
    ) -> Result<Option<(EventRow, String)>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(event_id)
            .map(|(e, idx)| (e.clone(), inner.public_keys[*idx].clone())))
    }

    async fn events_past_without_outcome(&self, now: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .sorted_event_ids(|e| e.time <= now && !inner.outcomes.contains_key(&e.event_id)))
    }

    async fn earliest_time_without_outcome(&self) -> Result<i64, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .values()
            .filter(|(e, _)| !inner.outcomes.contains_key(&e.event_id))
            .map(|(e, _)| e.time)
            .min()
            .unwrap_or(0))
    }

    async fn count_events(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().events.len() as u64)
    }

    async fn count_future(&self, now: i64) -> Result<u64, StoreError> {
        let inner = self.inner.read();
        Ok(inner.events.values().filter(|(e, _)| e.time > now).count() as u64)
    }

    async fn filter_event_ids(
        &self,
        start_time: i64,
        end_time: i64,
        definition: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, StoreError> {
        let def = definition.map(|d| d.to_uppercase());
        let inner = self.inner.read();
        let mut ids = inner.sorted_event_ids(|e| {
            (start_time == 0 || e.time >= start_time)
                && (end_time == 0 || e.time <= end_time)
                && def.as_deref().map_or(true, |d| e.definition == d)
        });
        ids.truncate(limit as usize);
        Ok(ids)
    }

    async fn events_without_nonces(&self, limit: u32) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read();
        let mut ids = inner.sorted_event_ids(|e| {
            inner
                .nonces
                .get(&e.event_id)
                .map_or(true, |n| n.is_empty())
        });
        ids.truncate(limit as usize);
        Ok(ids)
    }

    async fn insert_nonces(&self, nonces: &[NonceRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        // Validate everything before mutating, so a failed batch is a no-op
        // like the SQLite transaction.
        for nonce in nonces {
            inner.require_event(&nonce.event_id)?;
            if inner
                .nonces
                .get(&nonce.event_id)
                .is_some_and(|n| n.contains_key(&nonce.digit_index))
            {
                return Err(StoreError::Constraint(format!(
                    "duplicate nonce for {}:{}",
                    nonce.event_id, nonce.digit_index
                )));
            }
        }
        for nonce in nonces {
            inner
                .nonces
                .entry(nonce.event_id.clone())
                .or_default()
                .insert(nonce.digit_index, nonce.clone());
        }
        Ok(())
    }

    async fn get_nonces(&self, event_id: &str) -> Result<Vec<NonceRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .nonces
            .get(event_id)
            .map(|n| n.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_outcome(&self, event_id: &str) -> Result<Option<OutcomeRow>, StoreError> {
        Ok(self.inner.read().outcomes.get(event_id).cloned())
    }

    async fn get_digit_outcomes(
        &self,
        event_id: &str,
    ) -> Result<Vec<DigitOutcomeRow>, StoreError> {
        let inner = self.inner.read();
        let mut digits = inner
            .digit_outcomes
            .get(event_id)
            .cloned()
            .unwrap_or_default();
        digits.sort_by_key(|d| d.digit_index);
        Ok(digits)
    }

    async fn insert_outcome_with_digits(
        &self,
        outcome: &OutcomeRow,
        digits: &[DigitOutcomeRow],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.require_event(&outcome.event_id)?;
        if inner.outcomes.contains_key(&outcome.event_id) {
            return Err(StoreError::Constraint(format!(
                "outcome for {} already exists",
                outcome.event_id
            )));
        }
        inner
            .outcomes
            .insert(outcome.event_id.clone(), outcome.clone());
        inner
            .digit_outcomes
            .insert(outcome.event_id.clone(), digits.to_vec());
        inner.pending_sign.remove(&outcome.event_id);
        Ok(())
    }

    async fn insert_pending_sign(&self, rows: &[PendingSignRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for row in rows {
            inner.require_event(&row.event_id)?;
        }
        for row in rows {
            let pending = inner.pending_sign.entry(row.event_id.clone()).or_default();
            pending.retain(|p| p.digit_index != row.digit_index);
            pending.push(row.clone());
        }
        Ok(())
    }

    async fn get_pending_sign(&self, event_id: &str) -> Result<Vec<PendingSignRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows = inner
            .pending_sign
            .get(event_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|r| r.digit_index);
        Ok(rows)
    }

    async fn all_public_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().public_keys.clone())
    }
}
