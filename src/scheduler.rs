//! Event lifecycle engine.
//!
//! Two long-lived tasks drive the oracle. The outcome loop keeps a
//! sliding horizon of future events materialized and, as events mature,
//! turns a fetched price into a fully signed outcome. The nonce-fill
//! loop backfills nonce sets for events that were bulk-inserted with
//! nonce generation deferred.
//!
//! Event states are implicit in row existence: an EVENT row alone is
//! `scheduled`, adding NONCE rows makes it `committed`, adding OUTCOME +
//! DIGITOUTCOME rows makes it `signed`. Transitions are monotone.
//!
//! Nonce-reuse safety: before the first signature of an event is made,
//! the exact per-digit messages are persisted (PENDING_SIGN). A restart
//! that finds pending rows replays those messages instead of fetching a
//! fresh price, so a committed nonce can never sign two different
//! strings.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::codec::{digit_message, EventDescriptor};
use crate::crypto::KeySigner;
use crate::price::PriceAggregator;
use crate::store::{
    DigitOutcomeRow, EventClassRow, EventRow, EventStore, NonceRow, OutcomeRow, PendingSignRow,
    StoreError,
};

pub const HORIZON_DAYS_DEFAULT: u32 = 390;
/// Matured events older than this are skipped, not signed.
pub const TOO_OLD_SECS: i64 = 86_400;
/// Horizon expansion inserts at most this many events per pass, keeping
/// the loop responsive.
const MAX_EVENT_BATCH: u32 = 10;
/// All outcome signatures use this child key.
const SIGNING_CHILD_INDEX: u32 = 0;
/// Freshness preference for maturity price fetches.
const PRICE_PREF_MAX_AGE_SECS: f64 = 15.0;
/// Events examined per nonce-fill pass.
const NONCE_FILL_BATCH: u32 = 50;

/// Deterministic event id: lowercased definition followed by the time.
pub fn event_id_for(definition: &str, time: i64) -> String {
    format!("{}{}", definition.to_lowercase(), time)
}

/// Snap `start` down and `end` up to the grid `offset (mod period)`.
pub fn compute_event_time_range(period: i64, offset: i64, start: i64, end: i64) -> (i64, i64) {
    let first = start - (start - offset).rem_euclid(period);
    let rem = (end - offset).rem_euclid(period);
    let last = if rem == 0 { end } else { end + period - rem };
    (first, last)
}

/// Earliest aligned event time of `class` at or after `abs_time`;
/// 0 when the class has no remaining slot.
pub fn next_event_time(class: &EventClassRow, abs_time: i64) -> i64 {
    if abs_time > class.repeat_last_time {
        return 0;
    }
    let t = abs_time.max(class.repeat_first_time);
    let rem = (t - class.repeat_offset).rem_euclid(class.repeat_period);
    let next = if rem == 0 { t } else { t + class.repeat_period - rem };
    if next > class.repeat_last_time {
        0
    } else {
        next
    }
}

fn descriptor_for_class(class: &EventClassRow) -> EventDescriptor {
    EventDescriptor {
        definition: class.definition.clone(),
        range_digits: class.range_digits,
        range_digit_low_pos: class.range_digit_low_pos,
        string_template: class.string_template.clone(),
    }
}

pub struct Scheduler {
    store: Arc<dyn EventStore>,
    signer: Arc<KeySigner>,
    prices: Arc<PriceAggregator>,
    horizon_days: u32,
    /// Skip inline nonce generation during horizon expansion and leave it
    /// to the nonce-fill loop.
    defer_nonces: bool,
    loop_started: AtomicBool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn EventStore>,
        signer: Arc<KeySigner>,
        prices: Arc<PriceAggregator>,
        horizon_days: u32,
        defer_nonces: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            signer,
            prices,
            horizon_days,
            defer_nonces,
            loop_started: AtomicBool::new(false),
        })
    }

    /// Start the outcome loop and the nonce-fill loop. Idempotent: a
    /// second call is a no-op.
    pub fn spawn(self: Arc<Self>) {
        if self.loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(horizon_days = self.horizon_days, "scheduler loops started");
        let outcome = self.clone();
        tokio::spawn(async move {
            outcome.outcome_loop().await;
        });
        tokio::spawn(async move {
            self.nonce_fill_loop().await;
        });
    }

    async fn outcome_loop(self: Arc<Self>) {
        loop {
            let now = Utc::now().timestamp();

            let (signed, next_mature) = match self.create_past_outcomes(now, TOO_OLD_SECS).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "outcome pass failed; retrying shortly");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if signed > 0 {
                continue;
            }

            let (inserted, next_horizon) =
                match self.create_future_events(now, MAX_EVENT_BATCH).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "horizon expansion failed; retrying shortly");
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
            if inserted > 0 {
                continue;
            }

            // Sleep roughly half the distance to the next deadline; wakes
            // converge on the deadline without busy-waiting.
            let wait_for = [next_mature, next_horizon]
                .into_iter()
                .filter(|t| *t > 0)
                .min();
            let sleep_secs = match wait_for {
                Some(t) => ((t - now) as f64 / 2.0 - 1.0).clamp(0.01, 60.0),
                None => 60.0,
            };
            if sleep_secs > 0.5 {
                debug!(sleep_secs, "outcome loop idle");
            }
            sleep(Duration::from_secs_f64(sleep_secs)).await;
        }
    }

    /// Sign every matured event, skipping events staler than `too_old`.
    /// Returns the number signed and the earliest time still without an
    /// outcome (0 if none).
    pub async fn create_past_outcomes(
        &self,
        now: i64,
        too_old: i64,
    ) -> Result<(u32, i64), StoreError> {
        let due = self.store.events_past_without_outcome(now).await?;
        let mut signed = 0u32;
        let mut skipped_old = 0u32;

        for event_id in due {
            let Some((event, _signer_pubkey)) = self.store.get_event_by_id(&event_id).await?
            else {
                continue;
            };
            if event.time < now - too_old {
                skipped_old += 1;
                continue;
            }
            match self.sign_event(&event, now).await {
                Ok(()) => {
                    signed += 1;
                    info!(event_id = %event.event_id, "outcome signed");
                }
                Err(e) => {
                    // The event stays committed; the next pass retries.
                    warn!(event_id = %event.event_id, error = %e, "outcome skipped");
                    if e.downcast_ref::<StoreError>().is_some() {
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        if skipped_old > 0 {
            warn!(count = skipped_old, "stale events skipped, not signed");
        }
        let earliest = self.store.earliest_time_without_outcome().await?;
        Ok((signed, earliest))
    }

    /// Produce the signed outcome for one matured event.
    async fn sign_event(&self, event: &EventRow, now: i64) -> Result<()> {
        let class = self
            .store
            .get_class_by_id(&event.class_id)
            .await?
            .with_context(|| format!("event class {} missing", event.class_id))?;
        let desc = descriptor_for_class(&class);

        let nonces = self
            .get_or_create_nonces(&event.event_id, class.range_digits)
            .await?;

        // Replay persisted intents when present; otherwise record fresh
        // ones from a price fetch before touching the signer.
        let mut pending = self.store.get_pending_sign(&event.event_id).await?;
        if pending.len() != class.range_digits as usize {
            let price_info = self
                .prices
                .get_price_info(&event.definition, PRICE_PREF_MAX_AGE_SECS)
                .await;
            if let Some(error) = price_info.error {
                bail!("no price for {}: {error}", event.definition);
            }
            let digit_values = desc.value_to_digits(price_info.price);
            pending = digit_values
                .iter()
                .enumerate()
                .map(|(i, d)| PendingSignRow {
                    event_id: event.event_id.clone(),
                    digit_index: i as u32,
                    digit_value: *d,
                    msg_str: digit_message(&event.string_template, &event.event_id, i as u32, *d),
                })
                .collect();
            self.store.insert_pending_sign(&pending).await?;
        } else {
            info!(event_id = %event.event_id, "replaying persisted signing intents");
        }

        let mut digit_outcomes = Vec::with_capacity(pending.len());
        for row in &pending {
            let nonce = &nonces[row.digit_index as usize];
            let signature = self
                .signer
                .sign_schnorr(&row.msg_str, &nonce.nonce_sec, SIGNING_CHILD_INDEX)
                .with_context(|| format!("signing digit {}", row.digit_index))?;
            digit_outcomes.push(DigitOutcomeRow {
                event_id: event.event_id.clone(),
                digit_index: row.digit_index,
                digit_value: row.digit_value,
                nonce_pub: nonce.nonce_pub.clone(),
                signature,
                msg_str: row.msg_str.clone(),
            });
        }

        let digit_values: Vec<u8> = pending.iter().map(|r| r.digit_value).collect();
        let outcome = OutcomeRow {
            event_id: event.event_id.clone(),
            value: desc.digits_to_value(&digit_values).to_string(),
            created_time: now,
        };
        self.store
            .insert_outcome_with_digits(&outcome, &digit_outcomes)
            .await?;
        Ok(())
    }

    /// Extend every class's event series up to the horizon, inserting at
    /// most `max_batch` events. Returns the insert count and the earliest
    /// already-present future slot (0 if none seen).
    pub async fn create_future_events(
        &self,
        now: i64,
        max_batch: u32,
    ) -> Result<(u32, i64)> {
        let classes = self.store.all_classes().await?;
        let horizon = now + self.horizon_days as i64 * 86_400;
        let mut inserted = 0u32;
        let mut next_present: i64 = 0;

        'classes: for class in classes {
            let start = now.max(class.repeat_first_time);
            let end = horizon.min(class.repeat_last_time);
            if start > end {
                continue;
            }
            let (first, last) =
                compute_event_time_range(class.repeat_period, class.repeat_offset, start, end);
            let first = first.max(class.repeat_first_time);
            let last = last.min(class.repeat_last_time);

            let mut t = first;
            while t <= last {
                let event_id = event_id_for(&class.definition, t);
                if self.store.get_event_by_id(&event_id).await?.is_some() {
                    if t > now && (next_present == 0 || t < next_present) {
                        next_present = t;
                    }
                } else {
                    let event = EventRow {
                        event_id: event_id.clone(),
                        class_id: class.id.clone(),
                        definition: class.definition.clone(),
                        time: t,
                        string_template: class.string_template.replace("{event_id}", &event_id),
                    };
                    self.store
                        .insert_event_if_missing(&event, &class.signer_public_key)
                        .await?;
                    if !self.defer_nonces {
                        self.get_or_create_nonces(&event_id, class.range_digits)
                            .await?;
                    }
                    inserted += 1;
                    if inserted >= max_batch {
                        break 'classes;
                    }
                }
                t += class.repeat_period;
            }
        }

        if inserted > 0 {
            debug!(inserted, "future events materialized");
        }
        Ok((inserted, next_present))
    }

    /// Return the committed nonce set for an event, deriving and
    /// persisting it first if absent.
    ///
    /// Derivation is deterministic per (event, digit), so a concurrent
    /// regeneration produces identical values; the store's uniqueness
    /// index merely prevents duplicate rows.
    pub async fn get_or_create_nonces(
        &self,
        event_id: &str,
        range_digits: u32,
    ) -> Result<Vec<NonceRow>> {
        let existing = self.store.get_nonces(event_id).await?;
        if existing.len() == range_digits as usize {
            return Ok(existing);
        }
        if !existing.is_empty() {
            bail!(
                "event {event_id} has {} nonces, expected 0 or {range_digits}",
                existing.len()
            );
        }

        let mut rows = Vec::with_capacity(range_digits as usize);
        for digit_index in 0..range_digits {
            let (nonce_sec, nonce_pub) = self.signer.deterministic_nonce(event_id, digit_index)?;
            rows.push(NonceRow {
                event_id: event_id.to_string(),
                digit_index,
                nonce_pub,
                nonce_sec,
            });
        }
        if let Err(e) = self.store.insert_nonces(&rows).await {
            // A concurrent writer got there first; the values are the
            // same, only the rows raced.
            debug!(event_id, error = %e, "nonce insert raced, re-reading");
        }
        let stored = self.store.get_nonces(event_id).await?;
        if stored.len() != range_digits as usize {
            bail!("nonce materialization failed for {event_id}");
        }
        Ok(stored)
    }

    async fn nonce_fill_loop(self: Arc<Self>) {
        loop {
            let pending = match self.store.events_without_nonces(NONCE_FILL_BATCH).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "nonce-fill query failed");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if pending.is_empty() {
                sleep(Duration::from_secs(10)).await;
                continue;
            }

            for event_id in &pending {
                let result = async {
                    let Some((event, _)) = self.store.get_event_by_id(event_id).await? else {
                        return Ok(());
                    };
                    let class = self
                        .store
                        .get_class_by_id(&event.class_id)
                        .await?
                        .with_context(|| format!("event class {} missing", event.class_id))?;
                    self.get_or_create_nonces(event_id, class.range_digits)
                        .await?;
                    Ok::<(), anyhow::Error>(())
                }
                .await;
                if let Err(e) = result {
                    warn!(event_id = %event_id, error = %e, "nonce backfill failed");
                }
            }
            debug!(count = pending.len(), "nonce backfill pass done");
            sleep(Duration::from_millis(100)).await;
        }
    }
}
