//! SQLite-backed event store.
//!
//! One writer connection behind an async mutex serializes all access;
//! SQLite's transactionality gives readers a consistent snapshot per
//! query. WAL mode keeps commits cheap for the scheduler's write bursts.

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{
    DigitOutcomeRow, EventClassRow, EventRow, EventStore, NonceRow, OutcomeRow, PendingSignRow,
    StoreError,
};

pub const DB_FILE_NAME: &str = "ora.db";

/// Schema version this build writes. Migrations are forward-only.
const CURRENT_VERSION: i64 = 2;

#[derive(Clone)]
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) `ora.db` inside `data_dir` and migrate it to the
    /// current schema version.
    pub fn open(data_dir: &str) -> anyhow::Result<Self> {
        let db_path = Path::new(data_dir).join(DB_FILE_NAME);
        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("open event store at {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrate(&mut conn)?;
        info!(path = %db_path.display(), "event store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get-or-insert a signer public key, returning its interned id.
    fn intern_pubkey(conn: &Connection, public_key: &str) -> Result<i64, StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO PUBKEY (public_key) VALUES (?1)",
            params![public_key],
        )?;
        let id = conn.query_row(
            "SELECT id FROM PUBKEY WHERE public_key = ?1",
            params![public_key],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn insert_event_tx(
        conn: &Connection,
        event: &EventRow,
        pubkey_id: i64,
    ) -> Result<u32, StoreError> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO EVENT \
             (event_id, class_id, definition, time, string_template, signer_public_key_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &event.event_id,
                &event.class_id,
                &event.definition,
                event.time,
                &event.string_template,
                pubkey_id,
            ],
        )?;
        Ok(changed as u32)
    }
}

fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let has_version_table: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'VERSION'",
        [],
        |row| row.get(0),
    )?;
    if has_version_table == 0 {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT version FROM VERSION LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);
    Ok(version)
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let found = current_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(StoreError::VersionTooNew {
            found,
            supported: CURRENT_VERSION,
        });
    }
    if found == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    let mut version = found;
    while version < CURRENT_VERSION {
        match version {
            0 => migrate_v0_to_v1(&tx)?,
            1 => migrate_v1_to_v2(&tx)?,
            _ => unreachable!("no migration from version {version}"),
        }
        version += 1;
        info!(version, "applied store migration");
    }
    tx.execute("DELETE FROM VERSION", [])?;
    tx.execute(
        "INSERT INTO VERSION (version) VALUES (?1)",
        params![CURRENT_VERSION],
    )?;
    tx.commit()?;
    Ok(())
}

fn migrate_v0_to_v1(tx: &Connection) -> Result<(), StoreError> {
    tx.execute_batch(
        "CREATE TABLE VERSION (version INTEGER NOT NULL);
         CREATE TABLE EVENTCLASS (
            id TEXT PRIMARY KEY,
            create_time INTEGER NOT NULL,
            definition TEXT NOT NULL,
            range_digits INTEGER NOT NULL,
            range_digit_low_pos INTEGER NOT NULL,
            string_template TEXT NOT NULL,
            repeat_first_time INTEGER NOT NULL,
            repeat_period INTEGER NOT NULL,
            repeat_offset INTEGER NOT NULL,
            repeat_last_time INTEGER NOT NULL,
            signer_public_key TEXT NOT NULL
         );
         CREATE TABLE PUBKEY (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            public_key TEXT NOT NULL UNIQUE
         );
         CREATE TABLE EVENT (
            event_id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL REFERENCES EVENTCLASS(id),
            definition TEXT NOT NULL,
            time INTEGER NOT NULL,
            string_template TEXT NOT NULL,
            signer_public_key_id INTEGER NOT NULL REFERENCES PUBKEY(id)
         );
         CREATE INDEX idx_event_time ON EVENT(time);
         CREATE INDEX idx_event_def_time ON EVENT(definition, time);
         CREATE TABLE NONCE (
            event_id TEXT NOT NULL REFERENCES EVENT(event_id),
            digit_index INTEGER NOT NULL,
            nonce_pub TEXT NOT NULL,
            nonce_sec TEXT NOT NULL,
            UNIQUE(event_id, digit_index)
         );
         CREATE TABLE OUTCOME (
            event_id TEXT PRIMARY KEY REFERENCES EVENT(event_id),
            value TEXT NOT NULL,
            created_time INTEGER NOT NULL
         );
         CREATE TABLE DIGITOUTCOME (
            event_id TEXT NOT NULL REFERENCES EVENT(event_id),
            digit_index INTEGER NOT NULL,
            digit_value INTEGER NOT NULL,
            nonce_pub TEXT NOT NULL,
            signature TEXT NOT NULL,
            msg_str TEXT NOT NULL,
            UNIQUE(event_id, digit_index)
         );",
    )?;
    Ok(())
}

fn migrate_v1_to_v2(tx: &Connection) -> Result<(), StoreError> {
    // Signing intents recorded ahead of the first signature, so a crash
    // between signing and the outcome commit can be replayed verbatim.
    tx.execute_batch(
        "CREATE TABLE PENDING_SIGN (
            event_id TEXT NOT NULL REFERENCES EVENT(event_id),
            digit_index INTEGER NOT NULL,
            digit_value INTEGER NOT NULL,
            msg_str TEXT NOT NULL,
            UNIQUE(event_id, digit_index)
         );",
    )?;
    Ok(())
}

fn class_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventClassRow> {
    Ok(EventClassRow {
        id: row.get(0)?,
        create_time: row.get(1)?,
        definition: row.get(2)?,
        range_digits: row.get(3)?,
        range_digit_low_pos: row.get(4)?,
        string_template: row.get(5)?,
        repeat_first_time: row.get(6)?,
        repeat_period: row.get(7)?,
        repeat_offset: row.get(8)?,
        repeat_last_time: row.get(9)?,
        signer_public_key: row.get(10)?,
    })
}

const CLASS_COLUMNS: &str = "id, create_time, definition, range_digits, range_digit_low_pos, \
     string_template, repeat_first_time, repeat_period, repeat_offset, repeat_last_time, \
     signer_public_key";

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert_class_if_missing(&self, ec: &EventClassRow) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO EVENTCLASS \
             (id, create_time, definition, range_digits, range_digit_low_pos, string_template, \
              repeat_first_time, repeat_period, repeat_offset, repeat_last_time, signer_public_key) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &ec.id,
                ec.create_time,
                &ec.definition,
                ec.range_digits,
                ec.range_digit_low_pos,
                &ec.string_template,
                ec.repeat_first_time,
                ec.repeat_period,
                ec.repeat_offset,
                ec.repeat_last_time,
                &ec.signer_public_key,
            ],
        )?;
        Ok(changed as u32)
    }

    async fn get_class_by_id(&self, id: &str) -> Result<Option<EventClassRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLASS_COLUMNS} FROM EVENTCLASS WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], class_from_row)?;
        Ok(rows.next().transpose()?)
    }

    async fn latest_class_by_def(
        &self,
        definition: &str,
    ) -> Result<Option<EventClassRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLASS_COLUMNS} FROM EVENTCLASS WHERE definition = ?1 \
             ORDER BY create_time DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![definition.to_uppercase()], class_from_row)?;
        Ok(rows.next().transpose()?)
    }

    async fn all_classes_by_def(
        &self,
        definition: &str,
    ) -> Result<Vec<EventClassRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLASS_COLUMNS} FROM EVENTCLASS WHERE definition = ?1 \
             ORDER BY create_time DESC"
        ))?;
        let rows = stmt.query_map(params![definition.to_uppercase()], class_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn all_classes(&self) -> Result<Vec<EventClassRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLASS_COLUMNS} FROM EVENTCLASS ORDER BY create_time ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], class_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn insert_event_if_missing(
        &self,
        event: &EventRow,
        signer_public_key: &str,
    ) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let pubkey_id = Self::intern_pubkey(&conn, signer_public_key)?;
        Self::insert_event_tx(&conn, event, pubkey_id)
    }

    async fn append_events_if_missing(
        &self,
        events: &[EventRow],
        signer_public_key: &str,
    ) -> Result<u32, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let pubkey_id = Self::intern_pubkey(&tx, signer_public_key)?;
        let mut inserted = 0;
        for event in events {
            inserted += Self::insert_event_tx(&tx, event, pubkey_id)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    async fn get_event_by_id(
        &self,
        event_id: &str,
    ) -> Result<Option<(EventRow, String)>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT e.event_id, e.class_id, e.definition, e.time, e.string_template, p.public_key \
             FROM EVENT e JOIN PUBKEY p ON p.id = e.signer_public_key_id \
             WHERE e.event_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![event_id], |row| {
            Ok((
                EventRow {
                    event_id: row.get(0)?,
                    class_id: row.get(1)?,
                    definition: row.get(2)?,
                    time: row.get(3)?,
                    string_template: row.get(4)?,
                },
                row.get::<_, String>(5)?,
            ))
        })?;
        Ok(rows.next().transpose()?)
    }

    async fn events_past_without_outcome(&self, now: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT e.event_id FROM EVENT e \
             LEFT JOIN OUTCOME o ON o.event_id = e.event_id \
             WHERE e.time <= ?1 AND o.event_id IS NULL \
             ORDER BY e.time ASC, e.event_id ASC",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn earliest_time_without_outcome(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        let min: Option<i64> = conn.query_row(
            "SELECT MIN(e.time) FROM EVENT e \
             LEFT JOIN OUTCOME o ON o.event_id = e.event_id \
             WHERE o.event_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(min.unwrap_or(0))
    }

    async fn count_events(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM EVENT", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn count_future(&self, now: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM EVENT WHERE time > ?1",
            params![now],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn filter_event_ids(
        &self,
        start_time: i64,
        end_time: i64,
        definition: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let def = definition.map(|d| d.to_uppercase()).unwrap_or_default();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id FROM EVENT \
             WHERE (?1 = 0 OR time >= ?1) AND (?2 = 0 OR time <= ?2) \
               AND (?3 = '' OR definition = ?3) \
             ORDER BY time ASC, event_id ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![start_time, end_time, def, limit], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn events_without_nonces(&self, limit: u32) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT e.event_id FROM EVENT e \
             LEFT JOIN NONCE n ON n.event_id = e.event_id \
             WHERE n.event_id IS NULL \
             ORDER BY e.time ASC, e.event_id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn insert_nonces(&self, nonces: &[NonceRow]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for nonce in nonces {
            tx.execute(
                "INSERT INTO NONCE (event_id, digit_index, nonce_pub, nonce_sec) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    &nonce.event_id,
                    nonce.digit_index,
                    &nonce.nonce_pub,
                    &nonce.nonce_sec,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_nonces(&self, event_id: &str) -> Result<Vec<NonceRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, digit_index, nonce_pub, nonce_sec FROM NONCE \
             WHERE event_id = ?1 ORDER BY digit_index ASC",
        )?;
        let rows = stmt.query_map(params![event_id], |row| {
            Ok(NonceRow {
                event_id: row.get(0)?,
                digit_index: row.get(1)?,
                nonce_pub: row.get(2)?,
                nonce_sec: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_outcome(&self, event_id: &str) -> Result<Option<OutcomeRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, value, created_time FROM OUTCOME WHERE event_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![event_id], |row| {
            Ok(OutcomeRow {
                event_id: row.get(0)?,
                value: row.get(1)?,
                created_time: row.get(2)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    async fn get_digit_outcomes(
        &self,
        event_id: &str,
    ) -> Result<Vec<DigitOutcomeRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, digit_index, digit_value, nonce_pub, signature, msg_str \
             FROM DIGITOUTCOME WHERE event_id = ?1 ORDER BY digit_index ASC",
        )?;
        let rows = stmt.query_map(params![event_id], |row| {
            Ok(DigitOutcomeRow {
                event_id: row.get(0)?,
                digit_index: row.get(1)?,
                digit_value: row.get(2)?,
                nonce_pub: row.get(3)?,
                signature: row.get(4)?,
                msg_str: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn insert_outcome_with_digits(
        &self,
        outcome: &OutcomeRow,
        digits: &[DigitOutcomeRow],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO OUTCOME (event_id, value, created_time) VALUES (?1, ?2, ?3)",
            params![&outcome.event_id, &outcome.value, outcome.created_time],
        )?;
        for digit in digits {
            tx.execute(
                "INSERT INTO DIGITOUTCOME \
                 (event_id, digit_index, digit_value, nonce_pub, signature, msg_str) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &digit.event_id,
                    digit.digit_index,
                    digit.digit_value,
                    &digit.nonce_pub,
                    &digit.signature,
                    &digit.msg_str,
                ],
            )?;
        }
        tx.execute(
            "DELETE FROM PENDING_SIGN WHERE event_id = ?1",
            params![&outcome.event_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn insert_pending_sign(&self, rows: &[PendingSignRow]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT OR REPLACE INTO PENDING_SIGN (event_id, digit_index, digit_value, msg_str) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![&row.event_id, row.digit_index, row.digit_value, &row.msg_str],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_pending_sign(&self, event_id: &str) -> Result<Vec<PendingSignRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, digit_index, digit_value, msg_str FROM PENDING_SIGN \
             WHERE event_id = ?1 ORDER BY digit_index ASC",
        )?;
        let rows = stmt.query_map(params![event_id], |row| {
            Ok(PendingSignRow {
                event_id: row.get(0)?,
                digit_index: row.get(1)?,
                digit_value: row.get(2)?,
                msg_str: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn all_public_keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT public_key FROM PUBKEY ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
