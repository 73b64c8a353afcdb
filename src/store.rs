//! SQLite persistence for send history, quota counters and leads.
//!
//! Every write commits before the call returns, so a record written by one
//! run is visible to the next even if the process dies right after. Send
//! records are keyed by recipient alone, which keeps outreach idempotent no
//! matter which date or hour bucket a later run lands in.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::clock::{date_bucket, hour_bucket};
use crate::error::PersistenceError;
use crate::history::HistoryStore;
use crate::leads::{Lead, LeadStore};
use crate::quota::{BucketCounts, CounterStore, QuotaLimits};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS send_records (
    recipient_identity TEXT PRIMARY KEY,
    location_key       TEXT NOT NULL,
    date_bucket        TEXT NOT NULL,
    hour_bucket        TEXT NOT NULL,
    sent_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS send_records_bucket
    ON send_records (date_bucket, hour_bucket);

CREATE TABLE IF NOT EXISTS daily_counts (
    date_bucket TEXT PRIMARY KEY,
    count       INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS hourly_counts (
    date_bucket TEXT NOT NULL,
    hour_bucket TEXT NOT NULL,
    count       INTEGER NOT NULL,
    PRIMARY KEY (date_bucket, hour_bucket)
);

CREATE TABLE IF NOT EXISTS leads (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    location_key TEXT NOT NULL,
    identity     TEXT NOT NULL,
    listing_url  TEXT,
    profile_url  TEXT,
    UNIQUE (location_key, identity)
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                PersistenceError(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, PersistenceError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError("store connection lock poisoned".to_string()))
    }

    /// Number of recipients ever messaged.
    pub fn sent_total(&self) -> Result<u64, PersistenceError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM send_records", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

impl HistoryStore for SqliteStore {
    fn has_been_messaged(&self, identity: &str) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM send_records WHERE recipient_identity = ?1",
                params![identity],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record_sent(
        &self,
        identity: &str,
        location_key: &str,
        when: OffsetDateTime,
    ) -> Result<bool, PersistenceError> {
        let sent_at = when
            .format(&Rfc3339)
            .map_err(|e| PersistenceError(format!("format timestamp: {e}")))?;
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO send_records
                (recipient_identity, location_key, date_bucket, hour_bucket, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity,
                location_key,
                date_bucket(when),
                hour_bucket(when),
                sent_at
            ],
        )?;
        if inserted == 0 {
            warn!(identity, "send record already present, keeping the original");
        }
        Ok(inserted == 1)
    }
}

impl CounterStore for SqliteStore {
    fn read_counts(&self, date: &str, hour: &str) -> Result<BucketCounts, PersistenceError> {
        let conn = self.conn()?;
        read_counts(&conn, date, hour)
    }

    fn try_increment(
        &self,
        date: &str,
        hour: &str,
        limits: QuotaLimits,
    ) -> Result<bool, PersistenceError> {
        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front so check and increment
        // cannot interleave with another process.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let counts = read_counts(&tx, date, hour)?;
        if counts.hourly >= limits.hourly || counts.daily >= limits.daily {
            tx.rollback()?;
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO daily_counts (date_bucket, count) VALUES (?1, 1)
             ON CONFLICT (date_bucket) DO UPDATE SET count = count + 1",
            params![date],
        )?;
        tx.execute(
            "INSERT INTO hourly_counts (date_bucket, hour_bucket, count) VALUES (?1, ?2, 1)
             ON CONFLICT (date_bucket, hour_bucket) DO UPDATE SET count = count + 1",
            params![date, hour],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

fn read_counts(conn: &Connection, date: &str, hour: &str) -> Result<BucketCounts, PersistenceError> {
    let daily: Option<i64> = conn
        .query_row(
            "SELECT count FROM daily_counts WHERE date_bucket = ?1",
            params![date],
            |r| r.get(0),
        )
        .optional()?;
    let hourly: Option<i64> = conn
        .query_row(
            "SELECT count FROM hourly_counts WHERE date_bucket = ?1 AND hour_bucket = ?2",
            params![date, hour],
            |r| r.get(0),
        )
        .optional()?;
    Ok(BucketCounts {
        hourly: to_count(hourly)?,
        daily: to_count(daily)?,
    })
}

fn to_count(raw: Option<i64>) -> Result<u32, PersistenceError> {
    u32::try_from(raw.unwrap_or(0))
        .map_err(|_| PersistenceError(format!("corrupt counter value {raw:?}")))
}

const LEAD_COLUMNS: &str = "
    SELECT l.identity, l.location_key, l.profile_url, l.listing_url,
           EXISTS (SELECT 1 FROM send_records s WHERE s.recipient_identity = l.identity)
    FROM leads l";

fn map_lead(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        identity: row.get(0)?,
        location_key: row.get(1)?,
        profile_handle: row.get(2)?,
        listing_url: row.get(3)?,
        already_messaged: row.get(4)?,
    })
}

impl LeadStore for SqliteStore {
    fn upsert_lead(
        &self,
        location_key: &str,
        identity: &str,
        listing_url: Option<&str>,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT seq FROM leads WHERE location_key = ?1 AND identity = ?2",
                params![location_key, identity],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(seq) = existing {
            if listing_url.is_some() {
                conn.execute(
                    "UPDATE leads SET listing_url = ?2 WHERE seq = ?1",
                    params![seq, listing_url],
                )?;
            }
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO leads (location_key, identity, listing_url) VALUES (?1, ?2, ?3)",
            params![location_key, identity, listing_url],
        )?;
        Ok(true)
    }

    fn set_profile(
        &self,
        location_key: &str,
        identity: &str,
        profile_url: &str,
    ) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE leads SET profile_url = ?3 WHERE location_key = ?1 AND identity = ?2",
            params![location_key, identity, profile_url],
        )?;
        if updated == 0 {
            return Err(PersistenceError(format!(
                "no lead {identity:?} in location {location_key:?}"
            )));
        }
        Ok(())
    }

    fn leads_for_location(&self, location_key: &str) -> Result<Vec<Lead>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("{LEAD_COLUMNS} WHERE l.location_key = ?1 ORDER BY l.seq"))?;
        let rows = stmt.query_map(params![location_key], map_lead)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn leads_missing_profile(&self, location_key: &str) -> Result<Vec<Lead>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{LEAD_COLUMNS} WHERE l.location_key = ?1 AND l.profile_url IS NULL ORDER BY l.seq"
        ))?;
        let rows = stmt.query_map(params![location_key], map_lead)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn history_is_checked_across_all_buckets() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(!store.has_been_messaged("Cafe Luna").unwrap());
        assert!(store
            .record_sent("Cafe Luna", "lisbon", datetime!(2023-12-31 23:59 UTC))
            .unwrap());
        assert!(store.has_been_messaged("Cafe Luna").unwrap());
        assert!(!store.has_been_messaged("Cafe Sol").unwrap());
    }

    #[test]
    fn second_record_for_same_recipient_is_ignored() {
        let store = SqliteStore::in_memory().unwrap();
        let t = datetime!(2024-02-01 10:00 UTC);
        assert!(store.record_sent("A", "x", t).unwrap());
        assert!(!store.record_sent("A", "y", t + time::Duration::days(3)).unwrap());
        assert_eq!(store.sent_total().unwrap(), 1);
    }

    #[test]
    fn try_increment_respects_both_limits() {
        let store = SqliteStore::in_memory().unwrap();
        let limits = QuotaLimits { hourly: 1, daily: 2 };
        assert!(store.try_increment("2024-02-01", "9", limits).unwrap());
        assert!(!store.try_increment("2024-02-01", "9", limits).unwrap());
        assert!(store.try_increment("2024-02-01", "10", limits).unwrap());
        assert!(!store.try_increment("2024-02-01", "11", limits).unwrap());
        assert_eq!(
            store.read_counts("2024-02-01", "11").unwrap(),
            BucketCounts { hourly: 0, daily: 2 }
        );
    }

    #[test]
    fn leads_keep_insertion_order_and_profile_on_rescrape() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.upsert_lead("porto", "Zeta", None).unwrap());
        assert!(store.upsert_lead("porto", "Alpha", Some("https://maps/a")).unwrap());
        store.set_profile("porto", "Zeta", "https://instagram.com/zeta").unwrap();
        assert!(!store.upsert_lead("porto", "Zeta", Some("https://maps/z")).unwrap());

        let leads = store.leads_for_location("porto").unwrap();
        let names: Vec<_> = leads.iter().map(|l| l.identity.as_str()).collect();
        assert_eq!(names, ["Zeta", "Alpha"]);
        assert_eq!(
            leads[0].profile_handle.as_deref(),
            Some("https://instagram.com/zeta")
        );
        assert_eq!(leads[0].listing_url.as_deref(), Some("https://maps/z"));

        let missing = store.leads_missing_profile("porto").unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].identity, "Alpha");
    }

    #[test]
    fn leads_report_messaged_state() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_lead("porto", "Zeta", None).unwrap();
        store
            .record_sent("Zeta", "porto", datetime!(2024-02-01 10:00 UTC))
            .unwrap();
        assert!(store.leads_for_location("porto").unwrap()[0].already_messaged);
    }

    #[test]
    fn set_profile_on_unknown_lead_fails() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.set_profile("porto", "Nobody", "x").is_err());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/outreach.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .record_sent("Casa Nova", "faro", datetime!(2024-02-01 10:00 UTC))
                .unwrap();
            store
                .try_increment("2024-02-01", "10", QuotaLimits::default())
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.has_been_messaged("Casa Nova").unwrap());
        assert_eq!(store.read_counts("2024-02-01", "10").unwrap().hourly, 1);
    }
}
