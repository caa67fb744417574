//! Durable storage: jobs, canonical inspection records, webhook
//! subscriptions.
//!
//! All access goes through one SQLite connection guarded by a mutex; per-job
//! state transitions are therefore serialized, which is what the lease
//! discipline relies on.

pub mod error;
pub mod job_repo;
pub mod record_repo;
pub mod subscription_repo;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub use error::StoreError;
pub use job_repo::{CancelOutcome, FailOutcome, JobFilter, JobStore, NewJob};
pub use record_repo::{RecordRepo, StoredInspection};
pub use subscription_repo::{NewSubscription, Subscription, SubscriptionRepo};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.apply_schema()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.apply_schema()?;
        Ok(db)
    }

    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("database lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        f(&mut conn)
    }

    fn apply_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    tenant TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    locator TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    state TEXT NOT NULL DEFAULT 'queued',
                    progress INTEGER NOT NULL DEFAULT 0,
                    stage TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 3,
                    submitted_at TEXT NOT NULL,
                    first_started_at TEXT,
                    last_started_at TEXT,
                    finished_at TEXT,
                    next_attempt_at TEXT,
                    lease_expires_at TEXT,
                    worker_id TEXT,
                    result_json TEXT,
                    error_code TEXT,
                    error_message TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
                CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant);

                CREATE TABLE IF NOT EXISTS inspections (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL UNIQUE,
                    tenant TEXT NOT NULL,
                    property_json TEXT NOT NULL,
                    inspector_json TEXT NOT NULL,
                    findings_count INTEGER NOT NULL,
                    critical_findings INTEGER NOT NULL,
                    major_findings INTEGER NOT NULL,
                    minor_findings INTEGER NOT NULL,
                    informational_findings INTEGER NOT NULL,
                    estimated_cost REAL NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS findings (
                    id TEXT PRIMARY KEY,
                    inspection_id TEXT NOT NULL REFERENCES inspections(id) ON DELETE CASCADE,
                    category TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL,
                    location TEXT,
                    recommendation TEXT,
                    estimated_cost REAL,
                    priority INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_findings_inspection
                    ON findings(inspection_id);

                CREATE TABLE IF NOT EXISTS subscriptions (
                    id TEXT PRIMARY KEY,
                    tenant TEXT NOT NULL,
                    url TEXT NOT NULL,
                    events TEXT NOT NULL,
                    secret TEXT NOT NULL,
                    description TEXT,
                    active INTEGER NOT NULL DEFAULT 1,
                    total_deliveries INTEGER NOT NULL DEFAULT 0,
                    succeeded_deliveries INTEGER NOT NULL DEFAULT 0,
                    failed_deliveries INTEGER NOT NULL DEFAULT 0,
                    last_triggered_at TEXT,
                    created_at TEXT NOT NULL
                );",
            )?;
            Ok(())
        })
    }
}

/// Fixed-width RFC 3339 timestamp so lexicographic SQL comparisons agree
/// with chronological order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_in_memory_applies_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_ts_roundtrip_and_ordering() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1);

        assert_eq!(parse_ts(&ts(early)), Some(early));
        // Fixed-width encoding keeps string order == time order.
        assert!(ts(early) < ts(late));
    }
}
