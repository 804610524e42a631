// ============================================================================
// MeterDb - Embedded Metering Store (redb)
// ============================================================================
// Durable `(identity, day) -> count` table with the atomic
// increment-if-under-cap primitive.
// Default path: ~/.paygate/meter.redb (override via PAYGATE_DB_PATH env var)
// ============================================================================

pub mod types;

pub use types::{DayStats, IncrementOutcome, MeterRecord, MeterStats, StoreError};

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::identity::DAY_FORMAT;

// Keys are `<YYYY-MM-DD>|<identity>` so one day is one contiguous range
const METERS: TableDefinition<&str, u32> = TableDefinition::new("meters");

const KEY_SEPARATOR: char = '|';

/// Authoritative per-identity daily counter
pub trait MeteringStore: Send + Sync {
    /// Non-mutating read, 0 when no record exists. Display only.
    fn peek(&self, identity: &str, day: NaiveDate) -> Result<u32, StoreError>;

    /// The only mutating operation. Must be atomic per `(identity, day)`.
    fn increment_if_under_cap(
        &self,
        identity: &str,
        day: NaiveDate,
        cap: u32,
    ) -> Result<IncrementOutcome, StoreError>;
}

/// Embedded meter database
pub struct MeterDb {
    db: Database,
    path: Option<PathBuf>,
}

impl MeterDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses PAYGATE_DB_PATH env var or ~/.paygate/meter.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            p.to_path_buf()
        } else if let Ok(env_path) = std::env::var("PAYGATE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            default_db_path()?
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }

        info!("Opening meter database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;
        Self::init(db, Some(db_path))
    }

    /// Volatile database, used by tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|e| anyhow!("Failed to create in-memory database: {}", e))?;
        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> Result<Self> {
        // Ensure the table exists so read transactions can open it
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(METERS)
                .map_err(|e| anyhow!("Failed to create meters table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        debug!("Meter database ready");
        Ok(Self { db, path })
    }

    /// Database file path, None for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// All records, or only those of one day
    pub fn list_records(&self, day: Option<NaiveDate>) -> Result<Vec<MeterRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(METERS)
            .map_err(|e| anyhow!("Failed to open meters table: {}", e))?;

        let bounds = day.map(day_bounds);
        let mut results = Vec::new();
        let iter = match &bounds {
            Some((start, end)) => table.range::<&str>(start.as_str()..end.as_str()),
            None => table.range::<&str>(..),
        }
        .map_err(|e| anyhow!("Failed to iterate meters: {}", e))?;

        for entry in iter {
            let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let (day, identity) = split_key(key.value())?;
            results.push(MeterRecord {
                identity,
                day,
                count: value.value(),
            });
        }
        Ok(results)
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Records of days strictly before `cutoff`
    pub fn records_before(&self, cutoff: NaiveDate) -> Result<Vec<MeterRecord>> {
        Ok(self
            .list_records(None)?
            .into_iter()
            .filter(|r| r.day < cutoff)
            .collect())
    }

    /// Delete records of days strictly before `cutoff`.
    /// Returns the number of records deleted.
    pub fn prune_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let upper = day_prefix(cutoff);

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let deleted;
        {
            let mut table = write_txn.open_table(METERS)
                .map_err(|e| anyhow!("Failed to open meters table: {}", e))?;

            let mut stale = Vec::new();
            for entry in table
                .range::<&str>(..upper.as_str())
                .map_err(|e| anyhow!("Failed to iterate meters: {}", e))?
            {
                let (key, _) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
                stale.push(key.value().to_string());
            }

            for key in &stale {
                table.remove(key.as_str())
                    .map_err(|e| anyhow!("Failed to remove meter {}: {}", key, e))?;
            }
            deleted = stale.len();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit prune: {}", e))?;

        if deleted > 0 {
            info!("Pruned {} meter records before {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self, cap: u32) -> Result<MeterStats> {
        let records = self.list_records(None)?;

        let mut stats = MeterStats {
            total_records: records.len(),
            cap,
            ..MeterStats::default()
        };
        for record in &records {
            stats.total_reads += u64::from(record.count);
            let day = stats
                .days
                .entry(record.day.format(DAY_FORMAT).to_string())
                .or_default();
            day.identities += 1;
            day.reads += u64::from(record.count);
            if cap > 0 && record.count >= cap {
                day.exhausted += 1;
            }
        }
        Ok(stats)
    }
}

impl MeteringStore for MeterDb {
    fn peek(&self, identity: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let key = meter_key(identity, day);

        let read_txn = self.db.begin_read()
            .map_err(|e| unavailable("begin read", e))?;
        let table = read_txn.open_table(METERS)
            .map_err(|e| unavailable("open meters table", e))?;

        let count = table
            .get(key.as_str())
            .map_err(|e| unavailable("get meter", e))?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(count)
    }

    fn increment_if_under_cap(
        &self,
        identity: &str,
        day: NaiveDate,
        cap: u32,
    ) -> Result<IncrementOutcome, StoreError> {
        let key = meter_key(identity, day);

        // redb admits one write transaction at a time, so the read, compare
        // and write below are serialized against every other increment.
        let write_txn = self.db.begin_write()
            .map_err(|e| unavailable("begin write", e))?;
        let outcome;
        {
            let mut table = write_txn.open_table(METERS)
                .map_err(|e| unavailable("open meters table", e))?;

            let current = table
                .get(key.as_str())
                .map_err(|e| unavailable("get meter", e))?
                .map(|v| v.value())
                .unwrap_or(0);

            if cap == 0 || current >= cap {
                outcome = IncrementOutcome::rejected(current);
            } else {
                let next = current + 1;
                table.insert(key.as_str(), next)
                    .map_err(|e| unavailable("insert meter", e))?;
                outcome = IncrementOutcome::accepted(next);
            }
        }

        if outcome.accepted {
            write_txn.commit().map_err(|e| unavailable("commit", e))?;
            debug!("Meter {} -> {}", key, outcome.count_after);
        } else {
            write_txn.abort().map_err(|e| unavailable("abort", e))?;
            debug!("Meter {} at cap {} ({})", key, cap, outcome.count_after);
        }
        Ok(outcome)
    }
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", context, e))
}

fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".paygate").join("meter.redb"))
}

fn day_prefix(day: NaiveDate) -> String {
    format!("{}{}", day.format(DAY_FORMAT), KEY_SEPARATOR)
}

/// Half-open key range covering every identity of one day
fn day_bounds(day: NaiveDate) -> (String, String) {
    let start = day_prefix(day);
    // '}' sorts right after '|'
    let end = format!("{}}}", day.format(DAY_FORMAT));
    (start, end)
}

fn meter_key(identity: &str, day: NaiveDate) -> String {
    format!("{}{}", day_prefix(day), identity)
}

fn split_key(key: &str) -> Result<(NaiveDate, String), StoreError> {
    let (day, identity) = key
        .split_once(KEY_SEPARATOR)
        .ok_or_else(|| StoreError::CorruptKey(key.to_string()))?;
    let day = NaiveDate::parse_from_str(day, DAY_FORMAT)
        .map_err(|_| StoreError::CorruptKey(key.to_string()))?;
    Ok((day, identity.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    #[test]
    fn test_peek_absent_is_zero() {
        let db = MeterDb::in_memory().unwrap();
        assert_eq!(db.peek("ip:10.0.0.1", day(1)).unwrap(), 0);
        assert!(db.list_records(None).unwrap().is_empty());
    }

    #[test]
    fn test_increment_counts_up_to_cap() {
        let db = MeterDb::in_memory().unwrap();
        let counts: Vec<u32> = (0..3)
            .map(|_| db.increment_if_under_cap("ip:a", day(1), 3).unwrap())
            .inspect(|o| assert!(o.accepted))
            .map(|o| o.count_after)
            .collect();
        assert_eq!(counts, vec![1, 2, 3]);

        let rejected = db.increment_if_under_cap("ip:a", day(1), 3).unwrap();
        assert_eq!(rejected, IncrementOutcome::rejected(3));
        assert_eq!(db.peek("ip:a", day(1)).unwrap(), 3);
    }

    #[test]
    fn test_zero_cap_never_creates_record() {
        let db = MeterDb::in_memory().unwrap();
        let outcome = db.increment_if_under_cap("ip:a", day(1), 0).unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.count_after, 0);
        assert!(db.list_records(None).unwrap().is_empty());
    }

    #[test]
    fn test_lowered_cap_rejects_without_mutation() {
        let db = MeterDb::in_memory().unwrap();
        for _ in 0..4 {
            db.increment_if_under_cap("ip:a", day(1), 5).unwrap();
        }
        let outcome = db.increment_if_under_cap("ip:a", day(1), 2).unwrap();
        assert_eq!(outcome, IncrementOutcome::rejected(4));
        assert_eq!(db.peek("ip:a", day(1)).unwrap(), 4);
    }

    #[test]
    fn test_day_rollover_starts_fresh() {
        let db = MeterDb::in_memory().unwrap();
        for _ in 0..2 {
            db.increment_if_under_cap("ip:a", day(1), 2).unwrap();
        }
        assert!(!db.increment_if_under_cap("ip:a", day(1), 2).unwrap().accepted);

        let next = db.increment_if_under_cap("ip:a", day(2), 2).unwrap();
        assert_eq!(next, IncrementOutcome::accepted(1));
        assert_eq!(db.peek("ip:a", day(1)).unwrap(), 2);
    }

    #[test]
    fn test_identities_are_independent() {
        let db = MeterDb::in_memory().unwrap();
        db.increment_if_under_cap("ip:a", day(1), 1).unwrap();
        assert!(!db.increment_if_under_cap("ip:a", day(1), 1).unwrap().accepted);
        assert!(db.increment_if_under_cap("ip:b", day(1), 1).unwrap().accepted);
    }

    #[test]
    fn test_concurrent_increments_accept_exactly_cap() {
        let db = Arc::new(MeterDb::in_memory().unwrap());
        let cap = 5;
        let attempts = 16;

        let handles: Vec<_> = (0..attempts)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || db.increment_if_under_cap("ip:race", day(1), cap).unwrap())
            })
            .collect();
        let outcomes: Vec<IncrementOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepted: BTreeSet<u32> = outcomes
            .iter()
            .filter(|o| o.accepted)
            .map(|o| o.count_after)
            .collect();
        assert_eq!(accepted, (1..=cap).collect::<BTreeSet<_>>());
        assert_eq!(outcomes.iter().filter(|o| o.accepted).count(), cap as usize);
        assert!(outcomes.iter().filter(|o| !o.accepted).all(|o| o.count_after == cap));
        assert_eq!(db.peek("ip:race", day(1)).unwrap(), cap);
    }

    #[test]
    fn test_list_records_by_day() {
        let db = MeterDb::in_memory().unwrap();
        db.increment_if_under_cap("ip:a", day(1), 5).unwrap();
        db.increment_if_under_cap("ip:b", day(1), 5).unwrap();
        db.increment_if_under_cap("account:x|y", day(2), 5).unwrap();

        let first = db.list_records(Some(day(1))).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.day == day(1)));

        let second = db.list_records(Some(day(2))).unwrap();
        assert_eq!(second[0].identity, "account:x|y");
        assert_eq!(db.list_records(None).unwrap().len(), 3);
    }

    #[test]
    fn test_prune_before_keeps_cutoff_day() {
        let db = MeterDb::in_memory().unwrap();
        for d in 1..=4 {
            db.increment_if_under_cap("ip:a", day(d), 5).unwrap();
        }
        assert_eq!(db.records_before(day(3)).unwrap().len(), 2);

        assert_eq!(db.prune_before(day(3)).unwrap(), 2);
        let remaining: Vec<NaiveDate> =
            db.list_records(None).unwrap().into_iter().map(|r| r.day).collect();
        assert_eq!(remaining, vec![day(3), day(4)]);
        assert_eq!(db.prune_before(day(3)).unwrap(), 0);
    }

    #[test]
    fn test_stats() {
        let db = MeterDb::in_memory().unwrap();
        for _ in 0..2 {
            db.increment_if_under_cap("ip:a", day(1), 2).unwrap();
        }
        db.increment_if_under_cap("ip:b", day(1), 2).unwrap();
        db.increment_if_under_cap("ip:a", day(2), 2).unwrap();

        let stats = db.stats(2).unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.total_reads, 4);
        let first = &stats.days["2026-05-01"];
        assert_eq!(first.identities, 2);
        assert_eq!(first.reads, 3);
        assert_eq!(first.exhausted, 1);
    }

    #[test]
    fn test_split_key_rejects_garbage() {
        assert!(split_key("no-separator").is_err());
        assert!(split_key("20260501|ip:a").is_err());
        let (d, identity) = split_key("2026-05-01|ip:a").unwrap();
        assert_eq!(d, day(1));
        assert_eq!(identity, "ip:a");
    }
}
