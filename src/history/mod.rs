//! Local traffic history: one row per poll cycle with the bytes moved during
//! that interval, kept in SQLite.
//!
//! The database is opened on first use. If that fails the store stays
//! unavailable for the rest of the process: writes become no-ops and reads
//! return `None`/`false`. Persistence trouble never reaches the caller as an
//! error.

pub mod window;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Local, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use self::window::TimeWindow;

pub use self::writer::HistoryWriter;

pub const DATABASE_FILE_NAME: &str = "network_usage.db";
const APP_DIR_NAME: &str = "netmeter";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        interface TEXT NOT NULL,
        bytes_down INTEGER NOT NULL,
        bytes_up INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_usage_ts ON usage(timestamp);
";

/// A persisted interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    /// Unix seconds, UTC.
    pub timestamp: i64,
    pub source: String,
    pub bytes_down: u64,
    pub bytes_up: u64,
}

impl HistoryRecord {
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// A record waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub bytes_down: u64,
    pub bytes_up: u64,
}

impl NewRecord {
    pub fn now(source: impl Into<String>, bytes_down: u64, bytes_up: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            bytes_down,
            bytes_up,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_down == 0 && self.bytes_up == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub bytes_down: u64,
    pub bytes_up: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Uninitialized,
    Ready,
    Unavailable,
    Closed,
}

enum StoreState {
    Uninitialized,
    Ready(Connection),
    Unavailable,
    Closed,
}

#[derive(Debug, Clone)]
enum StoreLocation {
    /// `network_usage.db` under the per-user local data directory.
    UserData,
    File(PathBuf),
    Memory,
    Disabled,
}

pub struct HistoryStore {
    location: StoreLocation,
    state: Mutex<StoreState>,
}

fn to_column(bytes: u64) -> Result<i64, StoreError> {
    i64::try_from(bytes).map_err(|_| StoreError::Overflow(bytes))
}

fn from_column(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Empty filters mean "all sources".
fn normalize_filter(filter: Option<&str>) -> Option<&str> {
    filter.filter(|f| !f.is_empty())
}

impl HistoryStore {
    /// Store backed by `path`, or by the per-user default location when
    /// `path` is `None`. Nothing is opened until the first call that needs
    /// the database.
    pub fn new(path: Option<PathBuf>) -> Self {
        let location = match path {
            Some(path) => StoreLocation::File(path),
            None => StoreLocation::UserData,
        };
        Self::with_location(location)
    }

    pub fn open_in_memory() -> Self {
        Self::with_location(StoreLocation::Memory)
    }

    /// A store that never persists anything.
    pub fn unavailable() -> Self {
        Self::with_location(StoreLocation::Disabled)
    }

    fn with_location(location: StoreLocation) -> Self {
        Self {
            location,
            state: Mutex::new(StoreState::Uninitialized),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(APP_DIR_NAME).join(DATABASE_FILE_NAME))
    }

    pub fn status(&self) -> StoreStatus {
        match *self.lock_state() {
            StoreState::Uninitialized => StoreStatus::Uninitialized,
            StoreState::Ready(_) => StoreStatus::Ready,
            StoreState::Unavailable => StoreStatus::Unavailable,
            StoreState::Closed => StoreStatus::Closed,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let conn = match &self.location {
            StoreLocation::Memory => Connection::open_in_memory()?,
            StoreLocation::Disabled => return Err(StoreError::Unavailable),
            StoreLocation::File(path) => Self::open_file(path)?,
            StoreLocation::UserData => {
                let path = Self::default_path().ok_or(StoreError::NoDataDir)?;
                Self::open_file(&path)?
            }
        };
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn open_file(path: &Path) -> Result<Connection, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "Opening traffic history database.");
        Ok(Connection::open(path)?)
    }

    /// Runs `op` against the database, opening it on first use.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.lock_state();
        if matches!(*state, StoreState::Uninitialized) {
            *state = match self.open_connection() {
                Ok(conn) => {
                    debug!("Traffic history database ready.");
                    StoreState::Ready(conn)
                }
                Err(e) => {
                    error!(error = %e, "Traffic history unavailable, history will not be recorded.");
                    StoreState::Unavailable
                }
            };
        }
        match &mut *state {
            StoreState::Ready(conn) => op(conn),
            _ => Err(StoreError::Unavailable),
        }
    }

    /// Records the bytes moved during one interval. Zero/zero is never stored.
    pub fn append_sample(&self, source: &str, bytes_down: u64, bytes_up: u64) -> bool {
        self.append_record(&NewRecord::now(source, bytes_down, bytes_up))
    }

    pub fn append_sample_at(
        &self,
        timestamp: DateTime<Utc>,
        source: &str,
        bytes_down: u64,
        bytes_up: u64,
    ) -> bool {
        self.append_record(&NewRecord {
            timestamp,
            source: source.to_string(),
            bytes_down,
            bytes_up,
        })
    }

    pub fn append_record(&self, record: &NewRecord) -> bool {
        self.append_records(std::slice::from_ref(record)) == 1
    }

    /// Writes a batch in one transaction and returns how many rows were
    /// stored. Empty intervals and counts too large for the column are
    /// skipped.
    pub fn append_records(&self, records: &[NewRecord]) -> usize {
        if records.iter().all(NewRecord::is_empty) {
            return 0;
        }
        let result = self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO usage (timestamp, interface, bytes_down, bytes_up) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for record in records.iter().filter(|r| !r.is_empty()) {
                    let (down, up) = match (to_column(record.bytes_down), to_column(record.bytes_up)) {
                        (Ok(down), Ok(up)) => (down, up),
                        (Err(e), _) | (_, Err(e)) => {
                            warn!(error = %e, source = %record.source, "Skipping history record.");
                            continue;
                        }
                    };
                    stmt.execute(params![record.timestamp.timestamp(), record.source, down, up])?;
                    written += 1;
                }
            }
            tx.commit()?;
            Ok(written)
        });
        match result {
            Ok(written) => written,
            Err(StoreError::Unavailable) => 0,
            Err(e) => {
                warn!(error = %e, records = records.len(), "Failed to write traffic history.");
                0
            }
        }
    }

    pub fn totals_today(&self, filter: Option<&str>) -> Option<TrafficTotals> {
        self.totals_in(window::day_of(&Local::now()), filter)
    }

    pub fn totals_this_month(&self, filter: Option<&str>) -> Option<TrafficTotals> {
        self.totals_in(window::month_of(&Local::now()), filter)
    }

    /// Sums of both directions over `window`, optionally for one source.
    pub fn totals_in(&self, window: TimeWindow, filter: Option<&str>) -> Option<TrafficTotals> {
        let filter = normalize_filter(filter);
        let result = self.with_connection(|conn| {
            let (down, up): (i64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(bytes_down), 0), COALESCE(SUM(bytes_up), 0)
                 FROM usage
                 WHERE timestamp >= ?1 AND timestamp < ?2 AND (?3 IS NULL OR interface = ?3)",
                params![window.start, window.end, filter],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(TrafficTotals {
                bytes_down: from_column(down),
                bytes_up: from_column(up),
            })
        });
        self.read_outcome(result, "totals")
    }

    /// Up to `limit` records, newest first.
    pub fn recent_samples(
        &self,
        limit: usize,
        filter: Option<&str>,
        only_today: bool,
    ) -> Option<Vec<HistoryRecord>> {
        let today = only_today.then(|| window::day_of(&Local::now()));
        self.recent_samples_in(limit, filter, today)
    }

    pub fn recent_samples_in(
        &self,
        limit: usize,
        filter: Option<&str>,
        within: Option<TimeWindow>,
    ) -> Option<Vec<HistoryRecord>> {
        let filter = normalize_filter(filter);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let (start, end) = match within {
            Some(w) => (Some(w.start), Some(w.end)),
            None => (None, None),
        };
        let result = self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, timestamp, interface, bytes_down, bytes_up
                 FROM usage
                 WHERE (?1 IS NULL OR interface = ?1)
                   AND (?2 IS NULL OR timestamp >= ?2)
                   AND (?3 IS NULL OR timestamp < ?3)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(params![filter, start, end, limit], |row| {
                    Ok(HistoryRecord {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        source: row.get(2)?,
                        bytes_down: from_column(row.get(3)?),
                        bytes_up: from_column(row.get(4)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        });
        self.read_outcome(result, "recent samples")
    }

    pub fn record_count(&self) -> Option<u64> {
        let result = self.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM usage", [], |row| row.get(0))?;
            Ok(from_column(count))
        });
        self.read_outcome(result, "record count")
    }

    /// Timestamp of the oldest record, if any.
    pub fn oldest_timestamp(&self) -> Option<i64> {
        let result = self.with_connection(|conn| {
            let ts: Option<i64> = conn
                .query_row("SELECT MIN(timestamp) FROM usage", [], |row| row.get(0))
                .optional()?
                .flatten();
            Ok(ts)
        });
        self.read_outcome(result, "oldest timestamp").flatten()
    }

    fn read_outcome<T>(&self, result: Result<T, StoreError>, what: &str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(StoreError::Unavailable) => None,
            Err(e) => {
                warn!(error = %e, query = what, "Traffic history query failed.");
                None
            }
        }
    }

    /// Keeps the last `days` days. Zero or negative deletes everything.
    pub fn trim_to_recent_days(&self, days: i64) -> bool {
        if days <= 0 {
            return self.delete_all();
        }
        let cutoff = Utc::now() - Duration::seconds(days.saturating_mul(86_400));
        self.trim_older_than(cutoff)
    }

    /// Deletes every record stamped before `cutoff`.
    pub fn trim_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        let result = self.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM usage WHERE timestamp < ?1",
                params![cutoff.timestamp()],
            )?)
        });
        self.delete_outcome(result, "trim")
    }

    pub fn delete_all(&self) -> bool {
        let result = self.with_connection(|conn| Ok(conn.execute("DELETE FROM usage", [])?));
        self.delete_outcome(result, "delete all")
    }

    fn delete_outcome(&self, result: Result<usize, StoreError>, what: &str) -> bool {
        match result {
            Ok(removed) => {
                info!(removed, operation = what, "Traffic history trimmed.");
                true
            }
            Err(StoreError::Unavailable) => false,
            Err(e) => {
                warn!(error = %e, operation = what, "Failed to delete traffic history.");
                false
            }
        }
    }

    /// Closes the database. Later calls behave as if the store were
    /// unavailable.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if let StoreState::Ready(_) = *state {
            info!("Closing traffic history database.");
        }
        *state = StoreState::Closed;
    }
}
