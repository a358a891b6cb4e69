//! SQLite downtime store.
//!
//! Holds the append-only ledger of closed downtime intervals and the raw
//! sample journal used for uptime statistics. The database runs in WAL mode
//! with a dedicated writer connection and a separate reader connection, so
//! queries never wait on the poll loop's writes and always see either the
//! pre- or post-commit state.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Interval ordering or overlap broken. Indicates a caller bug.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("SQLite error: {0}")]
    Io(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Durable downtime store.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();

        let writer = Connection::open(path)?;
        writer.busy_timeout(Duration::from_secs(5))?;
        let mode: String = writer.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!("SQLite refused WAL mode (got {}), readers may contend with writer", mode);
        }
        // Every committed interval must survive power loss.
        writer.execute_batch("PRAGMA synchronous = FULL;")?;
        writer
            .execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;

        let reader = Connection::open(path)?;
        reader.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    // --- Downtime intervals ---

    /// Append a closed downtime interval and return its ID.
    ///
    /// Rejects empty or inverted intervals and intervals starting before the
    /// end of the last recorded one.
    pub fn record_interval(&self, interval: &DowntimeInterval) -> Result<i64, StoreError> {
        if interval.end <= interval.start {
            return Err(StoreError::ConstraintViolation(format!(
                "interval end {} is not after start {}",
                interval.end, interval.start
            )));
        }

        let conn = lock(&self.writer);
        let tx = conn.unchecked_transaction()?;

        let last_end = tx
            .query_row(
                "SELECT ended_at FROM downtimes ORDER BY started_at DESC, id DESC LIMIT 1",
                [],
                |row| time_column(row, 0),
            )
            .optional()?;

        if let Some(last_end) = last_end {
            if interval.start < last_end {
                return Err(StoreError::ConstraintViolation(format!(
                    "interval starting {} overlaps previous interval ending {}",
                    interval.start, last_end
                )));
            }
        }

        tx.execute(
            "INSERT INTO downtimes (started_at, ended_at) VALUES (?1, ?2)",
            params![format_time(interval.start), format_time(interval.end)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(id)
    }

    /// Most recent closed intervals first.
    pub fn list_recent_intervals(&self, limit: usize) -> Result<Vec<DowntimeInterval>, StoreError> {
        Ok(recent_intervals(&lock(&self.reader), limit)?)
    }

    /// Total seconds of closed downtime inside `[from, to]`, clipping
    /// intervals that straddle either edge.
    #[cfg(test)]
    pub(crate) fn downtime_within(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64, StoreError> {
        Ok(closed_downtime(&lock(&self.reader), from, to)?)
    }

    /// Uptime counts, closed downtime and the newest interval for the
    /// trailing `window`, all read from one snapshot of the database.
    pub fn window_summary(&self, window: Duration, now: DateTime<Utc>) -> Result<WindowSummary, StoreError> {
        let from = window_start(now, window);
        let conn = lock(&self.reader);
        // A deferred read transaction pins one WAL snapshot for every
        // statement below.
        let tx = conn.unchecked_transaction()?;

        let summary = WindowSummary {
            uptime: sample_counts(&tx, from, now)?,
            downtime_seconds: closed_downtime(&tx, from, now)?,
            last_interval: recent_intervals(&tx, 1)?.into_iter().next(),
        };

        tx.commit()?;
        Ok(summary)
    }

    // --- Samples ---

    /// Append one sample to the journal.
    pub fn record_sample(&self, obs: &Observation) -> Result<(), StoreError> {
        let conn = lock(&self.writer);
        conn.execute(
            "INSERT INTO samples (time, reachable, latency_ns) VALUES (?1, ?2, ?3)",
            params![format_time(obs.at), obs.reachable, latency_ns(obs)],
        )?;
        Ok(())
    }

    /// Append samples in one transaction.
    #[cfg(test)]
    pub(crate) fn record_samples(&self, observations: &[Observation]) -> Result<(), StoreError> {
        if observations.is_empty() {
            return Ok(());
        }

        let conn = lock(&self.writer);
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (time, reachable, latency_ns) VALUES (?1, ?2, ?3)",
            )?;

            for obs in observations {
                stmt.execute(params![format_time(obs.at), obs.reachable, latency_ns(obs)])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Uptime over samples timestamped in `[now - window, now]`.
    ///
    /// A window without samples reports a ratio of `1.0`: no data is not
    /// treated as downtime.
    #[cfg(test)]
    pub(crate) fn uptime_ratio(&self, window: Duration, now: DateTime<Utc>) -> Result<UptimeStats, StoreError> {
        Ok(sample_counts(&lock(&self.reader), window_start(now, window), now)?)
    }

    /// The newest sample in the journal, if any.
    pub fn last_sample(&self) -> Result<Option<SampleRecord>, StoreError> {
        let conn = lock(&self.reader);
        let sample = conn
            .query_row(
                "SELECT time, reachable, latency_ns FROM samples ORDER BY time DESC, id DESC LIMIT 1",
                [],
                |row| {
                    let latency_ns: Option<f64> = row.get(2)?;
                    Ok(SampleRecord {
                        at: time_column(row, 0)?,
                        reachable: row.get(1)?,
                        latency_ms: latency_ns.map(|ns| ns / 1_000_000.0),
                    })
                },
            )
            .optional()?;
        Ok(sample)
    }

    /// Delete samples older than the cutoff. Returns the number removed.
    pub fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = lock(&self.writer);
        let removed = conn.execute(
            "DELETE FROM samples WHERE time < ?1",
            params![format_time(cutoff)],
        )?;
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        lock(&self.writer).execute_batch(sql)?;
        Ok(())
    }
}

fn recent_intervals(conn: &Connection, limit: usize) -> SqlResult<Vec<DowntimeInterval>> {
    let mut stmt = conn.prepare(
        "SELECT id, started_at, ended_at FROM downtimes ORDER BY started_at DESC, id DESC LIMIT ?1",
    )?;

    let intervals = stmt
        .query_map(params![limit as i64], |row| {
            Ok(DowntimeInterval {
                id: row.get(0)?,
                start: time_column(row, 1)?,
                end: time_column(row, 2)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    Ok(intervals)
}

fn closed_downtime(conn: &Connection, from: DateTime<Utc>, to: DateTime<Utc>) -> SqlResult<f64> {
    let mut stmt = conn.prepare(
        "SELECT started_at, ended_at FROM downtimes WHERE started_at < ?2 AND ended_at > ?1",
    )?;

    let spans = stmt
        .query_map(params![format_time(from), format_time(to)], |row| {
            Ok((time_column(row, 0)?, time_column(row, 1)?))
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    Ok(spans
        .into_iter()
        .map(|(start, end)| seconds_between(start.max(from), end.min(to)).max(0.0))
        .sum())
}

fn sample_counts(conn: &Connection, from: DateTime<Utc>, to: DateTime<Utc>) -> SqlResult<UptimeStats> {
    let (total, down): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN reachable = 0 THEN 1 ELSE 0 END), 0)
         FROM samples WHERE time >= ?1 AND time <= ?2",
        params![format_time(from), format_time(to)],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(UptimeStats::from_counts(total, down))
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    // A panic while holding the guard cannot leave a half-applied write:
    // SQLite rolls back any open transaction.
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn latency_ns(obs: &Observation) -> Option<f64> {
    obs.latency.map(|l| l.as_nanos() as f64)
}

/// Start of a trailing window ending at `now`, saturating at the earliest
/// representable time.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unparseable timestamp {:?}", s).into(),
        )
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(secs: i64, reachable: bool) -> Observation {
        if reachable {
            Observation::up(ts(secs), "8.8.8.8", Duration::from_millis(12))
        } else {
            Observation::down(ts(secs), "timeout")
        }
    }

    #[test]
    fn test_record_and_list_intervals() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let first = store.record_interval(&DowntimeInterval::new(ts(10), ts(30))).unwrap();
        let second = store.record_interval(&DowntimeInterval::new(ts(30), ts(45))).unwrap();
        let third = store.record_interval(&DowntimeInterval::new(ts(100), ts(160))).unwrap();
        assert!(first < second && second < third);

        let recent = store.list_recent_intervals(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, third);
        assert_eq!(recent[0].start, ts(100));
        assert_eq!(recent[1].id, second);
        assert_eq!(recent[1].duration_seconds(), 15.0);

        // Stored ledger is ordered and non-overlapping.
        let mut all = store.list_recent_intervals(100).unwrap();
        all.reverse();
        for pair in all.windows(2) {
            assert!(pair[0].end <= pair[1].start);
            assert!(pair[0].end > pair[0].start);
        }
    }

    #[test]
    fn test_rejects_inverted_and_empty_intervals() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let err = store.record_interval(&DowntimeInterval::new(ts(20), ts(20))).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        let err = store.record_interval(&DowntimeInterval::new(ts(30), ts(20))).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        assert!(store.list_recent_intervals(10).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_overlap_with_last_interval() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.record_interval(&DowntimeInterval::new(ts(10), ts(30))).unwrap();

        let err = store.record_interval(&DowntimeInterval::new(ts(20), ts(40))).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        let err = store.record_interval(&DowntimeInterval::new(ts(0), ts(5))).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        assert_eq!(store.list_recent_intervals(10).unwrap().len(), 1);
    }

    #[test]
    fn test_intervals_survive_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store.record_interval(&DowntimeInterval::new(ts(10), ts(30))).unwrap();
        }

        let reopened = Store::new(tmp.path()).unwrap();
        let intervals = reopened.list_recent_intervals(10).unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].start, ts(10));
        assert_eq!(intervals[0].end, ts(30));
    }

    #[test]
    fn test_uptime_ratio_without_samples_is_one() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let stats = store.uptime_ratio(Duration::from_secs(3600), ts(0)).unwrap();
        assert_eq!(stats.ratio, 1.0);
        assert_eq!(stats.sample_count, 0);
    }

    #[test]
    fn test_uptime_ratio_only_counts_window() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        // Outside the window, down.
        store.record_sample(&sample(0, false)).unwrap();
        store.record_sample(&sample(5, false)).unwrap();
        // Inside the window.
        store.record_sample(&sample(100, true)).unwrap();
        store.record_sample(&sample(110, true)).unwrap();

        let stats = store.uptime_ratio(Duration::from_secs(60), ts(110)).unwrap();
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.down_count, 0);
        assert_eq!(stats.ratio, 1.0);

        // Edges are inclusive.
        let stats = store.uptime_ratio(Duration::from_secs(105), ts(110)).unwrap();
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.down_count, 1);
    }

    #[test]
    fn test_uptime_ratio_decreases_with_down_samples() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let window = Duration::from_secs(1000);

        for i in 0..10 {
            store.record_sample(&sample(i * 10, true)).unwrap();
        }

        let mut previous = store.uptime_ratio(window, ts(500)).unwrap().ratio;
        assert_eq!(previous, 1.0);

        for i in 10..15 {
            store.record_sample(&sample(i * 10, false)).unwrap();
            let ratio = store.uptime_ratio(window, ts(500)).unwrap().ratio;
            assert!(ratio < previous);
            previous = ratio;
        }
    }

    #[test]
    fn test_uptime_ratio_full_day() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        // 8640 samples at 10s cadence over 24h, 4 of them down.
        let samples: Vec<Observation> = (0..8640)
            .map(|i| sample(i * 10, !(1000..1004).contains(&i)))
            .collect();
        store.record_samples(&samples).unwrap();

        let stats = store
            .uptime_ratio(Duration::from_secs(86_400), ts(86_390))
            .unwrap();
        assert_eq!(stats.sample_count, 8640);
        assert_eq!(stats.down_count, 4);
        assert!((stats.ratio - (1.0 - 4.0 / 8640.0)).abs() < 1e-12);
    }

    #[test]
    fn test_downtime_within_clips_edges() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.record_interval(&DowntimeInterval::new(ts(0), ts(100))).unwrap();
        store.record_interval(&DowntimeInterval::new(ts(200), ts(220))).unwrap();
        store.record_interval(&DowntimeInterval::new(ts(290), ts(400))).unwrap();

        let secs = store.downtime_within(ts(50), ts(300)).unwrap();
        assert_eq!(secs, 50.0 + 20.0 + 10.0);

        assert_eq!(store.downtime_within(ts(500), ts(600)).unwrap(), 0.0);
    }

    #[test]
    fn test_last_sample_and_retention() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert!(store.last_sample().unwrap().is_none());

        store.record_sample(&sample(0, false)).unwrap();
        store.record_sample(&sample(10, true)).unwrap();

        let last = store.last_sample().unwrap().unwrap();
        assert_eq!(last.at, ts(10));
        assert!(last.reachable);
        assert_eq!(last.latency_ms, Some(12.0));

        assert_eq!(store.delete_samples_before(ts(5)).unwrap(), 1);
        let stats = store.uptime_ratio(Duration::from_secs(3600), ts(10)).unwrap();
        assert_eq!(stats.sample_count, 1);
    }

    #[test]
    fn test_parse_db_time_formats() {
        let expected = ts(0);
        assert_eq!(parse_db_time(&format_time(expected)), Some(expected));
        assert_eq!(parse_db_time("2023-11-14 22:13:20"), Some(expected));
        assert_eq!(parse_db_time("2023-11-14T22:13:20Z"), Some(expected));
        assert_eq!(parse_db_time("yesterday"), None);
    }
}
