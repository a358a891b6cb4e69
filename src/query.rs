//! Read-only façade over the live tracker state and the store.
//!
//! Queries run concurrently with the poll loop. Status comes from one
//! tracker snapshot; store reads go through the reader connection and never
//! wait on the poll loop's writes. When the store cannot be read, the last
//! good answer for the same request is served instead of an error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::db::{seconds_between, window_start, DowntimeInterval, SampleRecord, Store, StoreError};
use crate::monitor::{SharedTracker, Status};
use crate::scheduler::StoreHealth;

/// Distinct request shapes remembered for stale answers.
const MAX_REMEMBERED: usize = 16;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStatus {
    pub status: Status,
    pub since: Option<DateTime<Utc>>,
    /// Length of the ongoing outage; `None` unless down.
    pub current_downtime_seconds: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub store_degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Up samples over all samples in the window; `1.0` without samples.
    pub uptime_ratio: f64,
    pub sample_count: i64,
    pub down_sample_count: i64,
    /// Closed and ongoing downtime clipped to the window.
    pub downtime_seconds: f64,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DowntimeView {
    pub id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl From<DowntimeInterval> for DowntimeView {
    fn from(iv: DowntimeInterval) -> Self {
        Self {
            id: iv.id,
            start: iv.start,
            end: iv.end,
            duration_seconds: iv.duration_seconds(),
        }
    }
}

#[derive(Default)]
struct LastKnown {
    stats: HashMap<u64, Stats>,
    downtimes: HashMap<usize, Vec<DowntimeView>>,
    last_sample: Option<Option<SampleRecord>>,
}

pub struct QueryService {
    tracker: SharedTracker,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    health: Arc<StoreHealth>,
    stats_window: Duration,
    last_known: Mutex<LastKnown>,
}

impl QueryService {
    pub fn new(
        tracker: SharedTracker,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        health: Arc<StoreHealth>,
        stats_window: Duration,
    ) -> Self {
        Self {
            tracker,
            store,
            clock,
            health,
            stats_window,
            last_known: Mutex::new(LastKnown::default()),
        }
    }

    /// Window used when a caller does not ask for one.
    pub fn default_window(&self) -> Duration {
        self.stats_window
    }

    pub fn current_status(&self) -> CurrentStatus {
        let snapshot = self.tracker.snapshot();
        let now = self.clock.now();

        CurrentStatus {
            status: snapshot.status,
            since: snapshot.since,
            current_downtime_seconds: snapshot
                .open
                .map(|open| seconds_between(open.start, now).max(0.0)),
            last_check: snapshot.last_check,
            detail: snapshot.last_detail,
            store_degraded: self.health.is_degraded(),
        }
    }

    /// Uptime statistics over the trailing `window`.
    pub fn stats(&self, window: Duration) -> Result<Stats, QueryError> {
        let fresh = self.read_stats(window);
        self.remember(|lk| &mut lk.stats, window.as_secs(), fresh, "stats")
    }

    fn read_stats(&self, window: Duration) -> Result<Stats, StoreError> {
        // Snapshot first: an outage closed after this point shows up in the
        // store summary and is not counted twice below.
        let snapshot = self.tracker.snapshot();
        let now = self.clock.now();
        let from = window_start(now, window);

        let summary = self.store.window_summary(window, now)?;
        let mut downtime_seconds = summary.downtime_seconds;

        if let Some(open) = snapshot.open {
            let already_closed = summary
                .last_interval
                .is_some_and(|last| last.start == open.start);
            if !already_closed {
                downtime_seconds += seconds_between(open.start.max(from), now).max(0.0);
            }
        }

        Ok(Stats {
            uptime_ratio: summary.uptime.ratio,
            sample_count: summary.uptime.sample_count,
            down_sample_count: summary.uptime.down_count,
            downtime_seconds,
            window_seconds: window.as_secs(),
        })
    }

    /// Most recent closed outages first.
    pub fn recent_downtimes(&self, limit: usize) -> Result<Vec<DowntimeView>, QueryError> {
        let fresh = self
            .store
            .list_recent_intervals(limit)
            .map(|ivs| ivs.into_iter().map(DowntimeView::from).collect());
        self.remember(|lk| &mut lk.downtimes, limit, fresh, "downtimes")
    }

    pub fn last_sample(&self) -> Result<Option<SampleRecord>, QueryError> {
        let fresh = self.store.last_sample();
        let mut last_known = self.last_known.lock().unwrap_or_else(PoisonError::into_inner);
        match fresh {
            Ok(sample) => {
                last_known.last_sample = Some(sample.clone());
                Ok(sample)
            }
            Err(e) => match &last_known.last_sample {
                Some(stale) => {
                    tracing::warn!("Serving stale last sample: {}", e);
                    Ok(stale.clone())
                }
                None => Err(e.into()),
            },
        }
    }

    /// Cache a fresh answer, or fall back to the cached one on failure.
    fn remember<K, T>(
        &self,
        slot: impl FnOnce(&mut LastKnown) -> &mut HashMap<K, T>,
        key: K,
        fresh: Result<T, StoreError>,
        what: &str,
    ) -> Result<T, QueryError>
    where
        K: Eq + Hash,
        T: Clone,
    {
        let mut last_known = self.last_known.lock().unwrap_or_else(PoisonError::into_inner);
        let cache = slot(&mut last_known);

        match fresh {
            Ok(value) => {
                if cache.len() < MAX_REMEMBERED || cache.contains_key(&key) {
                    cache.insert(key, value.clone());
                }
                Ok(value)
            }
            Err(e) => match cache.get(&key) {
                Some(stale) => {
                    tracing::warn!("Serving stale {}: {}", what, e);
                    Ok(stale.clone())
                }
                None => Err(e.into()),
            },
        }
    }
}
