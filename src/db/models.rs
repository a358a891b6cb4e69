//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// One reachability sample produced by the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub at: DateTime<Utc>,
    pub reachable: bool,
    /// Responding host and latency, or the failure reason.
    pub detail: String,
    pub latency: Option<Duration>,
}

impl Observation {
    pub fn up(at: DateTime<Utc>, detail: impl Into<String>, latency: Duration) -> Self {
        Self {
            at,
            reachable: true,
            detail: detail.into(),
            latency: Some(latency),
        }
    }

    pub fn down(at: DateTime<Utc>, detail: impl Into<String>) -> Self {
        Self {
            at,
            reachable: false,
            detail: detail.into(),
            latency: None,
        }
    }
}

/// A closed outage. Immutable once written; `id` is 0 until persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DowntimeInterval {
    pub id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DowntimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { id: 0, start, end }
    }

    pub fn duration_seconds(&self) -> f64 {
        seconds_between(self.start, self.end)
    }
}

/// A persisted sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRecord {
    pub at: DateTime<Utc>,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
}

/// Sample counts over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UptimeStats {
    /// Fraction of up samples. `1.0` when the window holds no samples.
    pub ratio: f64,
    pub sample_count: i64,
    pub down_count: i64,
}

impl UptimeStats {
    pub fn from_counts(sample_count: i64, down_count: i64) -> Self {
        let ratio = if sample_count == 0 {
            1.0
        } else {
            (sample_count - down_count) as f64 / sample_count as f64
        };
        Self {
            ratio,
            sample_count,
            down_count,
        }
    }
}

/// Stats inputs for one trailing window, read together.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub uptime: UptimeStats,
    /// Closed downtime clipped to the window.
    pub downtime_seconds: f64,
    /// The newest closed interval, inside the window or not.
    pub last_interval: Option<DowntimeInterval>,
}

/// Fractional seconds from `from` to `to`.
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_seconds() as f64,
    }
}
