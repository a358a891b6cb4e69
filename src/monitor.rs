//! Reachability state machine.
//!
//! Turns the stream of observations into UP/DOWN transitions and emits a
//! `DowntimeInterval` each time an outage ends. Every down sample is
//! accounted for: there is no debouncing, so a single failed probe followed
//! by a success still yields a (short) interval.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::db::{DowntimeInterval, Observation};

/// Reachability of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No observation yet.
    Unknown,
    Up,
    Down,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown => write!(f, "unknown"),
            Status::Up => write!(f, "up"),
            Status::Down => write!(f, "down"),
        }
    }
}

/// An outage whose end is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenInterval {
    pub start: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("observation at {got} precedes previous observation at {previous}")]
    OutOfOrderObservation {
        previous: DateTime<Utc>,
        got: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unknown,
    Up,
    Down(OpenInterval),
}

/// Consistent copy of the tracker state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSnapshot {
    pub status: Status,
    /// Start of the current status. `None` only while unknown.
    pub since: Option<DateTime<Utc>>,
    pub open: Option<OpenInterval>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_detail: Option<String>,
}

#[derive(Debug)]
pub struct StateTracker {
    state: State,
    since: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
    last_detail: Option<String>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    /// A tracker that has seen nothing. This is also the state after a
    /// restart: an outage that was open when the process died is not
    /// reconstructed.
    pub fn new() -> Self {
        Self {
            state: State::Unknown,
            since: None,
            last_check: None,
            last_detail: None,
        }
    }

    pub fn status(&self) -> Status {
        match self.state {
            State::Unknown => Status::Unknown,
            State::Up => Status::Up,
            State::Down(_) => Status::Down,
        }
    }

    pub fn open_interval(&self) -> Option<OpenInterval> {
        match self.state {
            State::Down(open) => Some(open),
            _ => None,
        }
    }

    /// Feed one observation.
    ///
    /// Returns the completed interval when a DOWN→UP transition closes an
    /// outage; the caller is responsible for persisting it. Observations must
    /// arrive in non-decreasing time order; an earlier one is rejected and
    /// leaves the tracker untouched.
    pub fn observe(&mut self, obs: &Observation) -> Result<Option<DowntimeInterval>, TrackerError> {
        if let Some(previous) = self.last_check {
            if obs.at < previous {
                return Err(TrackerError::OutOfOrderObservation {
                    previous,
                    got: obs.at,
                });
            }
        }

        self.last_check = Some(obs.at);
        self.last_detail = Some(obs.detail.clone());

        let mut closed = None;
        let next = match (self.state, obs.reachable) {
            (State::Unknown, true) => State::Up,
            (State::Unknown, false) | (State::Up, false) => State::Down(OpenInterval { start: obs.at }),
            (State::Up, true) => State::Up,
            (State::Down(open), false) => State::Down(open),
            (State::Down(open), true) => {
                // A zero-length outage cannot satisfy end > start; the
                // status still flips back to UP.
                if obs.at > open.start {
                    closed = Some(DowntimeInterval::new(open.start, obs.at));
                }
                State::Up
            }
        };

        if next != self.state {
            self.since = Some(obs.at);
            self.state = next;
        }

        Ok(closed)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            status: self.status(),
            since: self.since,
            open: self.open_interval(),
            last_check: self.last_check,
            last_detail: self.last_detail.clone(),
        }
    }
}

/// Result of feeding one observation through a [`SharedTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub from: Status,
    pub to: Status,
    pub closed: Option<DowntimeInterval>,
}

impl Step {
    pub fn is_transition(&self) -> bool {
        self.from != self.to
    }
}

/// Tracker shared between the poll loop (sole writer) and queries.
///
/// Readers copy a whole snapshot under the read lock, so they never see a
/// status without its matching open interval.
#[derive(Debug, Clone, Default)]
pub struct SharedTracker {
    inner: Arc<RwLock<StateTracker>>,
}

impl SharedTracker {
    pub fn new(tracker: StateTracker) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tracker)),
        }
    }

    pub fn observe(&self, obs: &Observation) -> Result<Step, TrackerError> {
        let mut tracker = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let from = tracker.status();
        let closed = tracker.observe(obs)?;
        Ok(Step {
            from,
            to: tracker.status(),
            closed,
        })
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn obs(secs: i64, reachable: bool) -> Observation {
        if reachable {
            Observation::up(ts(secs), "8.8.8.8", Duration::from_millis(10))
        } else {
            Observation::down(ts(secs), "timed out")
        }
    }

    #[test]
    fn test_outage_scenario() {
        let mut tracker = StateTracker::new();

        assert_eq!(tracker.observe(&obs(0, true)).unwrap(), None);
        assert_eq!(tracker.status(), Status::Up);
        assert_eq!(tracker.observe(&obs(10, false)).unwrap(), None);
        assert_eq!(tracker.open_interval(), Some(OpenInterval { start: ts(10) }));
        assert_eq!(tracker.observe(&obs(20, false)).unwrap(), None);

        let closed = tracker.observe(&obs(30, true)).unwrap().unwrap();
        assert_eq!(closed.start, ts(10));
        assert_eq!(closed.end, ts(30));
        assert_eq!(closed.duration_seconds(), 20.0);
        assert_eq!(tracker.status(), Status::Up);
        assert_eq!(tracker.open_interval(), None);
    }

    #[test]
    fn test_first_observation_down_opens_interval() {
        let mut tracker = StateTracker::new();
        assert_eq!(tracker.status(), Status::Unknown);
        assert_eq!(tracker.snapshot().since, None);

        assert_eq!(tracker.observe(&obs(5, false)).unwrap(), None);
        assert_eq!(tracker.status(), Status::Down);
        assert_eq!(tracker.open_interval(), Some(OpenInterval { start: ts(5) }));
        assert_eq!(tracker.snapshot().since, Some(ts(5)));
    }

    #[test]
    fn test_repeated_up_is_not_a_transition() {
        let mut tracker = StateTracker::new();
        tracker.observe(&obs(0, true)).unwrap();
        assert_eq!(tracker.observe(&obs(0, true)).unwrap(), None);
        assert_eq!(tracker.observe(&obs(10, true)).unwrap(), None);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.status, Status::Up);
        assert_eq!(snapshot.since, Some(ts(0)));
        assert_eq!(snapshot.last_check, Some(ts(10)));
    }

    #[test]
    fn test_single_failure_yields_short_interval() {
        let mut tracker = StateTracker::new();
        tracker.observe(&obs(0, true)).unwrap();
        tracker.observe(&obs(10, false)).unwrap();
        let closed = tracker.observe(&obs(11, true)).unwrap().unwrap();
        assert_eq!(closed.duration_seconds(), 1.0);
    }

    #[test]
    fn test_zero_length_outage_is_not_emitted() {
        let mut tracker = StateTracker::new();
        tracker.observe(&obs(10, false)).unwrap();
        assert_eq!(tracker.observe(&obs(10, true)).unwrap(), None);
        assert_eq!(tracker.status(), Status::Up);
    }

    #[test]
    fn test_out_of_order_observation_rejected() {
        let mut tracker = StateTracker::new();
        tracker.observe(&obs(10, false)).unwrap();

        let err = tracker.observe(&obs(5, true)).unwrap_err();
        assert_eq!(
            err,
            TrackerError::OutOfOrderObservation {
                previous: ts(10),
                got: ts(5)
            }
        );
        // State is unchanged.
        assert_eq!(tracker.status(), Status::Down);
        assert_eq!(tracker.snapshot().last_check, Some(ts(10)));
    }

    #[test]
    fn test_interval_count_matches_recoveries() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let mut tracker = StateTracker::new();
            let mut recoveries = 0;
            let mut intervals = Vec::new();
            let mut previous: Option<bool> = None;

            for i in 0..200 {
                let reachable = rng.gen_bool(0.6);
                if previous == Some(false) && reachable {
                    recoveries += 1;
                }
                previous = Some(reachable);

                if let Some(iv) = tracker.observe(&obs(i * 10, reachable)).unwrap() {
                    intervals.push(iv);
                }
            }

            assert_eq!(intervals.len(), recoveries);
            for iv in &intervals {
                assert!(iv.end > iv.start);
            }
            for pair in intervals.windows(2) {
                assert!(pair[0].end <= pair[1].start);
            }
        }
    }

    #[test]
    fn test_shared_tracker_reports_steps() {
        let shared = SharedTracker::default();

        let step = shared.observe(&obs(0, true)).unwrap();
        assert_eq!((step.from, step.to), (Status::Unknown, Status::Up));
        assert!(step.is_transition());

        let step = shared.observe(&obs(10, true)).unwrap();
        assert!(!step.is_transition());

        shared.observe(&obs(20, false)).unwrap();
        let step = shared.observe(&obs(30, true)).unwrap();
        assert_eq!(step.closed, Some(DowntimeInterval::new(ts(20), ts(30))));
    }

    #[test]
    fn test_concurrent_snapshots_are_never_torn() {
        let shared = SharedTracker::default();
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let snap = shared.snapshot();
                        match snap.status {
                            Status::Unknown => {
                                assert!(snap.since.is_none() && snap.open.is_none());
                            }
                            Status::Up => {
                                assert!(snap.since.is_some() && snap.open.is_none());
                            }
                            Status::Down => {
                                let open = snap.open.expect("down without open interval");
                                assert_eq!(snap.since, Some(open.start));
                            }
                        }
                    }
                })
            })
            .collect();

        for i in 0..20_000 {
            shared.observe(&obs(i, i % 3 != 0)).unwrap();
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
