//! Poll loop driving the probe, the state tracker and the store.

mod retention;

pub use retention::*;

use crate::clock::Clock;
use crate::config::RuntimeSettings;
use crate::db::{DowntimeInterval, Observation, Store, StoreError};
use crate::monitor::{SharedTracker, Status};
use crate::probe::{probe_deadline, ProbeError, ProbeSource, Reply};

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Closed intervals kept in memory while the store is failing.
const MAX_BACKLOG: usize = 1024;

/// Store write health, shared with the query side so the API can raise the
/// alarm.
#[derive(Debug, Default)]
pub struct StoreHealth {
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl StoreHealth {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!("Store recovered, persistence resumed");
        }
    }

    fn record_failure(&self, threshold: u32, err: &StoreError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= threshold && !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::error!(
                "ALARM: store failed {} times in a row ({}); monitoring continues in memory only",
                failures,
                err
            );
        }
    }
}

/// The single monitoring task. Ticks never overlap: each tick's sample and
/// interval writes finish before the next probe starts.
pub struct PollLoop {
    probe: Arc<dyn ProbeSource>,
    tracker: SharedTracker,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    health: Arc<StoreHealth>,
    settings: watch::Receiver<RuntimeSettings>,
    degraded_after: u32,
    backlog: VecDeque<DowntimeInterval>,
    last_at: Option<DateTime<Utc>>,
}

impl PollLoop {
    pub fn new(
        probe: Arc<dyn ProbeSource>,
        tracker: SharedTracker,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        health: Arc<StoreHealth>,
        settings: watch::Receiver<RuntimeSettings>,
        degraded_after: u32,
    ) -> Self {
        Self {
            probe,
            tracker,
            store,
            clock,
            health,
            settings,
            degraded_after: degraded_after.max(1),
            backlog: VecDeque::new(),
            last_at: None,
        }
    }

    /// Run until `stop` fires. An in-flight probe is abandoned and an open
    /// outage stays open; it is not written on shutdown.
    pub async fn run(mut self, mut stop: broadcast::Receiver<()>) {
        let mut settings = self.settings.borrow_and_update().clone();
        let mut settings_open = true;
        let mut ticker = new_ticker(settings.poll_interval(), Instant::now());

        tracing::info!(
            "Poll loop started: {} probe of {:?} every {}s (timeout {}s)",
            settings.probe_kind,
            settings.targets,
            settings.poll_interval,
            settings.probe_timeout
        );

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                changed = self.settings.changed(), if settings_open => {
                    if changed.is_err() {
                        settings_open = false;
                        continue;
                    }
                    let next = self.settings.borrow_and_update().clone();
                    if next.poll_interval != settings.poll_interval {
                        tracing::info!("Poll interval changed to {}s", next.poll_interval);
                        ticker = new_ticker(next.poll_interval(), Instant::now() + next.poll_interval());
                    }
                    settings = next;
                }
                _ = ticker.tick() => {
                    self.flush_backlog();
                    let at = self.timestamp();
                    let outcome = tokio::select! {
                        _ = stop.recv() => break,
                        outcome = probe_with_deadline(self.probe.as_ref(), &settings) => outcome,
                    };
                    self.handle(observation(at, outcome));
                }
            }
        }

        if let Some(open) = self.tracker.snapshot().open {
            tracing::warn!("Shutting down during an outage that started {}; it will not be recorded", open.start);
        }
        if !self.backlog.is_empty() {
            tracing::error!("Shutting down with {} unpersisted downtime intervals", self.backlog.len());
        }
        tracing::info!("Poll loop stopped");
    }

    /// One full tick without waiting on the ticker.
    #[cfg(test)]
    pub(crate) async fn tick_once(&mut self) {
        let settings = self.settings.borrow().clone();
        self.flush_backlog();
        let at = self.timestamp();
        let outcome = probe_with_deadline(self.probe.as_ref(), &settings).await;
        self.handle(observation(at, outcome));
    }

    #[cfg(test)]
    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Tick time, never earlier than the previous tick's. The tracker
    /// rejects observations that go back in time.
    fn timestamp(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let at = match self.last_at {
            Some(last) if now < last => {
                tracing::warn!("Clock went back from {} to {}; using {}", last, now, last);
                last
            }
            _ => now,
        };
        self.last_at = Some(at);
        at
    }

    fn handle(&mut self, obs: Observation) {
        let step = match self.tracker.observe(&obs) {
            Ok(step) => step,
            Err(e) => {
                tracing::error!("Dropping observation: {}", e);
                return;
            }
        };

        if step.is_transition() {
            match step.to {
                Status::Down => tracing::warn!("Target DOWN at {}: {}", obs.at, obs.detail),
                Status::Up => tracing::info!("Target UP at {}: {}", obs.at, obs.detail),
                Status::Unknown => {}
            }
        } else {
            tracing::debug!("Target still {}: {}", step.to, obs.detail);
        }

        match self.store.record_sample(&obs) {
            // Intervals still queued keep the alarm raised.
            Ok(()) if self.backlog.is_empty() => self.health.record_success(),
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to record sample: {}", e);
                self.health.record_failure(self.degraded_after, &e);
            }
        }

        if let Some(interval) = step.closed {
            if self.backlog.len() >= MAX_BACKLOG {
                if let Some(lost) = self.backlog.pop_front() {
                    tracing::error!(
                        "Downtime backlog full, dropping interval {} - {}",
                        lost.start,
                        lost.end
                    );
                }
            }
            self.backlog.push_back(interval);
            self.flush_backlog();
        }
    }

    /// Persist queued intervals in order, stopping at the first I/O failure.
    fn flush_backlog(&mut self) {
        while let Some(interval) = self.backlog.front().copied() {
            match self.store.record_interval(&interval) {
                Ok(id) => {
                    tracing::info!(
                        "Recorded downtime #{}: {} - {} ({:.1}s)",
                        id,
                        interval.start,
                        interval.end,
                        interval.duration_seconds()
                    );
                    self.backlog.pop_front();
                    if self.backlog.is_empty() {
                        self.health.record_success();
                    }
                }
                Err(StoreError::ConstraintViolation(msg)) => {
                    tracing::error!("Discarding downtime {} - {}: {}", interval.start, interval.end, msg);
                    self.backlog.pop_front();
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to record downtime {} - {} ({} queued): {}",
                        interval.start,
                        interval.end,
                        self.backlog.len(),
                        e
                    );
                    self.health.record_failure(self.degraded_after, &e);
                    break;
                }
            }
        }
    }
}

fn new_ticker(period: Duration, start: Instant) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    // A probe that overruns the period is followed immediately by the next.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn probe_with_deadline(probe: &dyn ProbeSource, settings: &RuntimeSettings) -> Result<Reply, ProbeError> {
    let deadline = probe_deadline(settings);
    tokio::time::timeout(deadline, probe.probe(settings))
        .await
        .unwrap_or(Err(ProbeError::Timeout(deadline)))
}

/// Any probe failure, timeouts included, is an unreachable sample.
fn observation(at: DateTime<Utc>, outcome: Result<Reply, ProbeError>) -> Observation {
    match outcome {
        Ok(reply) => {
            let detail = format!(
                "{} replied in {:.1} ms",
                reply.host,
                reply.latency.as_secs_f64() * 1000.0
            );
            Observation::up(at, detail, reply.latency)
        }
        Err(e) => Observation::down(at, e.to_string()),
    }
}
