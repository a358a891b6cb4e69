//! Time source used by the monitor.
//!
//! Business logic never calls `Utc::now()` directly so tests can drive
//! timestamps deterministically.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Source of wall-clock timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall-clock steps back of up to this many seconds are treated as drift.
const STEP_TOLERANCE_SECS: i64 = 1;

#[derive(Debug)]
struct LastReading {
    at: DateTime<Utc>,
    taken: Instant,
    behind: bool,
}

/// Wall clock that never goes backwards.
///
/// When the wall clock steps back (NTP correction, manual change), time keeps
/// advancing from the last reading at the rate of the monotonic clock until
/// the wall clock overtakes it again.
#[derive(Debug)]
pub struct MonotonicClock<C> {
    inner: C,
    last: Mutex<Option<LastReading>>,
}

impl<C: Clock> MonotonicClock<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            last: Mutex::new(None),
        }
    }
}

impl<C: Clock> Clock for MonotonicClock<C> {
    fn now(&self) -> DateTime<Utc> {
        let wall = self.inner.now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let (at, behind) = match last.as_ref() {
            None => (wall, false),
            Some(prev) => {
                let expected = chrono::Duration::from_std(prev.taken.elapsed())
                    .ok()
                    .and_then(|elapsed| prev.at.checked_add_signed(elapsed))
                    .unwrap_or(prev.at);
                if wall + chrono::Duration::seconds(STEP_TOLERANCE_SECS) < expected {
                    if !prev.behind {
                        tracing::warn!(
                            "Wall clock stepped back to {} (expected about {}); holding time monotonic",
                            wall,
                            expected
                        );
                    }
                    (expected, true)
                } else {
                    if prev.behind {
                        tracing::info!("Wall clock caught up at {}", wall);
                    }
                    (wall.max(prev.at), false)
                }
            }
        };

        *last = Some(LastReading {
            at,
            taken: Instant::now(),
            behind,
        });
        at
    }
}

#[cfg(test)]
pub use manual::ManualClock;
