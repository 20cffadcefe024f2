//! Time sources and timestamp normalization.
//!
//! Position reports reach the core with timestamps in several encodings. Everything is
//! normalized to a UTC instant here before any freshness comparison happens.

use std::time::Instant;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Source of "now" for every time-dependent decision in the core.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Instant that monotonic tick counters are measured from.
    fn origin(&self) -> DateTime<Utc>;
}

/// Wall-clock anchored at construction, advanced by a monotonic `Instant`.
#[derive(Debug)]
pub struct SystemClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.origin + elapsed
    }

    fn origin(&self) -> DateTime<Utc> {
        self.origin
    }
}

/// Clock that only moves when told to. Used by tests and scripted runs.
#[derive(Debug)]
pub struct ManualClock {
    origin: DateTime<Utc>,
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            now: Mutex::new(origin),
        }
    }

    /// Clock starting at a fixed, arbitrary instant (2024-01-01T00:00:00Z).
    pub fn fixed() -> Self {
        Self::new(Utc.timestamp_opt(1_704_067_200, 0).single().unwrap_or_default())
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock();
        *now += Duration::milliseconds(ms);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn origin(&self) -> DateTime<Utc> {
        self.origin
    }
}

/// A position report timestamp as encoded by the upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportedAt {
    /// Wall-clock instant.
    WallClock { at: DateTime<Utc> },
    /// Milliseconds since the Unix epoch.
    EpochMillis { ms: i64 },
    /// Milliseconds since the clock origin (monotonic counter).
    Monotonic { ticks_ms: u64 },
    /// Store-assigned timestamp; `None` while the write is still pending.
    Deferred { committed_at: Option<DateTime<Utc>> },
}

impl ReportedAt {
    pub fn wall_clock(at: DateTime<Utc>) -> Self {
        ReportedAt::WallClock { at }
    }

    /// Normalize to a single instant. Returns `None` when the encoding carries no
    /// resolvable instant yet.
    pub fn resolve(&self, origin: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            ReportedAt::WallClock { at } => Some(at),
            ReportedAt::EpochMillis { ms } => Utc.timestamp_millis_opt(ms).single(),
            ReportedAt::Monotonic { ticks_ms } => i64::try_from(ticks_ms)
                .ok()
                .and_then(|ms| origin.checked_add_signed(Duration::milliseconds(ms))),
            ReportedAt::Deferred { committed_at } => committed_at,
        }
    }
}

/// Milliseconds from `earlier` to `later` (negative when `earlier` is in the future).
pub fn millis_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_milliseconds()
}
