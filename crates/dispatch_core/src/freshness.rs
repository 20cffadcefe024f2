//! Location freshness filter.
//!
//! A pure predicate over a captain's last report and the current instant. It is
//! re-evaluated on every ranking pass and every map refresh; callers must not cache the
//! answer.

use chrono::{DateTime, Utc};

use crate::clock::{millis_between, Clock};
use crate::model::{ApprovalStatus, Captain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Live,
    Stale,
}

impl Freshness {
    pub fn is_live(self) -> bool {
        self == Freshness::Live
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessFilter {
    window_ms: i64,
}

impl FreshnessFilter {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: i64::try_from(window_ms).unwrap_or(i64::MAX),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Classify a normalized report instant. Reports older than the window are stale,
    /// and so are reports claiming to be further in the future than the window.
    pub fn classify(&self, reported: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Freshness {
        match reported {
            Some(at) => {
                let age = millis_between(at, now);
                if age > self.window_ms || age < -self.window_ms {
                    Freshness::Stale
                } else {
                    Freshness::Live
                }
            }
            None => Freshness::Stale,
        }
    }

    /// Age of a captain's last report in milliseconds, if it has a resolvable instant.
    pub fn age_ms(&self, captain: &Captain, clock: &dyn Clock) -> Option<i64> {
        captain
            .reported_at
            .and_then(|r| r.resolve(clock.origin()))
            .map(|at| millis_between(at, clock.now()))
    }

    /// Classify a captain for ranking or display. Offline, unapproved, vehicle-less or
    /// position-less captains are always stale.
    pub fn captain(&self, captain: &Captain, clock: &dyn Clock) -> Freshness {
        if !captain.online
            || captain.approval != ApprovalStatus::Approved
            || captain.vehicle.is_none()
            || captain.position.is_none()
        {
            return Freshness::Stale;
        }
        let reported = captain.reported_at.and_then(|r| r.resolve(clock.origin()));
        self.classify(reported, clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, ReportedAt};
    use crate::test_helpers::live_captain;

    #[test]
    fn twenty_second_old_report_is_stale() {
        let clock = ManualClock::fixed();
        let filter = FreshnessFilter::new(15_000);
        let mut captain = live_captain("c1", &clock);
        clock.advance_ms(20_000);

        assert_eq!(filter.captain(&captain, &clock), Freshness::Stale);

        captain.reported_at = Some(ReportedAt::wall_clock(clock.now()));
        assert_eq!(filter.captain(&captain, &clock), Freshness::Live);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let clock = ManualClock::fixed();
        let filter = FreshnessFilter::new(15_000);
        let captain = live_captain("c1", &clock);

        clock.advance_ms(15_000);
        assert_eq!(filter.captain(&captain, &clock), Freshness::Live);
        clock.advance_ms(1);
        assert_eq!(filter.captain(&captain, &clock), Freshness::Stale);
    }

    #[test]
    fn every_encoding_is_judged_on_the_same_instant() {
        let clock = ManualClock::fixed();
        let filter = FreshnessFilter::new(15_000);
        clock.advance_ms(30_000);
        // 20 seconds old in every encoding
        let old = clock.now() - chrono::Duration::seconds(20);
        let encodings = [
            ReportedAt::wall_clock(old),
            ReportedAt::EpochMillis {
                ms: old.timestamp_millis(),
            },
            ReportedAt::Monotonic { ticks_ms: 10_000 },
            ReportedAt::Deferred {
                committed_at: Some(old),
            },
        ];
        for encoding in encodings {
            let mut captain = live_captain("c1", &clock);
            captain.reported_at = Some(encoding);
            assert_eq!(filter.captain(&captain, &clock), Freshness::Stale, "{encoding:?}");
        }
    }

    #[test]
    fn missing_data_is_unconditionally_excluded() {
        let clock = ManualClock::fixed();
        let filter = FreshnessFilter::new(15_000);

        let mut offline = live_captain("c1", &clock);
        offline.online = false;
        assert_eq!(filter.captain(&offline, &clock), Freshness::Stale);

        let mut no_vehicle = live_captain("c2", &clock);
        no_vehicle.vehicle = None;
        assert_eq!(filter.captain(&no_vehicle, &clock), Freshness::Stale);

        let mut no_position = live_captain("c3", &clock);
        no_position.position = None;
        assert_eq!(filter.captain(&no_position, &clock), Freshness::Stale);

        let mut pending_write = live_captain("c4", &clock);
        pending_write.reported_at = Some(ReportedAt::Deferred { committed_at: None });
        assert_eq!(filter.captain(&pending_write, &clock), Freshness::Stale);

        let mut blocked = live_captain("c5", &clock);
        blocked.approval = ApprovalStatus::Blocked;
        assert_eq!(filter.captain(&blocked, &clock), Freshness::Stale);
    }

    #[test]
    fn far_future_reports_are_stale() {
        let clock = ManualClock::fixed();
        let filter = FreshnessFilter::new(15_000);
        let future = clock.now() + chrono::Duration::seconds(60);
        assert_eq!(filter.classify(Some(future), clock.now()), Freshness::Stale);
    }
}
