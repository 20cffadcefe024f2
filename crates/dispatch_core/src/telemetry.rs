//! Telemetry / KPIs: dispatch counters and completed-ride records.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::millis_between;
use crate::model::{CaptainId, Ride, RideId, ServiceClass};

/// One completed ride, recorded at the `COMPLETED` transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedRideRecord {
    pub ride_id: RideId,
    pub captain_id: CaptainId,
    pub service_class: ServiceClass,
    pub fare: f64,
    pub requested_at: DateTime<Utc>,
    pub assigned_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CompletedRideRecord {
    /// Build a record from a completed ride; `None` if any lifecycle stamp is missing.
    pub fn from_ride(ride: &Ride) -> Option<Self> {
        let stamps = &ride.timestamps;
        Some(Self {
            ride_id: ride.id,
            captain_id: ride.captain.clone()?,
            service_class: ride.request.service_class,
            fare: ride.final_fare?,
            requested_at: stamps.requested_at?,
            assigned_at: stamps.assigned_at?,
            started_at: stamps.started_at?,
            completed_at: stamps.completed_at?,
        })
    }

    /// Time from request to captain acceptance.
    pub fn time_to_match_ms(&self) -> i64 {
        millis_between(self.requested_at, self.assigned_at).max(0)
    }

    /// Time from acceptance to verified pickup.
    pub fn time_to_pickup_ms(&self) -> i64 {
        millis_between(self.assigned_at, self.started_at).max(0)
    }

    /// Time from pickup to trip end.
    pub fn trip_duration_ms(&self) -> i64 {
        millis_between(self.started_at, self.completed_at).max(0)
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounts {
    pub requests: u64,
    pub offers_sent: u64,
    pub offers_accepted: u64,
    pub offers_declined: u64,
    pub offers_expired: u64,
    pub offer_conflicts: u64,
    pub unmatched_requests: u64,
    pub rides_completed: u64,
    pub rides_cancelled: u64,
    pub verification_failures: u64,
    pub auto_cancelled: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchTelemetry {
    pub counts: DispatchCounts,
    pub completed_rides: Vec<CompletedRideRecord>,
}

impl DispatchTelemetry {
    pub fn record_completion(&mut self, ride: &Ride) {
        self.counts.rides_completed += 1;
        if let Some(record) = CompletedRideRecord::from_ride(ride) {
            self.completed_rides.push(record);
        }
    }

    /// Offer acceptance rate over resolved offers, `None` before any resolution.
    pub fn acceptance_rate(&self) -> Option<f64> {
        let c = &self.counts;
        let resolved = c.offers_accepted + c.offers_declined + c.offers_expired;
        (resolved > 0).then(|| c.offers_accepted as f64 / resolved as f64)
    }

    pub fn mean_time_to_match_ms(&self) -> Option<f64> {
        if self.completed_rides.is_empty() {
            return None;
        }
        let total: i64 = self
            .completed_rides
            .iter()
            .map(CompletedRideRecord::time_to_match_ms)
            .sum();
        Some(total as f64 / self.completed_rides.len() as f64)
    }
}
