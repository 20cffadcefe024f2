//! Ride lifecycle state machine.
//!
//! ```text
//! REQUESTED -> ASSIGNED -> ARRIVED -> IN_PROGRESS -> COMPLETED
//!     |            |          |            |
//!     +------------+----------+--> CANCELLED (IN_PROGRESS only via TripAborted)
//! ```
//!
//! [`apply`] is the only function that mutates a [`Ride`]'s state. It either applies the
//! whole event or returns an error with the ride untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::identity::Role;
use crate::model::{
    CancellationReason, Cancellation, CaptainId, Ride, RideState, VerificationCode,
};

/// An event submitted to a ride.
#[derive(Debug, Clone, PartialEq)]
pub enum RideEvent {
    /// Fired only by the arbiter on a successful acceptance.
    Assign {
        captain: CaptainId,
        code: VerificationCode,
    },
    Arrive,
    Start {
        code: String,
    },
    Complete {
        fare: f64,
    },
    Cancel {
        reason: CancellationReason,
        by: Role,
    },
}

impl RideEvent {
    pub fn kind(&self) -> RideEventKind {
        match self {
            RideEvent::Assign { .. } => RideEventKind::Assign,
            RideEvent::Arrive => RideEventKind::Arrive,
            RideEvent::Start { .. } => RideEventKind::Start,
            RideEvent::Complete { .. } => RideEventKind::Complete,
            RideEvent::Cancel { .. } => RideEventKind::Cancel,
        }
    }
}

/// Payload-free event discriminant, used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideEventKind {
    Assign,
    Arrive,
    Start,
    Complete,
    Cancel,
}

/// A state change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RideState,
    pub to: RideState,
    pub at: DateTime<Utc>,
}

/// Transition table. `None` means the pair is illegal.
pub fn target_state(from: RideState, event: RideEventKind) -> Option<RideState> {
    use RideEventKind as E;
    use RideState as S;
    match (from, event) {
        (S::Requested, E::Assign) => Some(S::Assigned),
        (S::Assigned, E::Arrive) => Some(S::Arrived),
        (S::Arrived, E::Start) => Some(S::InProgress),
        (S::InProgress, E::Complete) => Some(S::Completed),
        (S::Requested | S::Assigned | S::Arrived | S::InProgress, E::Cancel) => {
            Some(S::Cancelled)
        }
        _ => None,
    }
}

fn illegal(ride: &Ride, event: RideEventKind) -> DispatchError {
    DispatchError::IllegalTransition {
        ride_id: ride.id,
        from: ride.state,
        event,
    }
}

/// Apply `event` to `ride` at instant `now`.
///
/// Validation happens before any field is written, so on error the ride is exactly as
/// it was. A start-code mismatch reports the attempt count including this one; persisting
/// the counter is the caller's job.
pub fn apply(ride: &mut Ride, event: RideEvent, now: DateTime<Utc>) -> Result<Transition> {
    let kind = event.kind();
    let from = ride.state;
    let to = target_state(from, kind).ok_or_else(|| illegal(ride, kind))?;

    match event {
        RideEvent::Assign { captain, code } => {
            if ride.captain.is_some() {
                return Err(illegal(ride, kind));
            }
            ride.captain = Some(captain);
            ride.verification_code = Some(code);
            ride.timestamps.assigned_at = Some(now);
        }
        RideEvent::Arrive => {
            ride.timestamps.arrived_at = Some(now);
        }
        RideEvent::Start { code } => {
            let matches = ride
                .verification_code
                .as_ref()
                .is_some_and(|stored| stored.matches(&code));
            if !matches {
                return Err(DispatchError::VerificationMismatch {
                    ride_id: ride.id,
                    failed_attempts: ride.verification_failures.saturating_add(1),
                });
            }
            ride.timestamps.started_at = Some(now);
        }
        RideEvent::Complete { fare } => {
            if !fare.is_finite() || fare < 0.0 {
                return Err(DispatchError::invalid(format!(
                    "final fare must be a non-negative number, got {fare}"
                )));
            }
            ride.final_fare = Some(fare);
            ride.timestamps.completed_at = Some(now);
        }
        RideEvent::Cancel { reason, by } => {
            // after pickup only an explicit abort may cancel
            if from == RideState::InProgress && !reason.is_trip_abort() {
                return Err(illegal(ride, kind));
            }
            ride.cancellation = Some(Cancellation { reason, by });
            ride.timestamps.cancelled_at = Some(now);
        }
    }

    ride.state = to;
    Ok(Transition { from, to, at: now })
}

/// Whether `event` has already been applied to `ride` with the same payload.
pub fn already_applied(ride: &Ride, event: &RideEvent) -> bool {
    match event {
        RideEvent::Assign { captain, .. } => {
            ride.state != RideState::Requested && ride.captain.as_ref() == Some(captain)
        }
        RideEvent::Arrive => ride.state == RideState::Arrived,
        RideEvent::Start { code } => {
            ride.state == RideState::InProgress
                && ride
                    .verification_code
                    .as_ref()
                    .is_some_and(|stored| stored.matches(code))
        }
        RideEvent::Complete { fare } => {
            ride.state == RideState::Completed && ride.final_fare == Some(*fare)
        }
        RideEvent::Cancel { reason, .. } => {
            ride.state == RideState::Cancelled
                && ride.cancellation.map(|c| c.reason) == Some(*reason)
        }
    }
}

/// Whether a transition guarded by `expected` is a retry of one that already went
/// through.
///
/// The event must lead from `expected` to the ride's current state with the payload
/// that was applied. Without a guard a repeated event is an `IllegalTransition`.
pub fn is_replay(ride: &Ride, event: &RideEvent, expected: RideState) -> bool {
    target_state(expected, event.kind()) == Some(ride.state) && already_applied(ride, event)
}
