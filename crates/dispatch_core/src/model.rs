use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::advisory::RouteAdvice;
use crate::clock::ReportedAt;
use crate::geo::GeoPoint;
use crate::identity::Role;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

string_id!(CaptainId);
string_id!(RequesterId);
uuid_id!(RequestId);
uuid_id!(RideId);
uuid_id!(OfferId);

/// Service classes a rider can request and a captain can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceClass {
    Bike,
    Auto,
    Cab,
}

impl ServiceClass {
    pub const ALL: [ServiceClass; 3] = [ServiceClass::Bike, ServiceClass::Auto, ServiceClass::Cab];

    /// Whether a captain driving `self` may take a `requested` ride.
    /// With upgrades allowed a Cab may also take Auto requests.
    pub fn serves(self, requested: ServiceClass, allow_upgrade: bool) -> bool {
        self == requested
            || (allow_upgrade && self == ServiceClass::Cab && requested == ServiceClass::Auto)
    }

    /// Vehicle classes able to serve a request of this class.
    pub fn eligible_vehicles(self, allow_upgrade: bool) -> Vec<ServiceClass> {
        Self::ALL
            .into_iter()
            .filter(|vehicle| vehicle.serves(self, allow_upgrade))
            .collect()
    }
}

/// Account approval status; only approved captains receive offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Blocked,
}

/// A captain as seen by the core. Busy/assigned state is owned by the arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Captain {
    pub id: CaptainId,
    pub approval: ApprovalStatus,
    /// `None` until the captain has selected a vehicle.
    pub vehicle: Option<ServiceClass>,
    pub position: Option<GeoPoint>,
    pub reported_at: Option<ReportedAt>,
    /// Reliability score in [0, 1].
    pub reliability: f64,
    pub online: bool,
}

impl Captain {
    pub fn new(id: impl Into<CaptainId>, vehicle: ServiceClass) -> Self {
        Self {
            id: id.into(),
            approval: ApprovalStatus::Approved,
            vehicle: Some(vehicle),
            position: None,
            reported_at: None,
            reliability: 0.75,
            online: false,
        }
    }
}

/// A pickup or destination: coordinates plus an optional human label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub point: GeoPoint,
    pub label: Option<String>,
}

impl Place {
    pub fn new(point: GeoPoint) -> Self {
        Self { point, label: None }
    }

    pub fn labelled(point: GeoPoint, label: impl Into<String>) -> Self {
        Self {
            point,
            label: Some(label.into()),
        }
    }

    pub fn describe(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self.point.describe(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Matched { ride_id: RideId },
    /// No captain accepted within the bounded number of offer rounds.
    Unmatched { rounds: u32 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: RequestId,
    pub requester: RequesterId,
    pub pickup: Place,
    pub destination: Place,
    pub service_class: ServiceClass,
    pub created_at: DateTime<Utc>,
    pub status: RequestStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideState {
    Requested,
    Assigned,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl RideState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideState::Completed | RideState::Cancelled)
    }

    /// Whether the captain bound to a ride in this state is still busy.
    pub fn binds_captain(self) -> bool {
        matches!(
            self,
            RideState::Assigned | RideState::Arrived | RideState::InProgress
        )
    }
}

/// Why a trip was aborted after pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    SafetyIncident,
    VehicleBreakdown,
    ConnectivityLost,
    RiderRequested,
}

/// Fixed set of cancellation reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationReason {
    CaptainDeniedDuty,
    CaptainAskedToCancel,
    ExpectedShorterWait,
    UnableToContactCaptain,
    ChangedPlans,
    Other,
    TripAborted(AbortReason),
}

impl CancellationReason {
    pub fn is_trip_abort(self) -> bool {
        matches!(self, CancellationReason::TripAborted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: CancellationReason,
    pub by: Role,
}

/// One-time numeric start code. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationCode(String);

impl VerificationCode {
    /// Accepts only ASCII digits.
    pub fn new(digits: impl Into<String>) -> Option<Self> {
        let digits = digits.into();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(digits))
    }

    /// Exact comparison against a supplied code.
    pub fn matches(&self, supplied: &str) -> bool {
        self.0 == supplied
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VerificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VerificationCode(****)")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RideTimestamps {
    pub requested_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub request: RideRequest,
    /// Set once at assignment and never changed afterwards.
    pub captain: Option<CaptainId>,
    pub state: RideState,
    pub verification_code: Option<VerificationCode>,
    pub fare_estimate: f64,
    pub final_fare: Option<f64>,
    pub cancellation: Option<Cancellation>,
    pub verification_failures: u32,
    pub timestamps: RideTimestamps,
    /// Informational only; attached after matching when an advisor is configured.
    pub advice: Option<RouteAdvice>,
}

impl Ride {
    /// A ride in `REQUESTED`, before the arbiter binds a captain.
    pub fn requested(request: RideRequest, fare_estimate: f64) -> Self {
        let requested_at = request.created_at;
        Self {
            id: RideId::new(),
            request,
            captain: None,
            state: RideState::Requested,
            verification_code: None,
            fare_estimate,
            final_fare: None,
            cancellation: None,
            verification_failures: 0,
            timestamps: RideTimestamps {
                requested_at: Some(requested_at),
                ..Default::default()
            },
            advice: None,
        }
    }
}

/// A time-bounded proposal of one request to one captain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub request_id: RequestId,
    pub captain_id: CaptainId,
    pub round: u32,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub pickup: GeoPoint,
    pub fare_estimate: f64,
}

/// A captain's answer to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferReply {
    Accept,
    Decline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_only_lets_cabs_take_auto_requests() {
        assert!(ServiceClass::Bike.serves(ServiceClass::Bike, false));
        assert!(!ServiceClass::Cab.serves(ServiceClass::Auto, false));
        assert!(ServiceClass::Cab.serves(ServiceClass::Auto, true));
        assert!(!ServiceClass::Cab.serves(ServiceClass::Bike, true));
        assert_eq!(
            ServiceClass::Auto.eligible_vehicles(true),
            vec![ServiceClass::Auto, ServiceClass::Cab]
        );
    }

    #[test]
    fn verification_code_is_digits_only_and_redacted() {
        assert!(VerificationCode::new("12a4").is_none());
        assert!(VerificationCode::new("").is_none());
        let code = VerificationCode::new("4821").expect("code");
        assert!(code.matches("4821"));
        assert!(!code.matches("0000"));
        assert!(!code.matches(" 4821"));
        assert!(!format!("{code:?}").contains("4821"));
    }

    #[test]
    fn terminal_states_do_not_bind_captains() {
        for state in [RideState::Completed, RideState::Cancelled] {
            assert!(state.is_terminal());
            assert!(!state.binds_captain());
        }
        assert!(RideState::InProgress.binds_captain());
        assert!(!RideState::Requested.binds_captain());
    }
}
