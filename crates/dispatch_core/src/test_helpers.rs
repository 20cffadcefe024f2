//! Test helpers for common test setup and utilities.
//!
//! Shared fixtures for unit tests, integration tests and benches: a fixed pickup point,
//! point offsets in kilometres, and ready-to-rank captains and requests.

use crate::clock::{Clock, ReportedAt};
use crate::geo::GeoPoint;
use crate::model::{
    Captain, Place, RequestId, RequestStatus, RequesterId, RideRequest, ServiceClass,
};

/// Kilometres per degree of latitude on the haversine sphere used by `geo::distance_km`.
const KM_PER_DEGREE: f64 = 6371.0 * std::f64::consts::PI / 180.0;

/// Fixed pickup point used across tests (central Bengaluru).
pub fn test_pickup() -> GeoPoint {
    GeoPoint {
        lat: 12.9716,
        lng: 77.5946,
    }
}

/// Point `north_km` north and `east_km` east of `origin`.
///
/// Pure north/south offsets are exact on the haversine sphere; east/west offsets are
/// accurate to a few metres at city scale.
pub fn offset_km(origin: GeoPoint, north_km: f64, east_km: f64) -> GeoPoint {
    let lat = origin.lat + north_km / KM_PER_DEGREE;
    let lng = origin.lng + east_km / (KM_PER_DEGREE * origin.lat.to_radians().cos());
    GeoPoint { lat, lng }
}

/// Online, approved Bike captain at the test pickup with a report stamped "now".
pub fn live_captain(id: &str, clock: &dyn Clock) -> Captain {
    let mut captain = Captain::new(id, ServiceClass::Bike);
    captain.online = true;
    captain.position = Some(test_pickup());
    captain.reported_at = Some(ReportedAt::wall_clock(clock.now()));
    captain
}

/// Same as [`live_captain`] but `north_km` north of the pickup with the given reliability.
pub fn captain_at(id: &str, north_km: f64, reliability: f64, clock: &dyn Clock) -> Captain {
    let mut captain = live_captain(id, clock);
    captain.position = Some(offset_km(test_pickup(), north_km, 0.0));
    captain.reliability = reliability;
    captain
}

/// Open request from the test pickup to a destination 5 km east.
pub fn test_request(requester: &str, class: ServiceClass, clock: &dyn Clock) -> RideRequest {
    let pickup = test_pickup();
    RideRequest {
        id: RequestId::new(),
        requester: RequesterId::from(requester),
        pickup: Place::labelled(pickup, "Pickup"),
        destination: Place::labelled(offset_km(pickup, 0.0, 5.0), "Destination"),
        service_class: class,
        created_at: clock.now(),
        status: RequestStatus::Open,
    }
}
