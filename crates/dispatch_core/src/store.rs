//! Record store boundary.
//!
//! The core reads and writes captains, requests and rides only through [`RecordStore`].
//! Every read carries the record's last update instant.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

use crate::clock::{Clock, ReportedAt};
use crate::error::{Collaborator, DispatchError};
use crate::model::{
    Captain, CaptainId, RequestId, RequesterId, Ride, RideId, RideRequest, RideState,
    ServiceClass,
};

/// A record plus the instant the store last wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub record: T,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{kind} {id} not found")]
    Missing { kind: &'static str, id: String },
    #[error("ride {ride_id} is {actual:?}, expected {expected:?}")]
    Conflict {
        ride_id: RideId,
        expected: RideState,
        actual: RideState,
    },
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: String },
}

impl From<StoreError> for DispatchError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Missing { kind, id } => DispatchError::NotFound { kind, id },
            StoreError::Duplicate { .. } => DispatchError::InvalidInput(error.to_string()),
            StoreError::Unavailable(_) | StoreError::Conflict { .. } => {
                DispatchError::CollaboratorUnavailable {
                    collaborator: Collaborator::RecordStore,
                    message: error.to_string(),
                }
            }
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistent record store.
pub trait RecordStore: Send + Sync {
    fn upsert_captain(&self, captain: Captain) -> StoreResult<Stamped<Captain>>;
    fn captain(&self, id: &CaptainId) -> StoreResult<Option<Stamped<Captain>>>;
    /// All captains with `online = true` driving `class`.
    fn online_captains(&self, class: ServiceClass) -> StoreResult<Vec<Stamped<Captain>>>;

    fn insert_request(&self, request: RideRequest) -> StoreResult<Stamped<RideRequest>>;
    fn request(&self, id: RequestId) -> StoreResult<Option<Stamped<RideRequest>>>;
    fn update_request(&self, request: RideRequest) -> StoreResult<Stamped<RideRequest>>;

    fn insert_ride(&self, ride: Ride) -> StoreResult<Stamped<Ride>>;
    fn ride(&self, id: RideId) -> StoreResult<Option<Stamped<Ride>>>;
    /// Compare-and-set: writes only if the stored ride is still in `expected`.
    fn update_ride(&self, ride: Ride, expected: RideState) -> StoreResult<Stamped<Ride>>;
    /// Undo the last write of a ride that is currently in `written`, including a write
    /// that made it terminal. Only used to compensate a transition whose notification
    /// failed.
    fn revert_ride(&self, prior: Ride, written: RideState) -> StoreResult<Stamped<Ride>>;
    /// Newest first.
    fn rides_for_requester(&self, id: &RequesterId) -> StoreResult<Vec<Stamped<Ride>>>;
    /// Newest first.
    fn rides_for_captain(&self, id: &CaptainId) -> StoreResult<Vec<Stamped<Ride>>>;
    /// Rides in a non-terminal state.
    fn active_rides(&self) -> StoreResult<Vec<Stamped<Ride>>>;
}

#[derive(Debug, Default)]
struct Tables {
    captains: HashMap<CaptainId, Stamped<Captain>>,
    requests: HashMap<RequestId, Stamped<RideRequest>>,
    rides: HashMap<RideId, Stamped<Ride>>,
}

/// In-process store. Deferred position timestamps are committed on write.
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tables: RwLock::new(Tables::default()),
        }
    }

    fn stamp<T>(&self, record: T) -> Stamped<T> {
        Stamped {
            record,
            updated_at: self.clock.now(),
        }
    }

    fn rides_where(&self, predicate: impl Fn(&Ride) -> bool) -> Vec<Stamped<Ride>> {
        let tables = self.tables.read();
        let mut rides: Vec<Stamped<Ride>> = tables
            .rides
            .values()
            .filter(|stamped| predicate(&stamped.record))
            .cloned()
            .collect();
        rides.sort_by_key(|stamped| (Reverse(stamped.record.request.created_at), stamped.record.id));
        rides
    }
}

impl RecordStore for InMemoryStore {
    fn upsert_captain(&self, mut captain: Captain) -> StoreResult<Stamped<Captain>> {
        let now = self.clock.now();
        if let Some(ReportedAt::Deferred { committed_at: None }) = captain.reported_at {
            captain.reported_at = Some(ReportedAt::Deferred {
                committed_at: Some(now),
            });
        }
        let stamped = self.stamp(captain);
        self.tables
            .write()
            .captains
            .insert(stamped.record.id.clone(), stamped.clone());
        Ok(stamped)
    }

    fn captain(&self, id: &CaptainId) -> StoreResult<Option<Stamped<Captain>>> {
        Ok(self.tables.read().captains.get(id).cloned())
    }

    fn online_captains(&self, class: ServiceClass) -> StoreResult<Vec<Stamped<Captain>>> {
        let tables = self.tables.read();
        let mut captains: Vec<Stamped<Captain>> = tables
            .captains
            .values()
            .filter(|stamped| stamped.record.online && stamped.record.vehicle == Some(class))
            .cloned()
            .collect();
        captains.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(captains)
    }

    fn insert_request(&self, request: RideRequest) -> StoreResult<Stamped<RideRequest>> {
        let mut tables = self.tables.write();
        if tables.requests.contains_key(&request.id) {
            return Err(StoreError::Duplicate {
                kind: "request",
                id: request.id.to_string(),
            });
        }
        let stamped = self.stamp(request);
        tables.requests.insert(stamped.record.id, stamped.clone());
        Ok(stamped)
    }

    fn request(&self, id: RequestId) -> StoreResult<Option<Stamped<RideRequest>>> {
        Ok(self.tables.read().requests.get(&id).cloned())
    }

    fn update_request(&self, request: RideRequest) -> StoreResult<Stamped<RideRequest>> {
        let mut tables = self.tables.write();
        if !tables.requests.contains_key(&request.id) {
            return Err(StoreError::Missing {
                kind: "request",
                id: request.id.to_string(),
            });
        }
        let stamped = self.stamp(request);
        tables.requests.insert(stamped.record.id, stamped.clone());
        Ok(stamped)
    }

    fn insert_ride(&self, ride: Ride) -> StoreResult<Stamped<Ride>> {
        let mut tables = self.tables.write();
        if tables.rides.contains_key(&ride.id) {
            return Err(StoreError::Duplicate {
                kind: "ride",
                id: ride.id.to_string(),
            });
        }
        let stamped = self.stamp(ride);
        tables.rides.insert(stamped.record.id, stamped.clone());
        Ok(stamped)
    }

    fn ride(&self, id: RideId) -> StoreResult<Option<Stamped<Ride>>> {
        Ok(self.tables.read().rides.get(&id).cloned())
    }

    fn update_ride(&self, ride: Ride, expected: RideState) -> StoreResult<Stamped<Ride>> {
        let mut tables = self.tables.write();
        let current = tables.rides.get(&ride.id).ok_or_else(|| StoreError::Missing {
            kind: "ride",
            id: ride.id.to_string(),
        })?;
        let actual = current.record.state;
        // archived rides are read-only
        if actual != expected || actual.is_terminal() {
            return Err(StoreError::Conflict {
                ride_id: ride.id,
                expected,
                actual,
            });
        }
        let stamped = self.stamp(ride);
        tables.rides.insert(stamped.record.id, stamped.clone());
        Ok(stamped)
    }

    fn revert_ride(&self, prior: Ride, written: RideState) -> StoreResult<Stamped<Ride>> {
        let mut tables = self.tables.write();
        let current = tables.rides.get(&prior.id).ok_or_else(|| StoreError::Missing {
            kind: "ride",
            id: prior.id.to_string(),
        })?;
        if current.record.state != written {
            return Err(StoreError::Conflict {
                ride_id: prior.id,
                expected: written,
                actual: current.record.state,
            });
        }
        let stamped = self.stamp(prior);
        tables.rides.insert(stamped.record.id, stamped.clone());
        Ok(stamped)
    }

    fn rides_for_requester(&self, id: &RequesterId) -> StoreResult<Vec<Stamped<Ride>>> {
        Ok(self.rides_where(|ride| &ride.request.requester == id))
    }

    fn rides_for_captain(&self, id: &CaptainId) -> StoreResult<Vec<Stamped<Ride>>> {
        Ok(self.rides_where(|ride| ride.captain.as_ref() == Some(id)))
    }

    fn active_rides(&self) -> StoreResult<Vec<Stamped<Ride>>> {
        Ok(self.rides_where(|ride| !ride.state.is_terminal()))
    }
}
