//! Store and notification wrappers that can be told to fail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dispatch_core::model::{
    Captain, CaptainId, RequestId, RequesterId, Ride, RideId, RideRequest, RideState,
    ServiceClass,
};
use dispatch_core::notify::{DispatchEvent, InMemoryChannel, NotificationChannel, NotifyError};
use dispatch_core::store::{InMemoryStore, RecordStore, Stamped, StoreError, StoreResult};

/// `InMemoryStore` whose ride updates fail while `fail_ride_updates` is set.
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_ride_updates: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            fail_ride_updates: AtomicBool::new(false),
        }
    }

    pub fn fail_ride_updates(&self, fail: bool) {
        self.fail_ride_updates.store(fail, Ordering::SeqCst);
    }

    /// Ride as stored, bypassing any authorization view.
    pub fn stored_ride(&self, id: RideId) -> Ride {
        self.inner
            .ride(id)
            .expect("store read")
            .expect("ride exists")
            .record
    }

    pub fn stored_captain(&self, id: &CaptainId) -> Captain {
        self.inner
            .captain(id)
            .expect("store read")
            .expect("captain exists")
            .record
    }
}

impl RecordStore for FlakyStore {
    fn upsert_captain(&self, captain: Captain) -> StoreResult<Stamped<Captain>> {
        self.inner.upsert_captain(captain)
    }

    fn captain(&self, id: &CaptainId) -> StoreResult<Option<Stamped<Captain>>> {
        self.inner.captain(id)
    }

    fn online_captains(&self, class: ServiceClass) -> StoreResult<Vec<Stamped<Captain>>> {
        self.inner.online_captains(class)
    }

    fn insert_request(&self, request: RideRequest) -> StoreResult<Stamped<RideRequest>> {
        self.inner.insert_request(request)
    }

    fn request(&self, id: RequestId) -> StoreResult<Option<Stamped<RideRequest>>> {
        self.inner.request(id)
    }

    fn update_request(&self, request: RideRequest) -> StoreResult<Stamped<RideRequest>> {
        self.inner.update_request(request)
    }

    fn insert_ride(&self, ride: Ride) -> StoreResult<Stamped<Ride>> {
        self.inner.insert_ride(ride)
    }

    fn ride(&self, id: RideId) -> StoreResult<Option<Stamped<Ride>>> {
        self.inner.ride(id)
    }

    fn update_ride(&self, ride: Ride, expected: RideState) -> StoreResult<Stamped<Ride>> {
        if self.fail_ride_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        self.inner.update_ride(ride, expected)
    }

    fn revert_ride(&self, prior: Ride, written: RideState) -> StoreResult<Stamped<Ride>> {
        self.inner.revert_ride(prior, written)
    }

    fn rides_for_requester(&self, id: &RequesterId) -> StoreResult<Vec<Stamped<Ride>>> {
        self.inner.rides_for_requester(id)
    }

    fn rides_for_captain(&self, id: &CaptainId) -> StoreResult<Vec<Stamped<Ride>>> {
        self.inner.rides_for_captain(id)
    }

    fn active_rides(&self) -> StoreResult<Vec<Stamped<Ride>>> {
        self.inner.active_rides()
    }
}

/// Forwards to an `InMemoryChannel`; ride transition events fail while
/// `fail_transitions` is set.
pub struct FlakyChannel {
    inner: Arc<InMemoryChannel>,
    fail_transitions: AtomicBool,
}

impl FlakyChannel {
    pub fn new(inner: Arc<InMemoryChannel>) -> Self {
        Self {
            inner,
            fail_transitions: AtomicBool::new(false),
        }
    }

    pub fn fail_transitions(&self, fail: bool) {
        self.fail_transitions.store(fail, Ordering::SeqCst);
    }
}

impl NotificationChannel for FlakyChannel {
    fn publish(&self, event: DispatchEvent) -> Result<(), NotifyError> {
        if self.fail_transitions.load(Ordering::SeqCst)
            && matches!(event, DispatchEvent::RideTransitioned { .. })
        {
            return Err(NotifyError::Unavailable("injected publish failure".to_string()));
        }
        self.inner.publish(event)
    }
}
