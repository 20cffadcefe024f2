//! Dispatch orchestrator and the public API surface.
//!
//! Ties freshness filtering, ranking, arbitration and the lifecycle state machine
//! together. Transitions on one ride are serialized through a per-ride lock; different
//! rides never contend on it.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::bounded;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::advisory::{RouteAdvice, RouteAdvisor};
use crate::arbiter::{Arbiter, OfferOutcome};
use crate::clock::{millis_between, Clock, ReportedAt, SystemClock};
use crate::config::{AbandonmentPolicy, DispatchConfig};
use crate::error::{DispatchError, Result};
use crate::freshness::FreshnessFilter;
use crate::geo::{GeoPoint, SpatialIndex};
use crate::identity::{Principal, Role};
use crate::lifecycle::{self, RideEvent};
use crate::matching::{
    eligible_candidates, ranking_from_config, Corridor, FamiliarityIndex, RankingAlgorithm,
    Ranking,
};
use crate::model::{
    AbortReason, Captain, CaptainId, CancellationReason, OfferId, OfferReply, Place,
    RequestId, RequestStatus, RequesterId, Ride, RideId, RideRequest, RideState,
    ServiceClass,
};
use crate::notify::{DispatchEvent, InMemoryChannel, NotificationChannel};
use crate::store::{InMemoryStore, RecordStore};
use crate::telemetry::DispatchTelemetry;

/// One mutex per key, created on first use and dropped once nobody holds or waits on it.
struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Run `f` while holding the lock for `key`. Not reentrant.
    fn with<T>(&self, key: &K, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let value = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        // waiters hold their own clone, so only an idle entry has a count of one
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        value
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Marks a request's offer loop as running; the entry goes away when this is dropped.
struct InFlight<'a> {
    requests: &'a DashMap<RequestId, Arc<AtomicBool>>,
    request_id: RequestId,
    cancelled: Arc<AtomicBool>,
}

impl InFlight<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.requests.remove(&self.request_id);
    }
}

enum Admission<'a> {
    Run {
        request: RideRequest,
        flight: InFlight<'a>,
    },
    Settled(DispatchOutcome),
}

/// Result of one dispatch attempt for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Matched(Box<Ride>),
    /// No captain accepted within the offer round limit or the pool ran out.
    Unmatched { request_id: RequestId, rounds: u32 },
    Cancelled { request_id: RequestId },
    /// Another caller is already running the offer loop for this request.
    AlreadyDispatching { request_id: RequestId },
}

/// A caller-requested lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionRequest {
    Arrive,
    Start { code: String },
    Complete { fare: f64 },
    Cancel { reason: CancellationReason },
}

impl TransitionRequest {
    fn action(&self) -> &'static str {
        match self {
            TransitionRequest::Arrive => "report arrival",
            TransitionRequest::Start { .. } => "verify start",
            TransitionRequest::Complete { .. } => "complete ride",
            TransitionRequest::Cancel { .. } => "cancel ride",
        }
    }

    fn authorized(&self, principal: &Principal, ride: &Ride) -> bool {
        if principal.is_admin() {
            return true;
        }
        match self {
            TransitionRequest::Arrive | TransitionRequest::Complete { .. } => {
                principal.is_assigned_captain(ride)
            }
            TransitionRequest::Start { .. } => principal.is_requester(ride),
            TransitionRequest::Cancel { .. } => {
                principal.is_requester(ride) || principal.is_assigned_captain(ride)
            }
        }
    }

    fn into_event(self, role: Role) -> RideEvent {
        match self {
            TransitionRequest::Arrive => RideEvent::Arrive,
            TransitionRequest::Start { code } => RideEvent::Start { code },
            TransitionRequest::Complete { fare } => RideEvent::Complete { fare },
            TransitionRequest::Cancel { reason } => RideEvent::Cancel { reason, by: role },
        }
    }
}

/// Captains never see the start code; they must get it from the rider.
fn view_for(principal: &Principal, mut ride: Ride) -> Ride {
    if principal.role == Role::Captain {
        ride.verification_code = None;
    }
    ride
}

pub struct DispatcherBuilder {
    config: DispatchConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn RecordStore>>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    advisor: Option<Arc<dyn RouteAdvisor>>,
    ranking: Option<Box<dyn RankingAlgorithm>>,
}

impl DispatcherBuilder {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            notifier: None,
            advisor: None,
            ranking: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn advisor(mut self, advisor: Arc<dyn RouteAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn ranking(mut self, ranking: Box<dyn RankingAlgorithm>) -> Self {
        self.ranking = Some(ranking);
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        self.config.validate()?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new(Arc::clone(&clock))));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(InMemoryChannel::new()));
        let ranking = self
            .ranking
            .unwrap_or_else(|| ranking_from_config(&self.config));
        let arbiter = Arbiter::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            self.config.verification_code_digits,
            self.config.code_seed,
        );
        Ok(Dispatcher {
            freshness: FreshnessFilter::new(self.config.freshness_window_ms),
            config: self.config,
            clock,
            store,
            notifier,
            advisor: self.advisor,
            ranking,
            arbiter,
            spatial: RwLock::new(SpatialIndex::new()),
            familiarity: FamiliarityIndex::new(),
            ride_locks: Arc::new(KeyedLocks::new()),
            request_locks: KeyedLocks::new(),
            captain_locks: KeyedLocks::new(),
            in_flight: DashMap::new(),
            telemetry: Mutex::new(DispatchTelemetry::default()),
        })
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn NotificationChannel>,
    advisor: Option<Arc<dyn RouteAdvisor>>,
    ranking: Box<dyn RankingAlgorithm>,
    freshness: FreshnessFilter,
    arbiter: Arbiter,
    spatial: RwLock<SpatialIndex>,
    familiarity: FamiliarityIndex,
    ride_locks: Arc<KeyedLocks<RideId>>,
    request_locks: KeyedLocks<RequestId>,
    captain_locks: KeyedLocks<CaptainId>,
    /// Requests with a running offer loop and their cancellation flags.
    in_flight: DashMap<RequestId, Arc<AtomicBool>>,
    telemetry: Mutex<DispatchTelemetry>,
}

impl Dispatcher {
    pub fn builder(config: DispatchConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn telemetry(&self) -> DispatchTelemetry {
        self.telemetry.lock().clone()
    }

    fn load_ride(&self, ride_id: RideId) -> Result<Ride> {
        self.store
            .ride(ride_id)?
            .map(|stamped| stamped.record)
            .ok_or_else(|| DispatchError::not_found("ride", ride_id))
    }

    fn load_request(&self, request_id: RequestId) -> Result<RideRequest> {
        self.store
            .request(request_id)?
            .map(|stamped| stamped.record)
            .ok_or_else(|| DispatchError::not_found("request", request_id))
    }

    fn load_captain(&self, captain_id: &CaptainId) -> Result<Captain> {
        self.store
            .captain(captain_id)?
            .map(|stamped| stamped.record)
            .ok_or_else(|| DispatchError::not_found("captain", captain_id))
    }

    fn reindex(&self, captain: &Captain) {
        let mut spatial = self.spatial.write();
        match (captain.online, captain.position.and_then(|p| p.index_cell())) {
            (true, Some(cell)) => spatial.upsert(&captain.id, cell),
            _ => spatial.remove(&captain.id),
        }
    }

    // ---- captains -------------------------------------------------------------------

    /// Create or replace a captain record.
    pub fn register_captain(&self, principal: &Principal, captain: Captain) -> Result<Captain> {
        principal.require_captain_self(&captain.id, "register captain")?;
        if !captain.reliability.is_finite() || !(0.0..=1.0).contains(&captain.reliability) {
            return Err(DispatchError::invalid(format!(
                "reliability {} outside [0, 1]",
                captain.reliability
            )));
        }
        if let Some(position) = captain.position {
            position.validate()?;
        }
        let captain_id = captain.id.clone();
        self.captain_locks.with(&captain_id, || -> Result<Captain> {
            let stored = self.store.upsert_captain(captain)?.record;
            self.reindex(&stored);
            info!(captain_id = %stored.id, online = stored.online, "captain registered");
            Ok(stored)
        })
    }

    pub fn set_captain_online(
        &self,
        principal: &Principal,
        captain_id: &CaptainId,
        online: bool,
    ) -> Result<Captain> {
        principal.require_captain_self(captain_id, "change online status")?;
        self.captain_locks.with(captain_id, || -> Result<Captain> {
            let mut captain = self.load_captain(captain_id)?;
            captain.online = online;
            let stored = self.store.upsert_captain(captain)?.record;
            self.reindex(&stored);
            info!(captain_id = %captain_id, online, "captain availability changed");
            Ok(stored)
        })
    }

    /// Record a position report.
    ///
    /// Reports already outside the freshness window are rejected with
    /// `StaleDataRejected`. Reports older than the stored one are ignored, so updates
    /// only ever move forward.
    pub fn update_captain_location(
        &self,
        principal: &Principal,
        captain_id: &CaptainId,
        position: GeoPoint,
        reported_at: ReportedAt,
    ) -> Result<Captain> {
        principal.require_captain_self(captain_id, "update location")?;
        position.validate()?;

        let now = self.clock.now();
        let origin = self.clock.origin();
        let instant = reported_at.resolve(origin);
        if let Some(at) = instant {
            if !self.freshness.classify(Some(at), now).is_live() {
                return Err(DispatchError::StaleDataRejected {
                    captain_id: captain_id.clone(),
                    age_ms: Some(millis_between(at, now)),
                });
            }
        }

        self.captain_locks.with(captain_id, || -> Result<Captain> {
            let mut captain = self.load_captain(captain_id)?;
            let previous = captain.reported_at.and_then(|r| r.resolve(origin));
            if let (Some(at), Some(previous)) = (instant, previous) {
                if at < previous {
                    debug!(captain_id = %captain_id, "ignoring out-of-order position report");
                    return Ok(captain);
                }
            }

            captain.position = Some(position);
            captain.reported_at = Some(reported_at);
            let stamped = self.store.upsert_captain(captain)?;
            let stored = stamped.record;
            self.reindex(&stored);
            let reported = stored
                .reported_at
                .and_then(|r| r.resolve(origin))
                .unwrap_or(stamped.updated_at);
            self.notifier.publish(DispatchEvent::CaptainMoved {
                captain_id: captain_id.clone(),
                position,
                reported_at: reported,
            })?;
            Ok(stored)
        })
    }

    /// Online, approved, fresh captains for map display. Re-evaluated on every call.
    pub fn live_captains(&self, class: Option<ServiceClass>) -> Result<Vec<Captain>> {
        let classes = match class {
            Some(class) => vec![class],
            None => ServiceClass::ALL.to_vec(),
        };
        let mut live = Vec::new();
        for class in classes {
            live.extend(
                self.store
                    .online_captains(class)?
                    .into_iter()
                    .map(|stamped| stamped.record)
                    .filter(|captain| self.freshness.captain(captain, self.clock.as_ref()).is_live()),
            );
        }
        live.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(live)
    }

    // ---- requests and dispatch ------------------------------------------------------

    pub fn request_ride(
        &self,
        principal: &Principal,
        pickup: Place,
        destination: Place,
        service_class: ServiceClass,
    ) -> Result<RequestId> {
        let requester = principal
            .as_requester()
            .ok_or_else(|| principal.deny("request a ride"))?;
        pickup.point.validate()?;
        destination.point.validate()?;

        let request = RideRequest {
            id: RequestId::new(),
            requester,
            pickup,
            destination,
            service_class,
            created_at: self.clock.now(),
            status: RequestStatus::Open,
        };
        let request_id = request.id;
        self.store.insert_request(request)?;
        self.telemetry.lock().counts.requests += 1;
        info!(request_id = %request_id, class = ?service_class, "ride requested");
        Ok(request_id)
    }

    pub fn request(&self, request_id: RequestId) -> Result<RideRequest> {
        self.load_request(request_id)
    }

    /// Rank the current candidates for a request without offering.
    pub fn rank_candidates(&self, request_id: RequestId) -> Result<Ranking> {
        let request = self.load_request(request_id)?;
        self.rank(&request, &HashSet::new())
    }

    fn rank(&self, request: &RideRequest, offered: &HashSet<CaptainId>) -> Result<Ranking> {
        let allow_upgrade = self.config.allow_class_upgrade;
        let nearby = request
            .pickup
            .point
            .index_cell()
            .map(|cell| {
                self.spatial
                    .read()
                    .captains_near(cell, self.config.match_radius_cells)
            });

        let mut pool = Vec::new();
        for class in request.service_class.eligible_vehicles(allow_upgrade) {
            pool.extend(
                self.store
                    .online_captains(class)?
                    .into_iter()
                    .map(|stamped| stamped.record)
                    .filter(|captain| nearby.as_ref().map_or(true, |n| n.contains(&captain.id))),
            );
        }

        let candidates = eligible_candidates(
            request,
            pool.iter(),
            &self.freshness,
            self.clock.as_ref(),
            allow_upgrade,
            &self.familiarity,
            |id| offered.contains(id) || self.arbiter.is_engaged(id),
        );
        Ok(self.ranking.rank(request.pickup.point, &candidates))
    }

    /// Run the offer loop for a request until a captain accepts, the round limit or
    /// candidate pool runs out, or the request is cancelled.
    ///
    /// Blocks for at most `max_offer_rounds * offer_timeout`. Offer conflicts, declines
    /// and expiries move on to the next candidate; collaborator failures are returned.
    /// Only one loop runs per request; a concurrent call gets `AlreadyDispatching`.
    pub fn dispatch(&self, request_id: RequestId) -> Result<DispatchOutcome> {
        let (request, flight) = match self.admit(request_id)? {
            Admission::Run { request, flight } => (request, flight),
            Admission::Settled(outcome) => return Ok(outcome),
        };

        let fare = self.config.pricing.estimate(
            request.service_class,
            request.pickup.point,
            request.destination.point,
        );
        let timeout = self.config.offer_timeout();
        let mut offered = HashSet::new();
        let mut rounds = 0;

        while rounds < self.config.max_offer_rounds {
            if flight.is_cancelled() {
                return Ok(DispatchOutcome::Cancelled { request_id });
            }
            let ranking = self.rank(&request, &offered)?;
            let Some(best) = ranking.best() else {
                debug!(request_id = %request_id, rounds, "candidate pool exhausted");
                break;
            };
            let captain_id = best.captain_id.clone();
            offered.insert(captain_id.clone());
            info!(
                request_id = %request_id,
                captain_id = %captain_id,
                round = rounds + 1,
                distance_km = best.distance_km,
                "offering ride"
            );

            let outcome = match self.arbiter.offer(&request, &captain_id, rounds + 1, timeout, fare) {
                Ok(outcome) => outcome,
                Err(err) if err.is_locally_recoverable() => {
                    // no offer went out, so no round is used
                    debug!(request_id = %request_id, captain_id = %captain_id, error = %err, "offer skipped");
                    self.telemetry.lock().counts.offer_conflicts += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            rounds += 1;
            self.telemetry.lock().counts.offers_sent += 1;

            match outcome {
                OfferOutcome::Accepted(ride) => {
                    self.telemetry.lock().counts.offers_accepted += 1;
                    return self.finish_match(request_id, *ride);
                }
                OfferOutcome::Declined => {
                    self.telemetry.lock().counts.offers_declined += 1;
                }
                OfferOutcome::Expired => {
                    self.telemetry.lock().counts.offers_expired += 1;
                }
                OfferOutcome::Withdrawn => {
                    return Ok(DispatchOutcome::Cancelled { request_id });
                }
            }
        }

        self.mark_unmatched(request_id, rounds)
    }

    /// Decide under the request lock whether an offer loop may start, and claim it.
    fn admit<'a>(&'a self, request_id: RequestId) -> Result<Admission<'a>> {
        self.request_locks.with(&request_id, || -> Result<Admission<'a>> {
            let mut request = self.load_request(request_id)?;
            match request.status {
                RequestStatus::Open | RequestStatus::Unmatched { .. } => {}
                RequestStatus::Matched { ride_id } => {
                    let ride = self.load_ride(ride_id)?;
                    return Ok(Admission::Settled(DispatchOutcome::Matched(Box::new(ride))));
                }
                RequestStatus::Cancelled => {
                    return Ok(Admission::Settled(DispatchOutcome::Cancelled { request_id }));
                }
            }

            let cancelled = match self.in_flight.entry(request_id) {
                Entry::Occupied(_) => {
                    debug!(request_id = %request_id, "offer loop already running");
                    return Ok(Admission::Settled(DispatchOutcome::AlreadyDispatching {
                        request_id,
                    }));
                }
                Entry::Vacant(slot) => slot.insert(Arc::new(AtomicBool::new(false))).clone(),
            };
            let flight = InFlight {
                requests: &self.in_flight,
                request_id,
                cancelled,
            };

            if matches!(request.status, RequestStatus::Unmatched { .. }) {
                request.status = RequestStatus::Open;
                request = self.store.update_request(request)?.record;
            }
            Ok(Admission::Run { request, flight })
        })
    }

    fn mark_unmatched(&self, request_id: RequestId, rounds: u32) -> Result<DispatchOutcome> {
        self.request_locks.with(&request_id, || -> Result<DispatchOutcome> {
            let mut request = self.load_request(request_id)?;
            if request.status == RequestStatus::Cancelled {
                return Ok(DispatchOutcome::Cancelled { request_id });
            }
            request.status = RequestStatus::Unmatched { rounds };
            self.store.update_request(request)?;
            self.telemetry.lock().counts.unmatched_requests += 1;
            warn!(request_id = %request_id, rounds, "request unmatched");
            self.notifier
                .publish(DispatchEvent::RequestUnmatched { request_id, rounds })?;
            Ok(DispatchOutcome::Unmatched { request_id, rounds })
        })
    }

    fn finish_match(&self, request_id: RequestId, ride: Ride) -> Result<DispatchOutcome> {
        let cancelled = self.request_locks.with(&request_id, || -> Result<bool> {
            let mut request = self.load_request(request_id)?;
            if request.status == RequestStatus::Cancelled {
                return Ok(true);
            }
            request.status = RequestStatus::Matched { ride_id: ride.id };
            self.store.update_request(request)?;
            Ok(false)
        })?;

        if cancelled {
            // the rider cancelled while the acceptance was in flight
            info!(ride_id = %ride.id, "request cancelled during acceptance, releasing captain");
            self.apply_transition(
                &Principal::system(),
                ride.id,
                Some(RideState::Assigned),
                TransitionRequest::Cancel {
                    reason: CancellationReason::ChangedPlans,
                },
            )?;
            return Ok(DispatchOutcome::Cancelled { request_id });
        }

        info!(ride_id = %ride.id, request_id = %request_id, captain_id = ?ride.captain, "ride matched");
        self.attach_advice_async(&ride);
        Ok(DispatchOutcome::Matched(Box::new(ride)))
    }

    /// Cancel a request. Before assignment this just stops the offer loop; once matched
    /// it cancels the ride and releases the captain.
    pub fn cancel_request(
        &self,
        principal: &Principal,
        request_id: RequestId,
        reason: CancellationReason,
    ) -> Result<Option<Ride>> {
        let matched = self.request_locks.with(&request_id, || -> Result<Option<Option<RideId>>> {
            let mut request = self.load_request(request_id)?;
            if !principal.is_admin() && principal.as_requester() != Some(request.requester.clone()) {
                return Err(principal.deny("cancel request"));
            }
            match request.status {
                RequestStatus::Matched { ride_id } => Ok(Some(Some(ride_id))),
                RequestStatus::Cancelled => Ok(None),
                RequestStatus::Open | RequestStatus::Unmatched { .. } => {
                    request.status = RequestStatus::Cancelled;
                    self.store.update_request(request)?;
                    if let Some(flag) = self.in_flight.get(&request_id) {
                        flag.store(true, Ordering::SeqCst);
                    }
                    Ok(Some(None))
                }
            }
        })?;

        match matched {
            None => Ok(None),
            Some(Some(ride_id)) => self.cancel_ride(principal, ride_id, reason).map(Some),
            Some(None) => {
                self.arbiter.withdraw(request_id);
                info!(request_id = %request_id, "request cancelled");
                self.notifier
                    .publish(DispatchEvent::RequestCancelled { request_id })?;
                Ok(None)
            }
        }
    }

    // ---- offers ---------------------------------------------------------------------

    /// Answer an offer. Accepting returns the new ride.
    pub fn respond_to_offer(
        &self,
        principal: &Principal,
        offer_id: OfferId,
        reply: OfferReply,
    ) -> Result<Option<Ride>> {
        let captain = principal
            .as_captain()
            .ok_or_else(|| principal.deny("respond to offer"))?;
        let result = match reply {
            OfferReply::Accept => self.arbiter.accept(&captain, offer_id).map(Some),
            OfferReply::Decline => self.arbiter.decline(&captain, offer_id).map(|()| None),
        };
        if let Err(DispatchError::OfferConflict { reason, .. }) = &result {
            debug!(offer_id = %offer_id, captain_id = %captain, ?reason, "offer response lost");
            self.telemetry.lock().counts.offer_conflicts += 1;
        }
        result.map(|ride| ride.map(|ride| view_for(principal, ride)))
    }

    // ---- lifecycle ------------------------------------------------------------------

    pub fn report_arrival(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        self.apply_transition(principal, ride_id, None, TransitionRequest::Arrive)
    }

    pub fn verify_start(&self, principal: &Principal, ride_id: RideId, code: &str) -> Result<Ride> {
        self.apply_transition(
            principal,
            ride_id,
            None,
            TransitionRequest::Start {
                code: code.to_string(),
            },
        )
    }

    pub fn complete_ride(&self, principal: &Principal, ride_id: RideId, fare: f64) -> Result<Ride> {
        self.apply_transition(principal, ride_id, None, TransitionRequest::Complete { fare })
    }

    pub fn cancel_ride(
        &self,
        principal: &Principal,
        ride_id: RideId,
        reason: CancellationReason,
    ) -> Result<Ride> {
        self.apply_transition(principal, ride_id, None, TransitionRequest::Cancel { reason })
    }

    /// Apply a transition, optionally guarded by the state the caller last saw.
    ///
    /// A guarded retry of a transition that already went through with the same payload
    /// returns the current snapshot; an unguarded repeat is an `IllegalTransition`. A
    /// store or notification failure leaves the ride in its prior state.
    pub fn apply_transition(
        &self,
        principal: &Principal,
        ride_id: RideId,
        expected: Option<RideState>,
        request: TransitionRequest,
    ) -> Result<Ride> {
        self.ride_locks
            .with(&ride_id, || self.transition_locked(principal, ride_id, expected, request))
    }

    fn transition_locked(
        &self,
        principal: &Principal,
        ride_id: RideId,
        expected: Option<RideState>,
        request: TransitionRequest,
    ) -> Result<Ride> {
        let ride = self.load_ride(ride_id)?;
        if !request.authorized(principal, &ride) {
            return Err(principal.deny(request.action()));
        }
        let event = request.into_event(principal.role);
        if let Some(expected) = expected {
            if lifecycle::is_replay(&ride, &event, expected) {
                debug!(ride_id = %ride_id, state = ?ride.state, "transition already applied");
                return Ok(view_for(principal, ride));
            }
            if ride.state != expected {
                return Err(DispatchError::IllegalTransition {
                    ride_id,
                    from: ride.state,
                    event: event.kind(),
                });
            }
        }

        let mut next = ride.clone();
        let transition = match lifecycle::apply(&mut next, event, self.clock.now()) {
            Ok(transition) => transition,
            Err(DispatchError::VerificationMismatch {
                ride_id,
                failed_attempts,
            }) => {
                self.record_verification_failure(&ride, failed_attempts);
                return Err(DispatchError::VerificationMismatch {
                    ride_id,
                    failed_attempts,
                });
            }
            Err(err) => {
                warn!(ride_id = %ride_id, state = ?ride.state, error = %err, "transition rejected");
                return Err(err);
            }
        };

        let committed = match (transition.to.is_terminal(), ride.captain.clone()) {
            (true, Some(captain)) => self
                .arbiter
                .settle(&captain, ride_id, || self.commit(&ride, &next)),
            _ => self.commit(&ride, &next),
        }?;

        info!(
            ride_id = %ride_id,
            from = ?transition.from,
            to = ?transition.to,
            by = ?principal.role,
            "ride transitioned"
        );
        self.after_transition(&committed);
        Ok(view_for(principal, committed))
    }

    /// Write the new ride and publish the transition, or neither.
    fn commit(&self, prior: &Ride, next: &Ride) -> Result<Ride> {
        let stored = self.store.update_ride(next.clone(), prior.state)?.record;
        let event = DispatchEvent::RideTransitioned {
            ride_id: stored.id,
            request_id: stored.request.id,
            captain_id: stored.captain.clone(),
            from: prior.state,
            to: stored.state,
            at: self.clock.now(),
        };
        if let Err(publish_error) = self.notifier.publish(event) {
            warn!(ride_id = %prior.id, error = %publish_error, "publish failed, reverting transition");
            if let Err(revert_error) = self.store.revert_ride(prior.clone(), stored.state) {
                error!(ride_id = %prior.id, error = %revert_error, "failed to revert ride");
            }
            return Err(publish_error.into());
        }
        Ok(stored)
    }

    fn record_verification_failure(&self, ride: &Ride, failed_attempts: u32) {
        self.telemetry.lock().counts.verification_failures += 1;
        warn!(ride_id = %ride.id, failed_attempts, "start code mismatch");
        let mut counted = ride.clone();
        counted.verification_failures = failed_attempts;
        if let Err(err) = self.store.update_ride(counted, ride.state) {
            warn!(ride_id = %ride.id, error = %err, "failed to persist verification failure count");
        }
    }

    fn after_transition(&self, ride: &Ride) {
        match ride.state {
            RideState::Completed => {
                if let (Some(corridor), Some(captain)) =
                    (Corridor::of(&ride.request), ride.captain.as_ref())
                {
                    self.familiarity.record_trip(corridor, captain);
                }
                self.telemetry.lock().record_completion(ride);
            }
            RideState::Cancelled => {
                self.telemetry.lock().counts.rides_cancelled += 1;
            }
            _ => {}
        }
    }

    // ---- reads ----------------------------------------------------------------------

    pub fn ride(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        let ride = self.load_ride(ride_id)?;
        if principal.is_admin()
            || principal.is_requester(&ride)
            || principal.is_assigned_captain(&ride)
        {
            Ok(view_for(principal, ride))
        } else {
            Err(principal.deny("read ride"))
        }
    }

    pub fn rides_for_requester(
        &self,
        principal: &Principal,
        requester: &RequesterId,
    ) -> Result<Vec<Ride>> {
        if !principal.is_admin() && principal.as_requester().as_ref() != Some(requester) {
            return Err(principal.deny("read ride history"));
        }
        Ok(self
            .store
            .rides_for_requester(requester)?
            .into_iter()
            .map(|stamped| view_for(principal, stamped.record))
            .collect())
    }

    pub fn rides_for_captain(&self, principal: &Principal, captain: &CaptainId) -> Result<Vec<Ride>> {
        principal.require_captain_self(captain, "read ride history")?;
        Ok(self
            .store
            .rides_for_captain(captain)?
            .into_iter()
            .map(|stamped| view_for(principal, stamped.record))
            .collect())
    }

    // ---- abandonment ----------------------------------------------------------------

    /// Apply the configured abandonment policy to active rides.
    ///
    /// Returns the rides cancelled by this sweep. Under `Manual` nothing is cancelled.
    pub fn sweep_abandoned(&self) -> Result<Vec<RideId>> {
        let AbandonmentPolicy::AutoCancelAfter { stale_ms } = self.config.abandonment else {
            return Ok(Vec::new());
        };
        let stale_ms = i64::try_from(stale_ms).unwrap_or(i64::MAX);
        let mut cancelled = Vec::new();

        for stamped in self.store.active_rides()? {
            let ride = stamped.record;
            let Some(captain_id) = ride.captain.clone() else {
                continue;
            };
            if !ride.state.binds_captain() {
                continue;
            }
            let captain = self.load_captain(&captain_id)?;
            let abandoned = self
                .freshness
                .age_ms(&captain, self.clock.as_ref())
                .map_or(true, |age| age >= stale_ms);
            if !abandoned {
                continue;
            }

            let result = self.apply_transition(
                &Principal::system(),
                ride.id,
                Some(ride.state),
                TransitionRequest::Cancel {
                    reason: CancellationReason::TripAborted(AbortReason::ConnectivityLost),
                },
            );
            match result {
                Ok(_) => {
                    warn!(ride_id = %ride.id, captain_id = %captain_id, "ride auto-cancelled after connectivity loss");
                    self.telemetry.lock().counts.auto_cancelled += 1;
                    cancelled.push(ride.id);
                }
                Err(err) => {
                    warn!(ride_id = %ride.id, error = %err, "abandonment sweep skipped ride");
                }
            }
        }
        Ok(cancelled)
    }

    // ---- advisory -------------------------------------------------------------------

    fn attach_advice_async(&self, ride: &Ride) {
        let Some(advisor) = self.advisor.clone() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let locks = Arc::clone(&self.ride_locks);
        let timeout = self.config.advisory_timeout();
        let ride_id = ride.id;
        let start = ride.request.pickup.describe();
        let destination = ride.request.destination.describe();

        let spawned = thread::Builder::new()
            .name("route-advice".to_string())
            .spawn(move || {
                let (tx, rx) = bounded(1);
                let call = thread::Builder::new()
                    .name("route-advice-call".to_string())
                    .spawn(move || {
                        let _ = tx.send(advisor.advise(&start, &destination));
                    });
                if let Err(err) = call {
                    warn!(ride_id = %ride_id, error = %err, "could not start advisory call");
                    return;
                }
                let advice = match rx.recv_timeout(timeout) {
                    Ok(Ok(advice)) => advice,
                    Ok(Err(err)) => {
                        warn!(ride_id = %ride_id, error = %err, "advisory service failed");
                        return;
                    }
                    Err(_) => {
                        warn!(ride_id = %ride_id, "advisory service timed out");
                        return;
                    }
                };
                attach_advice(store.as_ref(), notifier.as_ref(), &locks, ride_id, advice);
            });
        if let Err(err) = spawned {
            warn!(ride_id = %ride.id, error = %err, "could not start advisory thread");
        }
    }
}

fn attach_advice(
    store: &dyn RecordStore,
    notifier: &dyn NotificationChannel,
    locks: &KeyedLocks<RideId>,
    ride_id: RideId,
    advice: RouteAdvice,
) {
    locks.with(&ride_id, || attach_locked(store, notifier, ride_id, advice));
}

fn attach_locked(
    store: &dyn RecordStore,
    notifier: &dyn NotificationChannel,
    ride_id: RideId,
    advice: RouteAdvice,
) {
    let mut ride = match store.ride(ride_id) {
        Ok(Some(stamped)) => stamped.record,
        Ok(None) => return,
        Err(err) => {
            warn!(ride_id = %ride_id, error = %err, "could not load ride for advice");
            return;
        }
    };
    if ride.state.is_terminal() {
        return;
    }
    let state = ride.state;
    ride.advice = Some(advice);
    if let Err(err) = store.update_ride(ride, state) {
        warn!(ride_id = %ride_id, error = %err, "could not attach advice");
        return;
    }
    if let Err(err) = notifier.publish(DispatchEvent::AdviceAttached { ride_id }) {
        warn!(ride_id = %ride_id, error = %err, "could not publish advice");
    }
}
