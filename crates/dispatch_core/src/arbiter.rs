//! Assignment arbiter.
//!
//! Owns the only shared mutable dispatch state: which captains are busy and which offers
//! are outstanding. Both live behind one mutex that is never held across store or
//! channel calls. An acceptance reserves the captain and marks its offer as accepting
//! before the ride is written, so no other offer can reach the captain and nobody else
//! can resolve the offer until the write settles.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam::channel::{bounded, Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{ConflictReason, DispatchError, Result};
use crate::lifecycle::{self, RideEvent};
use crate::model::{
    CaptainId, Offer, OfferId, RequestId, Ride, RideId, RideRequest, RideState,
    VerificationCode,
};
use crate::notify::{DispatchEvent, NotificationChannel, OfferResolution};
use crate::store::RecordStore;

/// Resolutions remembered so late responses get a precise conflict reason.
const RESOLVED_OFFER_MEMORY: usize = 4_096;

/// What the waiting dispatcher learns about its offer.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    Accepted(Box<Ride>),
    Declined,
    Expired,
    Withdrawn,
}

struct OfferSlot {
    offer: Offer,
    request: RideRequest,
    reply: Sender<OfferOutcome>,
    /// Set while an acceptance writes the ride outside the lock.
    accepting: bool,
    /// How to resolve the offer if that write fails.
    fallback: Option<OfferResolution>,
}

struct Bindings {
    busy: HashMap<CaptainId, RideId>,
    pending: HashMap<OfferId, OfferSlot>,
    by_captain: HashMap<CaptainId, OfferId>,
    by_request: HashMap<RequestId, OfferId>,
    resolved: LruCache<OfferId, OfferResolution>,
}

impl Bindings {
    fn new() -> Self {
        Self {
            busy: HashMap::new(),
            pending: HashMap::new(),
            by_captain: HashMap::new(),
            by_request: HashMap::new(),
            resolved: LruCache::new(
                NonZeroUsize::new(RESOLVED_OFFER_MEMORY).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    /// Remove a pending offer and hand `outcome` to its waiter. Runs at most once per
    /// offer; later calls find no slot and return `None`.
    fn close(
        &mut self,
        offer_id: OfferId,
        resolution: OfferResolution,
        outcome: OfferOutcome,
    ) -> Option<Offer> {
        let slot = self.pending.remove(&offer_id)?;
        self.by_captain.remove(&slot.offer.captain_id);
        self.by_request.remove(&slot.offer.request_id);
        self.resolved.put(offer_id, resolution);
        // the waiter may already have given up
        let _ = slot.reply.try_send(outcome);
        Some(slot.offer)
    }

    fn conflict(&mut self, offer_id: OfferId, captain: &CaptainId) -> DispatchError {
        let reason = match self.resolved.get(&offer_id) {
            Some(OfferResolution::Expired) => ConflictReason::Expired,
            Some(OfferResolution::Withdrawn) => ConflictReason::Withdrawn,
            _ => ConflictReason::AlreadyResolved,
        };
        DispatchError::OfferConflict {
            offer_id,
            captain_id: captain.clone(),
            reason,
        }
    }

    /// Validate a response against a pending offer.
    fn check_response(&mut self, offer_id: OfferId, captain: &CaptainId) -> Result<()> {
        if let Some(slot) = self.pending.get(&offer_id) {
            if &slot.offer.captain_id != captain {
                return Err(DispatchError::Unauthorized {
                    principal: captain.to_string(),
                    action: "respond to another captain's offer",
                });
            }
            if slot.accepting {
                return Err(self.conflict(offer_id, captain));
            }
            return Ok(());
        }
        if self.resolved.contains(&offer_id) {
            return Err(self.conflict(offer_id, captain));
        }
        Err(DispatchError::not_found("offer", offer_id))
    }
}

pub struct Arbiter {
    bindings: Mutex<Bindings>,
    codes: Mutex<StdRng>,
    code_digits: u8,
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn NotificationChannel>,
    clock: Arc<dyn Clock>,
}

impl Arbiter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn NotificationChannel>,
        clock: Arc<dyn Clock>,
        code_digits: u8,
        code_seed: Option<u64>,
    ) -> Self {
        let rng = match code_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            bindings: Mutex::new(Bindings::new()),
            codes: Mutex::new(rng),
            code_digits,
            store,
            notifier,
            clock,
        }
    }

    fn publish(&self, event: DispatchEvent) {
        if let Err(error) = self.notifier.publish(event) {
            warn!(%error, "failed to publish offer event");
        }
    }

    fn publish_resolution(&self, offer: &Offer, resolution: OfferResolution) {
        self.publish(DispatchEvent::OfferResolved {
            offer_id: offer.id,
            request_id: offer.request_id,
            captain_id: offer.captain_id.clone(),
            resolution,
        });
    }

    fn next_code(&self) -> Result<VerificationCode> {
        let digits = u32::from(self.code_digits);
        let upper = 10u64.checked_pow(digits).ok_or_else(|| {
            DispatchError::invalid(format!("{digits}-digit verification codes are not supported"))
        })?;
        let value = self.codes.lock().gen_range(0..upper);
        VerificationCode::new(format!("{value:0width$}", width = digits as usize))
            .ok_or_else(|| DispatchError::invalid("verification code must be numeric"))
    }

    /// Offer `request` to `captain` and wait up to `timeout` for an answer.
    ///
    /// Fails with `OfferConflict` when the captain is busy or already holds an
    /// outstanding offer. An unanswered offer expires exactly once.
    pub fn offer(
        &self,
        request: &RideRequest,
        captain: &CaptainId,
        round: u32,
        timeout: Duration,
        fare_estimate: f64,
    ) -> Result<OfferOutcome> {
        let now = self.clock.now();
        let offer = Offer {
            id: OfferId::new(),
            request_id: request.id,
            captain_id: captain.clone(),
            round,
            created_at: now,
            deadline: now
                + ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::zero()),
            pickup: request.pickup.point,
            fare_estimate,
        };
        let (reply, outcome) = bounded(1);
        {
            let mut bindings = self.bindings.lock();
            let reason = if bindings.busy.contains_key(captain) {
                Some(ConflictReason::CaptainBusy)
            } else if bindings.by_captain.contains_key(captain) {
                Some(ConflictReason::OfferOutstanding)
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(DispatchError::OfferConflict {
                    offer_id: offer.id,
                    captain_id: captain.clone(),
                    reason,
                });
            }
            bindings.by_captain.insert(captain.clone(), offer.id);
            bindings.by_request.insert(request.id, offer.id);
            bindings.pending.insert(
                offer.id,
                OfferSlot {
                    offer: offer.clone(),
                    request: request.clone(),
                    reply,
                    accepting: false,
                    fallback: None,
                },
            );
        }

        debug!(offer_id = %offer.id, captain_id = %captain, round, "offer created");
        if let Err(error) = self.notifier.publish(DispatchEvent::OfferCreated {
            offer: offer.clone(),
        }) {
            // nobody can answer an offer they never saw
            self.bindings.lock().close(
                offer.id,
                OfferResolution::Withdrawn,
                OfferOutcome::Withdrawn,
            );
            return Err(error.into());
        }

        Ok(self.wait(&offer, &outcome, timeout))
    }

    fn wait(&self, offer: &Offer, outcome: &Receiver<OfferOutcome>, timeout: Duration) -> OfferOutcome {
        if let Ok(result) = outcome.recv_timeout(timeout) {
            return result;
        }
        let mut bindings = self.bindings.lock();
        if let Some(slot) = bindings.pending.get_mut(&offer.id) {
            if slot.accepting {
                // the acceptance resolves the offer whether or not its write succeeds
                slot.fallback.get_or_insert(OfferResolution::Expired);
                drop(bindings);
                return outcome.recv().unwrap_or(OfferOutcome::Expired);
            }
        }
        let expired = bindings.close(offer.id, OfferResolution::Expired, OfferOutcome::Expired);
        drop(bindings);
        match expired {
            Some(offer) => {
                info!(offer_id = %offer.id, captain_id = %offer.captain_id, "offer expired");
                self.publish_resolution(&offer, OfferResolution::Expired);
                OfferOutcome::Expired
            }
            // resolved between the timeout and the lock; the outcome is already queued
            None => outcome.try_recv().unwrap_or(OfferOutcome::Expired),
        }
    }

    /// Accept an outstanding offer, creating the ride and binding the captain.
    ///
    /// The captain is reserved before the ride is written. If the write fails the
    /// reservation is dropped and the offer stays open for another attempt, unless it
    /// expired or was withdrawn in the meantime.
    pub fn accept(&self, captain: &CaptainId, offer_id: OfferId) -> Result<Ride> {
        let now = self.clock.now();
        let ride = self.reserve(captain, offer_id, now)?;

        if let Err(error) = self.store.insert_ride(ride.clone()) {
            self.abandon_acceptance(captain, offer_id, ride.id);
            return Err(error.into());
        }

        let offer = self
            .bindings
            .lock()
            .close(
                offer_id,
                OfferResolution::Accepted { ride_id: ride.id },
                OfferOutcome::Accepted(Box::new(ride.clone())),
            )
            .ok_or_else(|| DispatchError::not_found("offer", offer_id))?;

        info!(ride_id = %ride.id, captain_id = %captain, request_id = %offer.request_id, "offer accepted");
        self.publish_resolution(&offer, OfferResolution::Accepted { ride_id: ride.id });
        self.publish(DispatchEvent::RideTransitioned {
            ride_id: ride.id,
            request_id: offer.request_id,
            captain_id: Some(captain.clone()),
            from: RideState::Requested,
            to: ride.state,
            at: now,
        });
        Ok(ride)
    }

    /// Validate an acceptance, build the assigned ride and reserve the captain for it.
    fn reserve(&self, captain: &CaptainId, offer_id: OfferId, now: DateTime<Utc>) -> Result<Ride> {
        let mut bindings = self.bindings.lock();
        bindings.check_response(offer_id, captain)?;
        let slot = bindings
            .pending
            .get(&offer_id)
            .ok_or_else(|| DispatchError::not_found("offer", offer_id))?;
        let request = slot.request.clone();
        let fare_estimate = slot.offer.fare_estimate;

        if now > slot.offer.deadline {
            if let Some(offer) =
                bindings.close(offer_id, OfferResolution::Expired, OfferOutcome::Expired)
            {
                drop(bindings);
                self.publish_resolution(&offer, OfferResolution::Expired);
            }
            return Err(DispatchError::OfferConflict {
                offer_id,
                captain_id: captain.clone(),
                reason: ConflictReason::Expired,
            });
        }
        if bindings.busy.contains_key(captain) {
            return Err(DispatchError::OfferConflict {
                offer_id,
                captain_id: captain.clone(),
                reason: ConflictReason::CaptainBusy,
            });
        }

        let mut ride = Ride::requested(request, fare_estimate);
        lifecycle::apply(
            &mut ride,
            RideEvent::Assign {
                captain: captain.clone(),
                code: self.next_code()?,
            },
            now,
        )?;
        bindings.busy.insert(captain.clone(), ride.id);
        if let Some(slot) = bindings.pending.get_mut(&offer_id) {
            slot.accepting = true;
        }
        Ok(ride)
    }

    fn abandon_acceptance(&self, captain: &CaptainId, offer_id: OfferId, ride_id: RideId) {
        let closed = {
            let mut bindings = self.bindings.lock();
            if bindings.busy.get(captain) == Some(&ride_id) {
                bindings.busy.remove(captain);
            }
            let fallback = bindings.pending.get_mut(&offer_id).and_then(|slot| {
                slot.accepting = false;
                slot.fallback.take()
            });
            fallback.and_then(|resolution| {
                let outcome = match resolution {
                    OfferResolution::Withdrawn => OfferOutcome::Withdrawn,
                    _ => OfferOutcome::Expired,
                };
                bindings
                    .close(offer_id, resolution, outcome)
                    .map(|offer| (offer, resolution))
            })
        };
        warn!(offer_id = %offer_id, captain_id = %captain, "ride write failed, acceptance dropped");
        if let Some((offer, resolution)) = closed {
            self.publish_resolution(&offer, resolution);
        }
    }

    pub fn decline(&self, captain: &CaptainId, offer_id: OfferId) -> Result<()> {
        let offer = {
            let mut bindings = self.bindings.lock();
            bindings.check_response(offer_id, captain)?;
            bindings
                .close(offer_id, OfferResolution::Declined, OfferOutcome::Declined)
                .ok_or_else(|| bindings.conflict(offer_id, captain))?
        };
        info!(offer_id = %offer_id, captain_id = %captain, "offer declined");
        self.publish_resolution(&offer, OfferResolution::Declined);
        Ok(())
    }

    /// Withdraw the outstanding offer for a cancelled request, if any.
    ///
    /// An offer whose acceptance is being written is left to that acceptance; it is
    /// withdrawn only if the write fails.
    pub fn withdraw(&self, request_id: RequestId) -> Option<OfferId> {
        let offer = {
            let mut bindings = self.bindings.lock();
            let offer_id = bindings.by_request.get(&request_id).copied()?;
            if let Some(slot) = bindings.pending.get_mut(&offer_id) {
                if slot.accepting {
                    slot.fallback = Some(OfferResolution::Withdrawn);
                    return None;
                }
            }
            bindings.close(offer_id, OfferResolution::Withdrawn, OfferOutcome::Withdrawn)?
        };
        debug!(offer_id = %offer.id, request_id = %request_id, "offer withdrawn");
        self.publish_resolution(&offer, OfferResolution::Withdrawn);
        Some(offer.id)
    }

    /// Run `commit`, then release the captain's busy flag.
    ///
    /// The flag stays set while `commit` runs, so no offer can reach the captain, and it
    /// is released only when `commit` succeeds. Other captains are never blocked on it.
    pub fn settle<T>(
        &self,
        captain: &CaptainId,
        ride_id: RideId,
        commit: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let value = commit()?;
        let mut bindings = self.bindings.lock();
        if bindings.busy.get(captain) == Some(&ride_id) {
            bindings.busy.remove(captain);
            debug!(captain_id = %captain, ride_id = %ride_id, "captain released");
        }
        Ok(value)
    }

    pub fn is_busy(&self, captain: &CaptainId) -> bool {
        self.bindings.lock().busy.contains_key(captain)
    }

    /// Whether the captain is busy or holds an outstanding offer.
    pub fn is_engaged(&self, captain: &CaptainId) -> bool {
        let bindings = self.bindings.lock();
        bindings.busy.contains_key(captain) || bindings.by_captain.contains_key(captain)
    }

    pub fn busy_ride(&self, captain: &CaptainId) -> Option<RideId> {
        self.bindings.lock().busy.get(captain).copied()
    }

    /// Outstanding offer for a request, if any.
    pub fn pending_offer(&self, request_id: RequestId) -> Option<Offer> {
        let bindings = self.bindings.lock();
        let offer_id = bindings.by_request.get(&request_id)?;
        bindings.pending.get(offer_id).map(|slot| slot.offer.clone())
    }
}
