//! Change notification boundary.
//!
//! The core publishes offers, ride transitions and captain moves. Subscribers listen per
//! ride, per captain, per request, or to everything. Events never carry verification
//! codes.

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::error::{Collaborator, DispatchError};
use crate::geo::GeoPoint;
use crate::model::{CaptainId, Offer, OfferId, RequestId, RideId, RideState};

/// How an offer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum OfferResolution {
    Accepted { ride_id: RideId },
    Declined,
    Expired,
    /// The request was cancelled while the offer was outstanding.
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    OfferCreated {
        offer: Offer,
    },
    OfferResolved {
        offer_id: OfferId,
        request_id: RequestId,
        captain_id: CaptainId,
        resolution: OfferResolution,
    },
    RideTransitioned {
        ride_id: RideId,
        request_id: RequestId,
        captain_id: Option<CaptainId>,
        from: RideState,
        to: RideState,
        at: DateTime<Utc>,
    },
    RequestUnmatched {
        request_id: RequestId,
        rounds: u32,
    },
    RequestCancelled {
        request_id: RequestId,
    },
    CaptainMoved {
        captain_id: CaptainId,
        position: GeoPoint,
        reported_at: DateTime<Utc>,
    },
    AdviceAttached {
        ride_id: RideId,
    },
}

/// Subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Ride(RideId),
    Captain(CaptainId),
    Request(RequestId),
    All,
}

impl DispatchEvent {
    /// Topics this event is delivered on. Always includes [`Topic::All`].
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::All];
        match self {
            DispatchEvent::OfferCreated { offer } => {
                topics.push(Topic::Captain(offer.captain_id.clone()));
                topics.push(Topic::Request(offer.request_id));
            }
            DispatchEvent::OfferResolved {
                request_id,
                captain_id,
                resolution,
                ..
            } => {
                topics.push(Topic::Captain(captain_id.clone()));
                topics.push(Topic::Request(*request_id));
                if let OfferResolution::Accepted { ride_id } = resolution {
                    topics.push(Topic::Ride(*ride_id));
                }
            }
            DispatchEvent::RideTransitioned {
                ride_id,
                request_id,
                captain_id,
                ..
            } => {
                topics.push(Topic::Ride(*ride_id));
                topics.push(Topic::Request(*request_id));
                if let Some(captain_id) = captain_id {
                    topics.push(Topic::Captain(captain_id.clone()));
                }
            }
            DispatchEvent::RequestUnmatched { request_id, .. }
            | DispatchEvent::RequestCancelled { request_id } => {
                topics.push(Topic::Request(*request_id));
            }
            DispatchEvent::CaptainMoved { captain_id, .. } => {
                topics.push(Topic::Captain(captain_id.clone()));
            }
            DispatchEvent::AdviceAttached { ride_id } => {
                topics.push(Topic::Ride(*ride_id));
            }
        }
        topics
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

impl From<NotifyError> for DispatchError {
    fn from(error: NotifyError) -> Self {
        DispatchError::CollaboratorUnavailable {
            collaborator: Collaborator::NotificationChannel,
            message: error.to_string(),
        }
    }
}

pub trait NotificationChannel: Send + Sync {
    fn publish(&self, event: DispatchEvent) -> Result<(), NotifyError>;
}

/// Fan-out to in-process subscribers over crossbeam channels.
///
/// Dropped receivers are pruned on the next publish.
#[derive(Default)]
pub struct InMemoryChannel {
    subscribers: RwLock<Vec<(Topic, Sender<DispatchEvent>)>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Receiver<DispatchEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.write().push((topic, tx));
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl NotificationChannel for InMemoryChannel {
    fn publish(&self, event: DispatchEvent) -> Result<(), NotifyError> {
        let topics = event.topics();
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (topic, tx) in subscribers.iter() {
                if topics.contains(topic) && tx.send(event.clone()).is_err() {
                    closed.push(tx.clone());
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|(_, tx)| !closed.iter().any(|c| c.same_channel(tx)));
            tracing::debug!(pruned = closed.len(), "pruned closed subscribers");
        }
        Ok(())
    }
}
