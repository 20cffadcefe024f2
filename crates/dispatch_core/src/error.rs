//! Error kinds surfaced by the dispatch core.
//!
//! Ranking and arbitration failures are recovered inside the orchestrator; everything
//! else reaches the caller unchanged. Collaborator errors keep their own types and are
//! folded into [`DispatchError::CollaboratorUnavailable`] at the boundary.

use thiserror::Error;

use crate::lifecycle::RideEventKind;
use crate::model::{CaptainId, OfferId, RideId, RideState};

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Which boundary collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    RecordStore,
    NotificationChannel,
    AdvisoryService,
}

impl std::fmt::Display for Collaborator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Collaborator::RecordStore => "record store",
            Collaborator::NotificationChannel => "notification channel",
            Collaborator::AdvisoryService => "advisory service",
        };
        f.write_str(name)
    }
}

/// Why an offer could not be resolved the way the caller asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The captain is already bound to an active ride.
    CaptainBusy,
    /// The captain already has another offer outstanding.
    OfferOutstanding,
    /// Another response resolved this offer first.
    AlreadyResolved,
    /// The offer deadline passed before the response arrived.
    Expired,
    /// The request was cancelled while the offer was outstanding.
    Withdrawn,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Ranking found nobody eligible for the request.
    #[error("no eligible candidates for the request")]
    NoEligibleCandidates,

    /// The arbiter lost a race; safe to move on to the next candidate.
    #[error("offer {offer_id} for captain {captain_id} conflicted: {reason:?}")]
    OfferConflict {
        offer_id: OfferId,
        captain_id: CaptainId,
        reason: ConflictReason,
    },

    /// The lifecycle state machine rejected the event.
    #[error("illegal transition: {event:?} is not allowed from {from:?}")]
    IllegalTransition {
        ride_id: RideId,
        from: RideState,
        event: RideEventKind,
    },

    /// The supplied start code did not match the stored one.
    #[error("verification code mismatch on ride {ride_id} (failed attempts: {failed_attempts})")]
    VerificationMismatch { ride_id: RideId, failed_attempts: u32 },

    /// A position older than the freshness window was used where freshness is required.
    #[error("stale position for captain {captain_id} (age {age_ms:?} ms)")]
    StaleDataRejected {
        captain_id: CaptainId,
        /// `None` when the report carries no resolvable instant.
        age_ms: Option<i64>,
    },

    /// A boundary collaborator failed; nothing was applied.
    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        collaborator: Collaborator,
        message: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("principal {principal} may not {action}")]
    Unauthorized {
        principal: String,
        action: &'static str,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl DispatchError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        DispatchError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        DispatchError::InvalidInput(message.into())
    }

    /// True for errors the orchestrator absorbs by moving to the next candidate.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            DispatchError::OfferConflict { .. }
                | DispatchError::NoEligibleCandidates
                | DispatchError::StaleDataRejected { .. }
        )
    }
}
