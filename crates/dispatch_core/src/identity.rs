//! Authenticated principals supplied by the identity provider.
//!
//! The core trusts the id and role it is handed; it only checks that the principal is
//! allowed to act on a given ride.

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::model::{CaptainId, RequesterId, Ride};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Rider,
    Captain,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn rider(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Rider,
        }
    }

    pub fn captain(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Captain,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    /// Internal principal used for policy-driven actions (e.g. abandonment sweeps).
    pub fn system() -> Self {
        Self::admin("system")
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn as_captain(&self) -> Option<CaptainId> {
        (self.role == Role::Captain).then(|| CaptainId::from(self.id.as_str()))
    }

    pub fn as_requester(&self) -> Option<RequesterId> {
        (self.role == Role::Rider).then(|| RequesterId::from(self.id.as_str()))
    }

    pub fn deny(&self, action: &'static str) -> DispatchError {
        DispatchError::Unauthorized {
            principal: self.id.clone(),
            action,
        }
    }

    pub fn is_assigned_captain(&self, ride: &Ride) -> bool {
        self.role == Role::Captain && ride.captain.as_ref().map(|c| c.as_str()) == Some(self.id.as_str())
    }

    pub fn is_requester(&self, ride: &Ride) -> bool {
        self.role == Role::Rider && ride.request.requester.as_str() == self.id
    }

    /// Admins, or the captain acting on itself.
    pub fn require_captain_self(&self, captain: &CaptainId, action: &'static str) -> Result<()> {
        if self.is_admin() || self.as_captain().as_ref() == Some(captain) {
            Ok(())
        } else {
            Err(self.deny(action))
        }
    }
}
