use serde::Serialize;

use crate::error::{DispatchError, Result};
use crate::geo::GeoPoint;
use crate::model::CaptainId;

/// An eligible captain handed to a ranking algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub captain_id: CaptainId,
    pub position: GeoPoint,
    pub reliability: f64,
    /// Completed trips in the requester's corridor.
    pub familiarity: u32,
}

/// A candidate with the scoring information that placed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub captain_id: CaptainId,
    pub distance_km: f64,
    pub reliability: f64,
    pub familiarity: u32,
    /// Distance band index, 0 = closest band.
    pub band: u32,
    /// Distance after reliability and familiarity adjustments; only compared within a band.
    pub adjusted_km: f64,
}

/// Ranking output. An empty eligible set is a result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    Ranked(Vec<RankedCandidate>),
    NoCandidates,
}

impl Ranking {
    pub fn from_vec(ranked: Vec<RankedCandidate>) -> Self {
        if ranked.is_empty() {
            Ranking::NoCandidates
        } else {
            Ranking::Ranked(ranked)
        }
    }

    pub fn best(&self) -> Option<&RankedCandidate> {
        match self {
            Ranking::Ranked(ranked) => ranked.first(),
            Ranking::NoCandidates => None,
        }
    }

    pub fn captain_ids(&self) -> Vec<CaptainId> {
        match self {
            Ranking::Ranked(ranked) => ranked.iter().map(|c| c.captain_id.clone()).collect(),
            Ranking::NoCandidates => Vec::new(),
        }
    }

    /// Convert to `NoEligibleCandidates` for callers that need at least one candidate.
    pub fn into_result(self) -> Result<Vec<RankedCandidate>> {
        match self {
            Ranking::Ranked(ranked) => Ok(ranked),
            Ranking::NoCandidates => Err(DispatchError::NoEligibleCandidates),
        }
    }
}
