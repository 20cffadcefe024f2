use crate::geo::GeoPoint;

use super::types::{Candidate, Ranking};

/// Trait for ranking algorithms that order eligible captains for one pickup.
pub trait RankingAlgorithm: Send + Sync {
    /// Produce a total order over `candidates`, best first.
    ///
    /// Candidates are already filtered for freshness, approval, class and availability.
    /// Implementations must be deterministic: equal inputs give equal orders regardless
    /// of the input order.
    fn rank(&self, pickup: GeoPoint, candidates: &[Candidate]) -> Ranking;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
