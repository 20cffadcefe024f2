//! Candidate ranking engine.

pub mod algorithm;
pub mod banded;
pub mod familiarity;
pub mod nearest;
pub mod types;

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::freshness::FreshnessFilter;
use crate::model::{Captain, CaptainId, RideRequest};

pub use algorithm::RankingAlgorithm;
pub use banded::ReliabilityBandedRanking;
pub use familiarity::{Corridor, FamiliarityIndex};
pub use nearest::NearestFirstRanking;
pub use types::{Candidate, RankedCandidate, Ranking};

/// Build the default ranking algorithm from config.
pub fn ranking_from_config(config: &DispatchConfig) -> Box<dyn RankingAlgorithm> {
    Box::new(
        ReliabilityBandedRanking::new(
            config.distance_band_km,
            config.reliability_weight_km,
            config.familiarity_weight_km,
        )
        .with_familiarity_cap(config.familiarity_cap),
    )
}

/// Narrow a captain pool to the candidates that may be offered `request`.
///
/// A captain is eligible when it is live per `filter` at this instant, its vehicle
/// serves the requested class, and `excluded` does not reject it (busy, already offered
/// this request, ...).
pub fn eligible_candidates<'a, I, F>(
    request: &RideRequest,
    captains: I,
    filter: &FreshnessFilter,
    clock: &dyn Clock,
    allow_upgrade: bool,
    familiarity: &FamiliarityIndex,
    excluded: F,
) -> Vec<Candidate>
where
    I: IntoIterator<Item = &'a Captain>,
    F: Fn(&CaptainId) -> bool,
{
    let corridor = Corridor::of(request);
    captains
        .into_iter()
        .filter(|captain| filter.captain(captain, clock).is_live())
        .filter(|captain| {
            captain
                .vehicle
                .is_some_and(|vehicle| vehicle.serves(request.service_class, allow_upgrade))
        })
        .filter(|captain| !excluded(&captain.id))
        .filter_map(|captain| {
            Some(Candidate {
                captain_id: captain.id.clone(),
                position: captain.position?,
                reliability: captain.reliability,
                familiarity: familiarity.trips(corridor, &captain.id),
            })
        })
        .collect()
}
