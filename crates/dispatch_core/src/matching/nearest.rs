use crate::geo::{distance_km, GeoPoint};

use super::algorithm::RankingAlgorithm;
use super::types::{Candidate, RankedCandidate, Ranking};

/// Nearest-first ranking: distance only, ties broken by captain id.
///
/// Baseline for comparisons with the banded ranking; ignores reliability and
/// familiarity entirely.
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestFirstRanking;

impl RankingAlgorithm for NearestFirstRanking {
    fn rank(&self, pickup: GeoPoint, candidates: &[Candidate]) -> Ranking {
        let mut ranked: Vec<RankedCandidate> = candidates
            .iter()
            .map(|c| {
                let d = distance_km(c.position, pickup);
                RankedCandidate {
                    captain_id: c.captain_id.clone(),
                    distance_km: d,
                    reliability: c.reliability,
                    familiarity: c.familiarity,
                    band: 0,
                    adjusted_km: d,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.captain_id.cmp(&b.captain_id))
        });
        Ranking::from_vec(ranked)
    }

    fn name(&self) -> &'static str {
        "nearest_first"
    }
}
