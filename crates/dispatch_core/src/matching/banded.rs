use std::cmp::Ordering;

use crate::geo::{distance_km, GeoPoint};

use super::algorithm::RankingAlgorithm;
use super::types::{Candidate, RankedCandidate, Ranking};

/// Distance-banded ranking with reliability and familiarity adjustments.
///
/// # Algorithm
///
/// 1. Sort candidates by great-circle distance to the pickup (captain id breaks ties).
/// 2. Cut the sorted list into bands: a band holds the closest remaining candidate and
///    every candidate within `band_km` of it.
/// 3. Bands keep their distance order. Inside a band candidates are ordered by
///    `distance - reliability_weight_km * reliability - familiarity_weight_km * min(familiarity, cap)`,
///    then by raw distance, then by captain id.
///
/// Distance is the primary key: a captain in a farther band never outranks one in a
/// closer band. Familiarity only shifts order inside a band.
#[derive(Debug, Clone, Copy)]
pub struct ReliabilityBandedRanking {
    pub band_km: f64,
    pub reliability_weight_km: f64,
    pub familiarity_weight_km: f64,
    pub familiarity_cap: u32,
}

impl ReliabilityBandedRanking {
    pub fn new(band_km: f64, reliability_weight_km: f64, familiarity_weight_km: f64) -> Self {
        Self {
            band_km,
            reliability_weight_km,
            familiarity_weight_km,
            familiarity_cap: 5,
        }
    }

    pub fn with_familiarity_cap(mut self, cap: u32) -> Self {
        self.familiarity_cap = cap;
        self
    }

    fn adjusted_km(&self, distance_km: f64, candidate: &Candidate) -> f64 {
        let reliability = candidate.reliability.clamp(0.0, 1.0);
        let familiarity = f64::from(candidate.familiarity.min(self.familiarity_cap));
        distance_km
            - self.reliability_weight_km * reliability
            - self.familiarity_weight_km * familiarity
    }
}

impl Default for ReliabilityBandedRanking {
    fn default() -> Self {
        Self::new(0.5, 1.0, 0.1)
    }
}

fn by_distance(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| a.captain_id.cmp(&b.captain_id))
}

fn within_band(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    a.adjusted_km
        .total_cmp(&b.adjusted_km)
        .then_with(|| by_distance(a, b))
}

impl RankingAlgorithm for ReliabilityBandedRanking {
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
                    adjusted_km: self.adjusted_km(d, c),
                }
            })
            .collect();
        ranked.sort_by(by_distance);

        let mut start = 0;
        let mut band = 0;
        while start < ranked.len() {
            let limit = ranked[start].distance_km + self.band_km;
            let len = ranked[start..]
                .iter()
                .take_while(|c| c.distance_km <= limit)
                .count();
            let members = &mut ranked[start..start + len];
            for member in members.iter_mut() {
                member.band = band;
            }
            members.sort_by(within_band);
            start += len;
            band += 1;
        }

        Ranking::from_vec(ranked)
    }

    fn name(&self) -> &'static str {
        "reliability_banded"
    }
}
