//! Ranking and eligibility benchmarks using Criterion.rs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dispatch_core::clock::ManualClock;
use dispatch_core::freshness::FreshnessFilter;
use dispatch_core::matching::{
    eligible_candidates, Candidate, FamiliarityIndex, NearestFirstRanking, RankingAlgorithm,
    ReliabilityBandedRanking,
};
use dispatch_core::model::{CaptainId, ServiceClass};
use dispatch_core::test_helpers::{captain_at, offset_km, test_pickup, test_request};

fn candidates(count: usize) -> Vec<Candidate> {
    let pickup = test_pickup();
    (0..count)
        .map(|i| {
            let north = (i % 37) as f64 * 0.11;
            let east = (i % 23) as f64 * 0.07;
            Candidate {
                captain_id: CaptainId(format!("c{i}")),
                position: offset_km(pickup, north, east),
                reliability: (i % 10) as f64 / 10.0,
                familiarity: (i % 4) as u32,
            }
        })
        .collect()
}

fn bench_ranking_algorithms(c: &mut Criterion) {
    let pickup = test_pickup();
    let banded = ReliabilityBandedRanking::default();
    let nearest = NearestFirstRanking;

    let mut group = c.benchmark_group("ranking_algorithms");
    for size in [10usize, 100, 1_000] {
        let pool = candidates(size);
        group.bench_with_input(BenchmarkId::new("banded", size), &pool, |b, pool| {
            b.iter(|| black_box(banded.rank(pickup, pool)));
        });
        group.bench_with_input(BenchmarkId::new("nearest", size), &pool, |b, pool| {
            b.iter(|| black_box(nearest.rank(pickup, pool)));
        });
    }
    group.finish();
}

fn bench_eligibility(c: &mut Criterion) {
    let clock = ManualClock::fixed();
    let filter = FreshnessFilter::new(15_000);
    let familiarity = FamiliarityIndex::new();
    let request = test_request("r1", ServiceClass::Bike, &clock);
    let captains: Vec<_> = (0..1_000)
        .map(|i| captain_at(&format!("c{i}"), (i % 50) as f64 * 0.1, 0.5, &clock))
        .collect();

    c.bench_function("eligible_candidates_1000", |b| {
        b.iter(|| {
            black_box(eligible_candidates(
                &request,
                captains.iter(),
                &filter,
                &clock,
                false,
                &familiarity,
                |_| false,
            ))
        });
    });
}

criterion_group!(benches, bench_ranking_algorithms, bench_eligibility);
criterion_main!(benches);
