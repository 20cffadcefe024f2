use std::collections::HashMap;

use h3o::CellIndex;
use parking_lot::RwLock;

use crate::model::{CaptainId, RideRequest};

/// Pickup and destination corridor cells of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Corridor {
    pub from: CellIndex,
    pub to: CellIndex,
}

impl Corridor {
    pub fn of(request: &RideRequest) -> Option<Self> {
        Some(Self {
            from: request.pickup.point.corridor_cell()?,
            to: request.destination.point.corridor_cell()?,
        })
    }
}

/// Completed trips per captain per corridor. Fed by ride completions.
#[derive(Debug, Default)]
pub struct FamiliarityIndex {
    trips: RwLock<HashMap<Corridor, HashMap<CaptainId, u32>>>,
}

impl FamiliarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_trip(&self, corridor: Corridor, captain: &CaptainId) {
        let mut trips = self.trips.write();
        let count = trips
            .entry(corridor)
            .or_default()
            .entry(captain.clone())
            .or_insert(0);
        *count = count.saturating_add(1);
    }

    pub fn trips(&self, corridor: Option<Corridor>, captain: &CaptainId) -> u32 {
        let Some(corridor) = corridor else {
            return 0;
        };
        self.trips
            .read()
            .get(&corridor)
            .and_then(|by_captain| by_captain.get(captain))
            .copied()
            .unwrap_or(0)
    }
}
