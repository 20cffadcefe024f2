//! Geographic primitives: coordinates, great-circle distance and an H3 spatial index.
//!
//! This module provides:
//!
//! - **GeoPoint**: validated latitude/longitude pair
//! - **Distance**: Haversine distance between two points
//! - **SpatialIndex**: H3 cell → captain mappings for radius lookups around a pickup
//! - **Corridor cells**: coarse cells used to key route familiarity
//!
//! Captains are indexed at resolution 9 (~240m cells), suitable for city-scale dispatch.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::OnceLock;

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::model::CaptainId;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Resolution captains are indexed at.
pub const INDEX_RESOLUTION: Resolution = Resolution::Nine;

/// Resolution used for pickup/destination corridors (~5km² cells).
pub const CORRIDOR_RESOLUTION: Resolution = Resolution::Seven;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Build a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        let point = Self { lat, lng };
        point.validate()?;
        Ok(point)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(DispatchError::invalid(format!("latitude {} out of range", self.lat)));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(DispatchError::invalid(format!("longitude {} out of range", self.lng)));
        }
        Ok(())
    }

    /// H3 cell containing this point at the given resolution.
    pub fn cell(&self, resolution: Resolution) -> Option<CellIndex> {
        LatLng::new(self.lat, self.lng)
            .ok()
            .map(|ll| ll.to_cell(resolution))
    }

    pub fn index_cell(&self) -> Option<CellIndex> {
        self.cell(INDEX_RESOLUTION)
    }

    pub fn corridor_cell(&self) -> Option<CellIndex> {
        self.cell(CORRIDOR_RESOLUTION)
    }

    /// Short "lat,lng" description for collaborators that take free text.
    pub fn describe(&self) -> String {
        format!("{:.5},{:.5}", self.lat, self.lng)
    }
}

/// Great-circle distance in kilometres.
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Grid disk cache for repeated pickup-radius lookups.
struct GridDiskCache {
    cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GridDiskCache {
    fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(1_000).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        let mut cache = self.cache.lock();
        cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }
}

static GRID_DISK_CACHE: OnceLock<GridDiskCache> = OnceLock::new();

/// Get grid disk with caching.
pub fn grid_disk_cached(origin: CellIndex, k: u32) -> Vec<CellIndex> {
    GRID_DISK_CACHE
        .get_or_init(GridDiskCache::new)
        .get_or_compute(origin, k)
}

/// Spatial index for captain lookups by H3 cell.
///
/// Maintained incrementally as captains report positions, so candidate lookup around a
/// pickup only touches the cells inside the match radius.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    captains_by_cell: HashMap<CellIndex, Vec<CaptainId>>,
    captain_to_cell: HashMap<CaptainId, CellIndex>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a captain at `cell`, moving it if it was indexed elsewhere.
    pub fn upsert(&mut self, captain: &CaptainId, cell: CellIndex) {
        if let Some(old) = self.captain_to_cell.get(captain).copied() {
            if old == cell {
                return;
            }
            self.remove_from_cell(captain, old);
        }
        self.captains_by_cell
            .entry(cell)
            .or_default()
            .push(captain.clone());
        self.captain_to_cell.insert(captain.clone(), cell);
    }

    pub fn remove(&mut self, captain: &CaptainId) {
        if let Some(cell) = self.captain_to_cell.remove(captain) {
            self.remove_from_cell(captain, cell);
        }
    }

    fn remove_from_cell(&mut self, captain: &CaptainId, cell: CellIndex) {
        if let Some(captains) = self.captains_by_cell.get_mut(&cell) {
            captains.retain(|c| c != captain);
            if captains.is_empty() {
                self.captains_by_cell.remove(&cell);
            }
        }
    }

    pub fn cell_of(&self, captain: &CaptainId) -> Option<CellIndex> {
        self.captain_to_cell.get(captain).copied()
    }

    /// Captains indexed within `k` grid steps of `origin`.
    pub fn captains_near(&self, origin: CellIndex, k: u32) -> HashSet<CaptainId> {
        let mut result = HashSet::new();
        for cell in grid_disk_cached(origin, k) {
            if let Some(captains) = self.captains_by_cell.get(&cell) {
                result.extend(captains.iter().cloned());
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.captain_to_cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captain_to_cell.is_empty()
    }
}
