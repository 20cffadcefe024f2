//! Optional advisory route service.
//!
//! Advice is attached to a matched ride for display only. It never influences ranking,
//! arbitration or lifecycle transitions, and a slow or failing advisor never delays them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{distance_km, GeoPoint};

/// Suggested route for a matched ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAdvice {
    pub route_summary: String,
    pub estimated_arrival: String,
    pub traffic_conditions: String,
    pub choke_points: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory service unavailable: {0}")]
    Unavailable(String),
    #[error("advisory service timed out")]
    TimedOut,
}

/// Trait for route advisory backends. Must be `Send + Sync`; calls happen on
/// detached threads.
pub trait RouteAdvisor: Send + Sync {
    /// Suggest a route between two free-text locations.
    fn advise(&self, start: &str, destination: &str) -> Result<RouteAdvice, AdvisoryError>;
}

/// Average city speed for straight-line ETA hints (km/h).
const AVG_CITY_SPEED_KMH: f64 = 25.0;

/// Offline advisor: straight-line summary with a fixed-speed ETA.
#[derive(Debug, Clone)]
pub struct StraightLineAdvisor {
    pub from: GeoPoint,
    pub to: GeoPoint,
}

impl StraightLineAdvisor {
    pub fn eta_minutes(from: GeoPoint, to: GeoPoint) -> u32 {
        let km = distance_km(from, to);
        ((km / AVG_CITY_SPEED_KMH) * 60.0).ceil().max(1.0) as u32
    }
}

impl RouteAdvisor for StraightLineAdvisor {
    fn advise(&self, start: &str, destination: &str) -> Result<RouteAdvice, AdvisoryError> {
        let km = distance_km(self.from, self.to);
        Ok(RouteAdvice {
            route_summary: format!("{start} to {destination}, {km:.1} km direct"),
            estimated_arrival: format!("{} min", Self::eta_minutes(self.from, self.to)),
            traffic_conditions: "unknown".to_string(),
            choke_points: Vec::new(),
        })
    }
}

/// Advisor that always returns the same advice. Useful for scripted runs.
#[derive(Debug, Clone)]
pub struct FixedAdvisor(pub RouteAdvice);

impl RouteAdvisor for FixedAdvisor {
    fn advise(&self, _start: &str, _destination: &str) -> Result<RouteAdvice, AdvisoryError> {
        Ok(self.0.clone())
    }
}
