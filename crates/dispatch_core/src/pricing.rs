//! Fare estimates per service class.

use serde::{Deserialize, Serialize};

use crate::geo::{distance_km, GeoPoint};
use crate::model::ServiceClass;

/// Base fare plus per-kilometre rate for one service class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub base_fare: f64,
    pub per_km_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub bike: Tariff,
    pub auto: Tariff,
    pub cab: Tariff,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            bike: Tariff {
                base_fare: 75.0,
                per_km_rate: 8.0,
            },
            auto: Tariff {
                base_fare: 120.0,
                per_km_rate: 12.0,
            },
            cab: Tariff {
                base_fare: 180.0,
                per_km_rate: 16.0,
            },
        }
    }
}

impl PricingTable {
    pub fn tariff(&self, class: ServiceClass) -> Tariff {
        match class {
            ServiceClass::Bike => self.bike,
            ServiceClass::Auto => self.auto,
            ServiceClass::Cab => self.cab,
        }
    }

    /// Estimate a fare for a trip.
    ///
    /// Formula: `round(base_fare + distance_km * per_km_rate)` over the great-circle
    /// distance between pickup and destination.
    pub fn estimate(&self, class: ServiceClass, pickup: GeoPoint, destination: GeoPoint) -> f64 {
        let tariff = self.tariff(class);
        let km = distance_km(pickup, destination);
        (tariff.base_fare + km * tariff.per_km_rate).round()
    }
}
