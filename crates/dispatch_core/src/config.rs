use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::pricing::PricingTable;

/// Default staleness window for captain positions (15 s).
pub const DEFAULT_FRESHNESS_WINDOW_MS: u64 = 15_000;

/// What to do with a ride whose captain stops reporting positions mid-ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AbandonmentPolicy {
    /// Wait for a manual cancellation report.
    #[default]
    Manual,
    /// Cancel with `TripAborted(ConnectivityLost)` once the captain's position has been
    /// stale for at least `stale_ms`.
    AutoCancelAfter { stale_ms: u64 },
}

/// Tunables for dispatch. Every field has a default, so a JSON file only needs the
/// fields it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub freshness_window_ms: u64,
    /// How long a captain has to answer an offer.
    pub offer_timeout_ms: u64,
    /// Maximum offers made for one request before it is marked unmatched.
    pub max_offer_rounds: u32,
    /// H3 grid radius (resolution 9 cells) searched around the pickup.
    pub match_radius_cells: u32,
    /// Width of a ranking distance band.
    pub distance_band_km: f64,
    /// Kilometres of distance one unit of reliability offsets inside a band.
    pub reliability_weight_km: f64,
    /// Kilometres of distance one prior trip in the requester's corridor offsets.
    pub familiarity_weight_km: f64,
    /// Familiarity counts above this value give no further boost.
    pub familiarity_cap: u32,
    pub allow_class_upgrade: bool,
    pub verification_code_digits: u8,
    /// Seed for verification codes; `None` seeds from entropy.
    pub code_seed: Option<u64>,
    pub abandonment: AbandonmentPolicy,
    pub advisory_timeout_ms: u64,
    pub workers: usize,
    pub pricing: PricingTable,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: DEFAULT_FRESHNESS_WINDOW_MS,
            offer_timeout_ms: 15_000,
            max_offer_rounds: 5,
            match_radius_cells: 30,
            distance_band_km: 0.5,
            reliability_weight_km: 1.0,
            familiarity_weight_km: 0.1,
            familiarity_cap: 5,
            allow_class_upgrade: false,
            verification_code_digits: 4,
            code_seed: None,
            abandonment: AbandonmentPolicy::Manual,
            advisory_timeout_ms: 5_000,
            workers: 4,
            pricing: PricingTable::default(),
        }
    }
}

impl DispatchConfig {
    /// Load a config from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|error| {
            DispatchError::invalid(format!("failed to read {}: {error}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| DispatchError::invalid(format!("invalid config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.freshness_window_ms == 0 {
            return Err(DispatchError::invalid("freshness_window_ms must be positive"));
        }
        if self.offer_timeout_ms == 0 {
            return Err(DispatchError::invalid("offer_timeout_ms must be positive"));
        }
        if self.max_offer_rounds == 0 {
            return Err(DispatchError::invalid("max_offer_rounds must be positive"));
        }
        if !(4..=8).contains(&self.verification_code_digits) {
            return Err(DispatchError::invalid(
                "verification_code_digits must be between 4 and 8",
            ));
        }
        for (name, value) in [
            ("distance_band_km", self.distance_band_km),
            ("reliability_weight_km", self.reliability_weight_km),
            ("familiarity_weight_km", self.familiarity_weight_km),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DispatchError::invalid(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }
        if self.workers == 0 {
            return Err(DispatchError::invalid("workers must be positive"));
        }
        Ok(())
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn advisory_timeout(&self) -> Duration {
        Duration::from_millis(self.advisory_timeout_ms)
    }

    pub fn with_offer_timeout_ms(mut self, ms: u64) -> Self {
        self.offer_timeout_ms = ms;
        self
    }

    pub fn with_max_offer_rounds(mut self, rounds: u32) -> Self {
        self.max_offer_rounds = rounds;
        self
    }

    pub fn with_freshness_window_ms(mut self, ms: u64) -> Self {
        self.freshness_window_ms = ms;
        self
    }

    pub fn with_code_seed(mut self, seed: u64) -> Self {
        self.code_seed = Some(seed);
        self
    }

    pub fn with_abandonment(mut self, policy: AbandonmentPolicy) -> Self {
        self.abandonment = policy;
        self
    }

    pub fn with_class_upgrade(mut self, allow: bool) -> Self {
        self.allow_class_upgrade = allow;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_match_radius_cells(mut self, cells: u32) -> Self {
        self.match_radius_cells = cells;
        self
    }
}
