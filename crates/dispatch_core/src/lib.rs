pub mod advisory;
pub mod arbiter;
pub mod clock;
pub mod config;
pub mod error;
pub mod freshness;
pub mod geo;
pub mod identity;
pub mod lifecycle;
pub mod matching;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod pricing;
pub mod store;
pub mod telemetry;
pub mod workers;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
