//! Scripted dispatch scenarios.
//!
//! A scenario file lists captains (with how their app answers offers) and ride
//! requests. Running it registers the captains, dispatches every request on the worker
//! pool and, optionally, drives each matched ride through pickup and drop-off.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use dispatch_core::clock::{Clock, ReportedAt, SystemClock};
use dispatch_core::config::DispatchConfig;
use dispatch_core::error::DispatchError;
use dispatch_core::geo::GeoPoint;
use dispatch_core::identity::Principal;
use dispatch_core::matching::RankedCandidate;
use dispatch_core::model::{Captain, CaptainId, OfferReply, Place, RequestId, Ride, ServiceClass};
use dispatch_core::notify::{DispatchEvent, InMemoryChannel, Topic};
use dispatch_core::orchestrator::{DispatchOutcome, Dispatcher};
use dispatch_core::telemetry::DispatchTelemetry;
use dispatch_core::workers::DispatchWorkers;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// How a scripted captain app answers offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    #[default]
    Accept,
    Decline,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioCaptain {
    pub id: String,
    pub class: ServiceClass,
    pub lat: f64,
    pub lng: f64,
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    #[serde(default)]
    pub behavior: Behavior,
    /// Age of the captain's last position report when the scenario starts.
    #[serde(default)]
    pub report_age_ms: i64,
}

fn default_reliability() -> f64 {
    0.75
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioPlace {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub label: Option<String>,
}

impl ScenarioPlace {
    fn to_place(&self) -> Result<Place, DispatchError> {
        let point = GeoPoint::new(self.lat, self.lng)?;
        Ok(match &self.label {
            Some(label) => Place::labelled(point, label.clone()),
            None => Place::new(point),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub rider: String,
    pub class: ServiceClass,
    pub pickup: ScenarioPlace,
    pub destination: ScenarioPlace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub captains: Vec<ScenarioCaptain>,
    pub requests: Vec<ScenarioRequest>,
    /// Drive matched rides through arrival, start and completion.
    #[serde(default)]
    pub complete_rides: bool,
}

impl Scenario {
    pub fn from_json_file(path: &Path) -> Result<Self, ScenarioError> {
        let raw = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestReport {
    Matched { request_id: RequestId, ride: Box<Ride> },
    Unmatched { request_id: RequestId, rounds: u32 },
    Cancelled { request_id: RequestId },
    AlreadyDispatching { request_id: RequestId },
    Failed { request_id: RequestId, error: String },
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub requests: Vec<RequestReport>,
    pub telemetry: DispatchTelemetry,
    pub acceptance_rate: Option<f64>,
    pub mean_time_to_match_ms: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct RankReport {
    pub rider: String,
    pub candidates: Vec<RankedCandidate>,
}

/// Answers offers for one captain until dropped.
struct ScriptedCaptain {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScriptedCaptain {
    fn spawn(
        dispatcher: Arc<Dispatcher>,
        channel: &InMemoryChannel,
        id: &str,
        behavior: Behavior,
    ) -> Self {
        let events = channel.subscribe(Topic::Captain(CaptainId::from(id)));
        let principal = Principal::captain(id);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                let Ok(DispatchEvent::OfferCreated { offer }) =
                    events.recv_timeout(Duration::from_millis(25))
                else {
                    continue;
                };
                let reply = match behavior {
                    Behavior::Accept => OfferReply::Accept,
                    Behavior::Decline => OfferReply::Decline,
                    Behavior::Ignore => continue,
                };
                if let Err(err) = dispatcher.respond_to_offer(&principal, offer.id, reply) {
                    warn!(captain_id = %principal.id, error = %err, "offer response rejected");
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for ScriptedCaptain {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Setup {
    dispatcher: Arc<Dispatcher>,
    channel: Arc<InMemoryChannel>,
    requests: Vec<(String, RequestId)>,
}

fn setup(scenario: &Scenario, config: DispatchConfig) -> Result<Setup, ScenarioError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let channel = Arc::new(InMemoryChannel::new());
    let dispatcher = Arc::new(
        Dispatcher::builder(config)
            .clock(Arc::clone(&clock))
            .notifier(channel.clone())
            .build()?,
    );

    let ops = Principal::admin("scenario");
    for entry in &scenario.captains {
        let mut captain = Captain::new(entry.id.as_str(), entry.class);
        captain.online = true;
        captain.reliability = entry.reliability;
        captain.position = Some(GeoPoint::new(entry.lat, entry.lng)?);
        captain.reported_at = Some(ReportedAt::wall_clock(
            clock.now() - chrono::Duration::milliseconds(entry.report_age_ms),
        ));
        dispatcher.register_captain(&ops, captain)?;
    }

    let mut requests = Vec::with_capacity(scenario.requests.len());
    for entry in &scenario.requests {
        let request_id = dispatcher.request_ride(
            &Principal::rider(entry.rider.as_str()),
            entry.pickup.to_place()?,
            entry.destination.to_place()?,
            entry.class,
        )?;
        requests.push((entry.rider.clone(), request_id));
    }

    Ok(Setup {
        dispatcher,
        channel,
        requests,
    })
}

/// Rank every request without sending offers.
pub fn rank(scenario: &Scenario, config: DispatchConfig) -> Result<Vec<RankReport>, ScenarioError> {
    let Setup {
        dispatcher,
        requests,
        ..
    } = setup(scenario, config)?;
    requests
        .into_iter()
        .map(|(rider, request_id)| -> Result<RankReport, ScenarioError> {
            let candidates = dispatcher
                .rank_candidates(request_id)?
                .into_result()
                .unwrap_or_default();
            Ok(RankReport { rider, candidates })
        })
        .collect()
}

/// Dispatch every request and report outcomes and telemetry.
pub fn run(scenario: &Scenario, config: DispatchConfig) -> Result<RunReport, ScenarioError> {
    let workers = config.workers;
    let Setup {
        dispatcher,
        channel,
        requests,
    } = setup(scenario, config)?;

    let captains: Vec<_> = scenario
        .captains
        .iter()
        .map(|entry| {
            ScriptedCaptain::spawn(Arc::clone(&dispatcher), &channel, &entry.id, entry.behavior)
        })
        .collect();

    let pool = DispatchWorkers::start(Arc::clone(&dispatcher), workers)?;
    for (_, request_id) in &requests {
        pool.submit(*request_id)?;
    }
    let mut reports = pool.shutdown();
    drop(captains);
    reports.sort_by_key(|report| {
        requests
            .iter()
            .position(|(_, id)| *id == report.request_id)
            .unwrap_or(usize::MAX)
    });

    let mut out = Vec::with_capacity(reports.len());
    for report in reports {
        let request_id = report.request_id;
        let entry = match report.result {
            Ok(DispatchOutcome::Matched(ride)) if scenario.complete_rides => {
                match drive_to_completion(&dispatcher, &ride) {
                    Ok(done) => RequestReport::Matched {
                        request_id,
                        ride: Box::new(done),
                    },
                    Err(err) => RequestReport::Failed {
                        request_id,
                        error: err.to_string(),
                    },
                }
            }
            Ok(DispatchOutcome::Matched(mut ride)) => {
                ride.verification_code = None;
                RequestReport::Matched { request_id, ride }
            }
            Ok(DispatchOutcome::Unmatched { rounds, .. }) => {
                RequestReport::Unmatched { request_id, rounds }
            }
            Ok(DispatchOutcome::Cancelled { .. }) => RequestReport::Cancelled { request_id },
            Ok(DispatchOutcome::AlreadyDispatching { .. }) => {
                RequestReport::AlreadyDispatching { request_id }
            }
            Err(err) => RequestReport::Failed {
                request_id,
                error: err.to_string(),
            },
        };
        out.push(entry);
    }

    let telemetry = dispatcher.telemetry();
    info!(
        requests = out.len(),
        completed = telemetry.counts.rides_completed,
        unmatched = telemetry.counts.unmatched_requests,
        "scenario finished"
    );
    Ok(RunReport {
        requests: out,
        acceptance_rate: telemetry.acceptance_rate(),
        mean_time_to_match_ms: telemetry.mean_time_to_match_ms(),
        telemetry,
    })
}

fn drive_to_completion(dispatcher: &Dispatcher, ride: &Ride) -> Result<Ride, DispatchError> {
    let captain_id = ride
        .captain
        .clone()
        .ok_or_else(|| DispatchError::invalid("matched ride has no captain"))?;
    let captain = Principal::captain(captain_id.as_str());
    let rider = Principal::rider(ride.request.requester.as_str());

    dispatcher.report_arrival(&captain, ride.id)?;
    let code = dispatcher
        .ride(&rider, ride.id)?
        .verification_code
        .map(|code| code.reveal().to_string())
        .ok_or_else(|| DispatchError::invalid("ride has no verification code"))?;
    dispatcher.verify_start(&rider, ride.id, &code)?;
    let mut done = dispatcher.complete_ride(&captain, ride.id, ride.fare_estimate)?;
    // reports are printed; keep codes out of them
    done.verification_code = None;
    Ok(done)
}
