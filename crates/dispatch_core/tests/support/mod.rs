#![allow(dead_code)]

pub mod collaborators;
pub mod responder;

use std::sync::Arc;

use dispatch_core::advisory::RouteAdvisor;
use dispatch_core::clock::{Clock, ManualClock, ReportedAt};
use dispatch_core::config::DispatchConfig;
use dispatch_core::geo::GeoPoint;
use dispatch_core::identity::Principal;
use dispatch_core::model::{Captain, Place, RequestId, ServiceClass};
use dispatch_core::notify::{InMemoryChannel, NotificationChannel};
use dispatch_core::orchestrator::Dispatcher;
use dispatch_core::store::{InMemoryStore, RecordStore};
use dispatch_core::test_helpers::{offset_km, test_pickup};

use collaborators::{FlakyChannel, FlakyStore};

pub fn ops() -> Principal {
    Principal::admin("ops")
}

/// Config for tests: short offer timeout, fixed code seed.
pub fn test_config() -> DispatchConfig {
    DispatchConfig::default()
        .with_offer_timeout_ms(2_000)
        .with_code_seed(7)
}

/// Everything a dispatch integration test touches.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub channel: Arc<InMemoryChannel>,
    pub store: Arc<FlakyStore>,
    pub notifier: Arc<FlakyChannel>,
    pub dispatcher: Arc<Dispatcher>,
}

pub struct HarnessBuilder {
    config: DispatchConfig,
    advisor: Option<Arc<dyn RouteAdvisor>>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            config: test_config(),
            advisor: None,
        }
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn RouteAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::fixed());
        let channel = Arc::new(InMemoryChannel::new());
        let store = Arc::new(FlakyStore::new(InMemoryStore::new(clock.clone())));
        let notifier = Arc::new(FlakyChannel::new(channel.clone()));

        let mut builder = Dispatcher::builder(self.config)
            .clock(clock.clone())
            .store(store.clone() as Arc<dyn RecordStore>)
            .notifier(notifier.clone() as Arc<dyn NotificationChannel>);
        if let Some(advisor) = self.advisor {
            builder = builder.advisor(advisor);
        }
        let dispatcher = Arc::new(builder.build().expect("valid config"));

        Harness {
            clock,
            channel,
            store,
            notifier,
            dispatcher,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    /// Register `captain` as an admin and return the stored record.
    pub fn register(&self, captain: Captain) -> Captain {
        self.dispatcher
            .register_captain(&ops(), captain)
            .expect("register captain")
    }

    /// Online Bike captain `north_km` north of the pickup, reporting now.
    pub fn captain_north(&self, id: &str, north_km: f64, reliability: f64) -> Captain {
        self.register(
            CaptainBuilder::new(id)
                .north_km(north_km)
                .reliability(reliability)
                .build(self.clock.as_ref()),
        )
    }

    /// Bike request from the test pickup to 5 km east.
    pub fn request(&self, rider: &str) -> RequestId {
        self.request_class(rider, ServiceClass::Bike)
    }

    pub fn request_class(&self, rider: &str, class: ServiceClass) -> RequestId {
        let pickup = test_pickup();
        self.dispatcher
            .request_ride(
                &Principal::rider(rider),
                Place::labelled(pickup, "Pickup"),
                Place::labelled(offset_km(pickup, 0.0, 5.0), "Destination"),
                class,
            )
            .expect("request ride")
    }
}

/// Builder for captain fixtures.
#[derive(Clone, Debug)]
pub struct CaptainBuilder {
    id: String,
    class: ServiceClass,
    position: GeoPoint,
    reliability: f64,
    online: bool,
    report_age_ms: Option<i64>,
}

impl CaptainBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            class: ServiceClass::Bike,
            position: test_pickup(),
            reliability: 0.75,
            online: true,
            report_age_ms: Some(0),
        }
    }

    pub fn class(mut self, class: ServiceClass) -> Self {
        self.class = class;
        self
    }

    pub fn north_km(mut self, km: f64) -> Self {
        self.position = offset_km(test_pickup(), km, 0.0);
        self
    }

    pub fn reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    /// Last report `ms` before now.
    pub fn report_age_ms(mut self, ms: i64) -> Self {
        self.report_age_ms = Some(ms);
        self
    }

    pub fn never_reported(mut self) -> Self {
        self.report_age_ms = None;
        self
    }

    pub fn build(self, clock: &dyn Clock) -> Captain {
        let mut captain = Captain::new(self.id.as_str(), self.class);
        captain.online = self.online;
        captain.reliability = self.reliability;
        captain.position = Some(self.position);
        captain.reported_at = self.report_age_ms.map(|age| {
            ReportedAt::wall_clock(clock.now() - chrono::Duration::milliseconds(age))
        });
        captain
    }
}
