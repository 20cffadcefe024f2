//! Scripted captain apps that answer offers from a background thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use dispatch_core::identity::Principal;
use dispatch_core::model::{CaptainId, Offer, OfferReply};
use dispatch_core::notify::{DispatchEvent, InMemoryChannel, Topic};
use dispatch_core::orchestrator::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Accept,
    Decline,
    /// Let every offer run into its deadline.
    Ignore,
}

pub struct Responder {
    stop: Arc<AtomicBool>,
    offers: Arc<Mutex<Vec<Offer>>>,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        channel: &InMemoryChannel,
        captain: &str,
        behavior: Behavior,
    ) -> Self {
        let events = channel.subscribe(Topic::Captain(CaptainId::from(captain)));
        let principal = Principal::captain(captain);
        let stop = Arc::new(AtomicBool::new(false));
        let offers = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let stop = stop.clone();
            let offers = offers.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let Ok(event) = events.recv_timeout(Duration::from_millis(20)) else {
                        continue;
                    };
                    let DispatchEvent::OfferCreated { offer } = event else {
                        continue;
                    };
                    offers.lock().push(offer.clone());
                    let reply = match behavior {
                        Behavior::Accept => OfferReply::Accept,
                        Behavior::Decline => OfferReply::Decline,
                        Behavior::Ignore => continue,
                    };
                    let _ = dispatcher.respond_to_offer(&principal, offer.id, reply);
                }
            })
        };

        Self {
            stop,
            offers,
            handle: Some(handle),
        }
    }

    /// Offers this captain has seen so far.
    pub fn offers(&self) -> Vec<Offer> {
        self.offers.lock().clone()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
