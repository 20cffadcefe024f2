mod support;

use dispatch_core::error::{Collaborator, DispatchError};
use dispatch_core::identity::Principal;
use dispatch_core::lifecycle::RideEventKind;
use dispatch_core::model::{
    AbortReason, CancellationReason, Ride, RideState,
};
use dispatch_core::notify::{DispatchEvent, Topic};
use dispatch_core::orchestrator::{DispatchOutcome, TransitionRequest};
use support::responder::{Behavior, Responder};
use support::{ops, Harness};

/// Match rider `r1` with captain `c1` and return the ride as the rider sees it.
fn matched(h: &Harness) -> (Ride, Responder) {
    h.captain_north("c1", 0.5, 0.8);
    let responder = Responder::spawn(h.dispatcher.clone(), &h.channel, "c1", Behavior::Accept);
    let request_id = h.request("r1");
    let DispatchOutcome::Matched(ride) = h.dispatcher.dispatch(request_id).expect("dispatch")
    else {
        panic!("expected a match");
    };
    let ride = h
        .dispatcher
        .ride(&Principal::rider("r1"), ride.id)
        .expect("rider view");
    (ride, responder)
}

fn code_of(ride: &Ride) -> String {
    ride.verification_code
        .as_ref()
        .expect("rider sees code")
        .reveal()
        .to_string()
}

fn wrong_code(code: &str) -> &'static str {
    if code == "0000" {
        "1111"
    } else {
        "0000"
    }
}

fn rider() -> Principal {
    Principal::rider("r1")
}

fn captain() -> Principal {
    Principal::captain("c1")
}

#[test]
fn full_ride_runs_through_every_state() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let events = h.channel.subscribe(Topic::Ride(ride.id));
    let code = code_of(&ride);

    h.clock.advance_ms(240_000);
    let arrived = h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");
    assert_eq!(arrived.state, RideState::Arrived);

    h.clock.advance_ms(60_000);
    let started = h
        .dispatcher
        .verify_start(&rider(), ride.id, &code)
        .expect("start");
    assert_eq!(started.state, RideState::InProgress);

    h.clock.advance_ms(900_000);
    let completed = h
        .dispatcher
        .complete_ride(&captain(), ride.id, 187.5)
        .expect("complete");
    assert_eq!(completed.state, RideState::Completed);
    assert_eq!(completed.final_fare, Some(187.5));

    let stored = h.store.stored_ride(ride.id);
    assert_eq!(stored.final_fare, Some(187.5));
    assert!(stored.timestamps.arrived_at.is_some());
    assert!(stored.timestamps.started_at.is_some());
    assert!(stored.timestamps.completed_at.is_some());

    let transitions: Vec<_> = events
        .try_iter()
        .filter_map(|event| match event {
            DispatchEvent::RideTransitioned { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (RideState::Assigned, RideState::Arrived),
            (RideState::Arrived, RideState::InProgress),
            (RideState::InProgress, RideState::Completed),
        ]
    );

    let telemetry = h.dispatcher.telemetry();
    assert_eq!(telemetry.counts.rides_completed, 1);
    let record = &telemetry.completed_rides[0];
    assert_eq!(record.fare, 187.5);
    assert_eq!(record.time_to_pickup_ms(), 300_000);
    assert_eq!(record.trip_duration_ms(), 900_000);
}

#[test]
fn wrong_code_keeps_ride_arrived_and_counts_attempt() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let code = code_of(&ride);
    h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");

    let err = h
        .dispatcher
        .verify_start(&rider(), ride.id, wrong_code(&code))
        .expect_err("wrong code");

    assert!(matches!(
        err,
        DispatchError::VerificationMismatch {
            failed_attempts: 1,
            ..
        }
    ));
    let stored = h.store.stored_ride(ride.id);
    assert_eq!(stored.state, RideState::Arrived);
    assert_eq!(stored.verification_failures, 1);
    assert_eq!(h.dispatcher.telemetry().counts.verification_failures, 1);

    // no lockout: the right code still works
    let started = h
        .dispatcher
        .verify_start(&rider(), ride.id, &code)
        .expect("start");
    assert_eq!(started.state, RideState::InProgress);
}

#[test]
fn cancel_in_progress_requires_abort_reason() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let code = code_of(&ride);
    h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");
    h.dispatcher
        .verify_start(&rider(), ride.id, &code)
        .expect("start");

    let err = h
        .dispatcher
        .cancel_ride(&rider(), ride.id, CancellationReason::ChangedPlans)
        .expect_err("plain cancel after pickup");
    assert!(matches!(
        err,
        DispatchError::IllegalTransition {
            from: RideState::InProgress,
            event: RideEventKind::Cancel,
            ..
        }
    ));
    assert_eq!(h.store.stored_ride(ride.id).state, RideState::InProgress);

    let aborted = h
        .dispatcher
        .cancel_ride(
            &captain(),
            ride.id,
            CancellationReason::TripAborted(AbortReason::VehicleBreakdown),
        )
        .expect("abort");
    assert_eq!(aborted.state, RideState::Cancelled);
}

#[test]
fn terminal_rides_are_frozen() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    h.dispatcher
        .cancel_ride(&rider(), ride.id, CancellationReason::ChangedPlans)
        .expect("cancel");

    let err = h
        .dispatcher
        .report_arrival(&captain(), ride.id)
        .expect_err("arrive after cancel");
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));

    let err = h
        .dispatcher
        .cancel_ride(&rider(), ride.id, CancellationReason::Other)
        .expect_err("second cancel with another reason");
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));

    // repeating the cancellation without a guard is not a no-op
    let err = h
        .dispatcher
        .cancel_ride(&rider(), ride.id, CancellationReason::ChangedPlans)
        .expect_err("unguarded repeat");
    assert!(matches!(
        err,
        DispatchError::IllegalTransition {
            from: RideState::Cancelled,
            event: RideEventKind::Cancel,
            ..
        }
    ));

    // a retry guarded by the state it started from answers with the snapshot
    let replay = h
        .dispatcher
        .apply_transition(
            &rider(),
            ride.id,
            Some(RideState::Assigned),
            TransitionRequest::Cancel {
                reason: CancellationReason::ChangedPlans,
            },
        )
        .expect("guarded replay");
    assert_eq!(replay.state, RideState::Cancelled);
    assert_eq!(h.dispatcher.telemetry().counts.rides_cancelled, 1);
}

#[test]
fn completed_fare_cannot_change() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let code = code_of(&ride);
    h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");
    h.dispatcher.verify_start(&rider(), ride.id, &code).expect("start");
    h.dispatcher.complete_ride(&captain(), ride.id, 140.0).expect("complete");

    let err = h
        .dispatcher
        .complete_ride(&captain(), ride.id, 140.0)
        .expect_err("unguarded repeat");
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));

    let guarded = |fare| {
        h.dispatcher.apply_transition(
            &captain(),
            ride.id,
            Some(RideState::InProgress),
            TransitionRequest::Complete { fare },
        )
    };
    assert_eq!(guarded(140.0).expect("guarded replay").final_fare, Some(140.0));
    let err = guarded(150.0).expect_err("different fare");
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));
    assert_eq!(h.dispatcher.telemetry().counts.rides_completed, 1);
    assert_eq!(h.store.stored_ride(ride.id).final_fare, Some(140.0));
}

#[test]
fn repeated_arrival_is_illegal() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let events = h.channel.subscribe(Topic::Ride(ride.id));
    h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");

    let err = h
        .dispatcher
        .report_arrival(&captain(), ride.id)
        .expect_err("second arrival");
    assert!(matches!(
        err,
        DispatchError::IllegalTransition {
            from: RideState::Arrived,
            event: RideEventKind::Arrive,
            ..
        }
    ));

    // a guard naming the current state is no excuse either
    let err = h
        .dispatcher
        .apply_transition(
            &captain(),
            ride.id,
            Some(RideState::Arrived),
            TransitionRequest::Arrive,
        )
        .expect_err("guarded on the target state");
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));

    let arrivals = events
        .try_iter()
        .filter(|event| matches!(event, DispatchEvent::RideTransitioned { to: RideState::Arrived, .. }))
        .count();
    assert_eq!(arrivals, 1);
}

#[test]
fn negative_fare_is_invalid_input() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let code = code_of(&ride);
    h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");
    h.dispatcher.verify_start(&rider(), ride.id, &code).expect("start");

    let err = h
        .dispatcher
        .complete_ride(&captain(), ride.id, -5.0)
        .expect_err("negative fare");
    assert!(matches!(err, DispatchError::InvalidInput(_)));
    assert_eq!(h.store.stored_ride(ride.id).state, RideState::InProgress);
}

#[test]
fn only_the_right_principals_may_transition() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let code = code_of(&ride);

    let err = h
        .dispatcher
        .report_arrival(&Principal::captain("c2"), ride.id)
        .expect_err("other captain");
    assert!(matches!(err, DispatchError::Unauthorized { .. }));
    let err = h
        .dispatcher
        .report_arrival(&rider(), ride.id)
        .expect_err("rider");
    assert!(matches!(err, DispatchError::Unauthorized { .. }));

    h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");
    let err = h
        .dispatcher
        .verify_start(&captain(), ride.id, &code)
        .expect_err("captain cannot start");
    assert!(matches!(err, DispatchError::Unauthorized { .. }));
    let err = h
        .dispatcher
        .verify_start(&Principal::rider("r2"), ride.id, &code)
        .expect_err("other rider");
    assert!(matches!(err, DispatchError::Unauthorized { .. }));

    let started = h
        .dispatcher
        .verify_start(&ops(), ride.id, &code)
        .expect("admin may start");
    assert_eq!(started.state, RideState::InProgress);
}

#[test]
fn captains_never_see_the_code() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);

    let captain_view = h.dispatcher.ride(&captain(), ride.id).expect("captain view");
    assert!(captain_view.verification_code.is_none());
    let history = h
        .dispatcher
        .rides_for_captain(&captain(), &"c1".into())
        .expect("history");
    assert!(history.iter().all(|ride| ride.verification_code.is_none()));

    let err = h
        .dispatcher
        .ride(&Principal::rider("r2"), ride.id)
        .expect_err("stranger");
    assert!(matches!(err, DispatchError::Unauthorized { .. }));
}

#[test]
fn store_failure_leaves_ride_unchanged_and_guarded_retry_succeeds() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);

    h.store.fail_ride_updates(true);
    let err = h
        .dispatcher
        .report_arrival(&captain(), ride.id)
        .expect_err("store down");
    assert!(matches!(
        err,
        DispatchError::CollaboratorUnavailable {
            collaborator: Collaborator::RecordStore,
            ..
        }
    ));
    assert_eq!(h.store.stored_ride(ride.id).state, RideState::Assigned);

    h.store.fail_ride_updates(false);
    let arrived = h
        .dispatcher
        .apply_transition(
            &captain(),
            ride.id,
            Some(RideState::Assigned),
            TransitionRequest::Arrive,
        )
        .expect("retry");
    assert_eq!(arrived.state, RideState::Arrived);

    // a duplicate retry answers with the current snapshot
    let again = h
        .dispatcher
        .apply_transition(
            &captain(),
            ride.id,
            Some(RideState::Assigned),
            TransitionRequest::Arrive,
        )
        .expect("duplicate retry");
    assert_eq!(again.state, RideState::Arrived);
}

#[test]
fn stale_guard_is_rejected() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);

    let err = h
        .dispatcher
        .apply_transition(
            &rider(),
            ride.id,
            Some(RideState::Arrived),
            TransitionRequest::Cancel {
                reason: CancellationReason::ChangedPlans,
            },
        )
        .expect_err("guard mismatch");
    assert!(matches!(
        err,
        DispatchError::IllegalTransition {
            from: RideState::Assigned,
            ..
        }
    ));
}

#[test]
fn failed_publish_rolls_back_completion() {
    let h = Harness::new();
    let (ride, _c1) = matched(&h);
    let code = code_of(&ride);
    h.dispatcher.report_arrival(&captain(), ride.id).expect("arrive");
    h.dispatcher.verify_start(&rider(), ride.id, &code).expect("start");

    h.notifier.fail_transitions(true);
    let err = h
        .dispatcher
        .complete_ride(&captain(), ride.id, 120.0)
        .expect_err("channel down");
    assert!(matches!(
        err,
        DispatchError::CollaboratorUnavailable {
            collaborator: Collaborator::NotificationChannel,
            ..
        }
    ));
    let stored = h.store.stored_ride(ride.id);
    assert_eq!(stored.state, RideState::InProgress);
    assert_eq!(stored.final_fare, None);
    assert_eq!(h.dispatcher.telemetry().counts.rides_completed, 0);

    h.notifier.fail_transitions(false);
    let completed = h
        .dispatcher
        .apply_transition(
            &captain(),
            ride.id,
            Some(RideState::InProgress),
            TransitionRequest::Complete { fare: 120.0 },
        )
        .expect("retry");
    assert_eq!(completed.state, RideState::Completed);
    assert_eq!(h.dispatcher.telemetry().counts.rides_completed, 1);
}

#[test]
fn ride_history_is_newest_first() {
    let h = Harness::new();
    let (first, _c1) = matched(&h);
    h.dispatcher
        .cancel_ride(&rider(), first.id, CancellationReason::ChangedPlans)
        .expect("cancel");

    h.clock.advance_ms(1_000);
    let request_id = h.request("r1");
    let DispatchOutcome::Matched(second) = h.dispatcher.dispatch(request_id).expect("dispatch")
    else {
        panic!("expected a second match");
    };

    let history = h
        .dispatcher
        .rides_for_requester(&rider(), &"r1".into())
        .expect("history");
    let ids: Vec<_> = history.iter().map(|ride| ride.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    let err = h
        .dispatcher
        .rides_for_requester(&Principal::rider("r2"), &"r1".into())
        .expect_err("someone else's history");
    assert!(matches!(err, DispatchError::Unauthorized { .. }));
}
