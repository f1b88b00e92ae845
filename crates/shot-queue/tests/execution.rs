//! Execution loop: group ordering, trigger-once, unwinding and terminal states.
//!
//! All tests run on a paused clock; mock delays advance it deterministically.

mod common;

use common::{fast_settings, lab_shot, next_outcome, wait_for_state, Harness, Workers};
use shot_core::{ArtifactStore, FileArtifactStore, ResultsWriter, ShotError, ShotId, ShotResults};
use shot_driver_mock::{CallKind, CallLog, MockBehavior};
use shot_queue::{QueueSettings, RepeatMode, ShotEvent, ShotState, TeardownAction};
use std::collections::BTreeMap;
use std::time::Duration;

fn harness_with(configure: impl FnOnce(&mut Workers), settings: QueueSettings) -> Harness {
    let log = CallLog::new();
    let mut workers = Workers::new(&log);
    configure(&mut workers);
    Harness::new(workers, log, settings)
}

fn replace_workers(workers: &mut Workers, f: impl FnOnce(Workers) -> Workers) {
    let taken = std::mem::replace(workers, Workers::new(&CallLog::new()));
    *workers = f(taken);
}

#[tokio::test(start_paused = true)]
async fn test_groups_run_in_order_then_trigger_once_then_return_to_manual() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                fpga0: w.fpga0.with_transition(MockBehavior::delay_ms(20)),
                ttl1: w.ttl1.with_transition(MockBehavior::delay_ms(30)),
                dds41: w.dds41.with_transition(MockBehavior::delay_ms(40)),
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.write_lab_shot("scanA.h5");
    h.manager.admit(path.clone()).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Done, "{outcome}");
    assert!(outcome.error.is_none());
    assert!(outcome.teardown_failures.is_empty());

    let log = &h.log;
    let fpga = log.first("fpga0", CallKind::Transition).unwrap();
    let ttl = log.first("ttl1", CallKind::Transition).unwrap();
    let dds = log.first("dds41", CallKind::Transition).unwrap();

    // Group @0 completes before group @1 is contacted
    assert!(fpga.finished.unwrap() <= ttl.started);
    assert!(fpga.finished.unwrap() <= dds.started);
    // Group @1 runs concurrently
    assert!(ttl.overlaps(&dds));

    // Trigger once, after every device is armed
    assert_eq!(log.total(CallKind::StartRun), 1);
    assert_eq!(log.total(CallKind::WaitDone), 1);
    let start = log.first("fpga0", CallKind::StartRun).unwrap();
    assert!(dds.finished.unwrap() <= start.started);
    assert!(ttl.finished.unwrap() <= start.started);

    for device in ["fpga0", "ttl1", "dds41"] {
        assert_eq!(log.count(device, CallKind::ReturnToManual), 1, "{device}");
        assert_eq!(log.count(device, CallKind::Abort), 0, "{device}");
    }
    let wait = log.first("fpga0", CallKind::WaitDone).unwrap();
    let rtm = log.first("ttl1", CallKind::ReturnToManual).unwrap();
    assert!(wait.finished.unwrap() <= rtm.started);

    // Results appended and analysis notified
    let stored = FileArtifactStore::new().load(&ShotId::from(path.clone())).await.unwrap();
    let results = stored.results.expect("results marker");
    assert_eq!(results.run_uid, outcome.run_uid);
    assert_eq!(results.final_values["dds41"]["freq"], 81.5);
    assert_eq!(results.final_values["ttl1"]["flag1"], 0.0);
    assert_eq!(*h.submitter.submitted.lock(), vec![ShotId::from(path)]);

    assert!(h.manager.current().is_none());
    assert_eq!(h.manager.recent_outcomes().len(), 1);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_state_sequence_of_a_clean_shot() {
    let h = harness_with(|_| {}, fast_settings());
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();
    h.manager.admit(h.write_lab_shot("scanA.h5")).await.unwrap();

    let mut states = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            ShotEvent::StateChanged { state, .. } => states.push(state),
            ShotEvent::Finished(_) => break,
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            ShotState::Dequeued,
            ShotState::Validating,
            ShotState::TransitioningBuffered,
            ShotState::Triggered,
            ShotState::Running,
            ShotState::Unwinding,
            ShotState::Done,
        ]
    );
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transition_timeout_unwinds_earlier_groups_without_trigger() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                dds41: w.dds41.with_transition(MockBehavior::Hang),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.write_lab_shot("scanA.h5");
    h.manager.admit(path.clone()).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Error);
    assert_eq!(
        outcome.error,
        Some(ShotError::DeviceTransitionTimeout {
            device: "dds41".into(),
            timeout: Duration::from_millis(500),
        })
    );

    let log = &h.log;
    assert_eq!(log.total(CallKind::StartRun), 0);
    assert_eq!(log.total(CallKind::WaitDone), 0);
    assert_eq!(log.count("fpga0", CallKind::Abort), 1);
    assert_eq!(log.count("ttl1", CallKind::Abort), 1);
    assert_eq!(log.count("dds41", CallKind::Abort), 0);
    assert_eq!(log.total(CallKind::ReturnToManual), 0);

    let mut transitioned = outcome.transitioned.clone();
    transitioned.sort();
    assert_eq!(transitioned, vec!["fpga0".to_string(), "ttl1".to_string()]);

    // Nothing persisted for a failed shot
    let stored = FileArtifactStore::new().load(&ShotId::from(path)).await.unwrap();
    assert!(stored.results.is_none());
    assert!(h.submitter.submitted.lock().is_empty());
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_in_first_group_never_contacts_second_group() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                fpga0: w.fpga0.with_transition(MockBehavior::fail("USB disconnected")),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();
    h.manager.admit(h.write_lab_shot("scanA.h5")).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Error);
    assert!(matches!(
        outcome.error,
        Some(ShotError::DeviceTransitionFailure { ref device, ref message })
            if device == "fpga0" && message == "USB disconnected"
    ));
    assert_eq!(h.log.count("ttl1", CallKind::Transition), 0);
    assert_eq!(h.log.count("dds41", CallKind::Transition), 0);
    assert!(outcome.transitioned.is_empty());
    assert_eq!(h.log.total(CallKind::Abort), 0);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_trigger_failure_aborts_every_armed_device() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                fpga0: w.fpga0.with_start(MockBehavior::fail("trigger line stuck")),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();
    h.manager.admit(h.write_lab_shot("scanA.h5")).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Error);
    assert!(matches!(outcome.error, Some(ShotError::MasterTriggerFailure { .. })));
    assert_eq!(h.log.total(CallKind::StartRun), 1);
    assert_eq!(h.log.total(CallKind::WaitDone), 0);
    for device in ["fpga0", "ttl1", "dds41"] {
        assert_eq!(h.log.count(device, CallKind::Abort), 1, "{device}");
    }
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_completion_wait_times_out_from_expected_duration() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                fpga0: w.fpga0.with_wait(MockBehavior::Hang),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.path("long.h5");
    common::write_artifact(&path, &lab_shot(path.clone()).with_expected_duration_ms(300));
    h.manager.admit(path).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Error);
    assert_eq!(
        outcome.error,
        Some(ShotError::CompletionTimeout {
            device: "fpga0".into(),
            timeout: Duration::from_millis(400),
        })
    );
    assert_eq!(h.log.total(CallKind::Abort), 3);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_completion_failure_aborts_every_armed_device() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                fpga0: w.fpga0.with_wait(MockBehavior::fail_after_ms(5, "pulse program underflow")),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.write_lab_shot("scanA.h5");
    h.manager.admit(path.clone()).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Error);
    assert_eq!(
        outcome.error,
        Some(ShotError::CompletionFailure {
            device: "fpga0".into(),
            message: "pulse program underflow".into(),
        })
    );
    assert_eq!(h.log.total(CallKind::StartRun), 1);
    assert_eq!(h.log.total(CallKind::WaitDone), 1);
    for device in ["fpga0", "ttl1", "dds41"] {
        assert_eq!(h.log.count(device, CallKind::Abort), 1, "{device}");
        assert_eq!(h.log.count(device, CallKind::ReturnToManual), 0, "{device}");
    }
    assert!(outcome.teardown_failures.is_empty());

    let stored = FileArtifactStore::new().load(&ShotId::from(path)).await.unwrap();
    assert!(stored.results.is_none());
    assert!(h.submitter.submitted.lock().is_empty());
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_run_ends_in_aborted() {
    let h = harness_with(|_| {}, fast_settings());
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.path("long.h5");
    common::write_artifact(&path, &lab_shot(path.clone()).with_expected_duration_ms(10_000));
    h.manager.admit(path).await.unwrap();

    wait_for_state(&mut events, ShotState::Running).await;
    assert_eq!(h.manager.current().unwrap().state, ShotState::Running);
    assert!(h.manager.abort_current());

    let outcome = next_outcome(&mut events).await;
    assert_eq!(outcome.state, ShotState::Aborted);
    assert_eq!(outcome.error, Some(ShotError::CancellationRequested));
    assert_eq!(h.log.total(CallKind::StartRun), 1);
    for device in ["fpga0", "ttl1", "dds41"] {
        assert_eq!(h.log.count(device, CallKind::Abort), 1, "{device}");
        assert_eq!(h.log.count(device, CallKind::ReturnToManual), 0, "{device}");
    }
    assert!(!h.manager.abort_current());
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_between_groups_skips_remaining_groups() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                fpga0: w.fpga0.with_transition(MockBehavior::delay_ms(100)),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();
    h.manager.admit(h.write_lab_shot("scanA.h5")).await.unwrap();

    wait_for_state(&mut events, ShotState::TransitioningBuffered).await;
    assert!(h.manager.abort_current());

    let outcome = next_outcome(&mut events).await;
    assert_eq!(outcome.state, ShotState::Aborted);
    // The in-flight group finishes; the next one is never started
    assert_eq!(h.log.count("fpga0", CallKind::Transition), 1);
    assert_eq!(h.log.count("ttl1", CallKind::Transition), 0);
    assert_eq!(h.log.count("fpga0", CallKind::Abort), 1);
    assert_eq!(h.log.total(CallKind::StartRun), 0);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_teardown_failures_are_recorded_once() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                ttl1: w.ttl1.with_return_to_manual(MockBehavior::fail("relay stuck")),
                dds41: w.dds41.with_return_to_manual(MockBehavior::Hang),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();
    h.manager.admit(h.write_lab_shot("scanA.h5")).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Done);
    assert_eq!(outcome.teardown_failures.len(), 2);
    assert!(outcome
        .teardown_failures
        .iter()
        .all(|f| f.action == TeardownAction::ReturnToManual));
    assert_eq!(h.log.count("ttl1", CallKind::ReturnToManual), 1);
    assert_eq!(h.log.count("dds41", CallKind::ReturnToManual), 1);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_instructions_for_unknown_device_fail_preparation() {
    let h = harness_with(|_| {}, fast_settings());
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.path("stray.h5");
    common::write_artifact(
        &path,
        &lab_shot(path.clone()).with_instructions("ao9", serde_json::json!({"ramp": [0.0]})),
    );
    h.manager.admit(path).await.unwrap();
    let outcome = next_outcome(&mut events).await;

    assert_eq!(outcome.state, ShotState::Error);
    assert!(matches!(outcome.error, Some(ShotError::ShotPreparation(ref m)) if m.contains("ao9")));
    assert!(h.log.records().is_empty());
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shots_never_overlap_and_loop_continues_after_failure() {
    let h = harness_with(
        |w| {
            replace_workers(w, |w| Workers {
                ttl1: w.ttl1.with_transition(MockBehavior::delay_ms(50)),
                ..w
            })
        },
        fast_settings(),
    );
    let mut events = h.manager.subscribe();

    let bad = h.path("bad.h5");
    common::write_artifact(
        &bad,
        &lab_shot(bad.clone()).with_instructions("ao9", serde_json::json!({})),
    );
    h.manager.admit(bad).await.unwrap();
    h.manager.admit(h.write_lab_shot("a.h5")).await.unwrap();
    h.manager.admit(h.write_lab_shot("b.h5")).await.unwrap();
    h.manager.start().unwrap();

    let first = next_outcome(&mut events).await;
    let second = next_outcome(&mut events).await;
    let third = next_outcome(&mut events).await;
    assert_eq!(first.state, ShotState::Error);
    assert_eq!(second.state, ShotState::Done);
    assert_eq!(third.state, ShotState::Done);
    assert_eq!(second.shot.file_name(), "a.h5");
    assert_eq!(third.shot.file_name(), "b.h5");

    // Second shot's first transition starts after the first shot's teardown
    let records = h.log.records();
    let last_rtm_of_a = records
        .iter()
        .filter(|r| r.kind == CallKind::ReturnToManual)
        .take(3)
        .filter_map(|r| r.finished)
        .max()
        .unwrap();
    let first_transition_of_b = records
        .iter()
        .filter(|r| r.kind == CallKind::Transition)
        .nth(3)
        .unwrap();
    assert!(last_rtm_of_a <= first_transition_of_b.started);
    assert_eq!(h.log.total(CallKind::StartRun), 2);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_paused_queue_holds_shots_until_resumed() {
    let settings = QueueSettings {
        start_paused: true,
        ..fast_settings()
    };
    let h = harness_with(|_| {}, settings);
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();
    h.manager.admit(h.write_lab_shot("scanA.h5")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.manager.is_paused());
    assert!(h.manager.current().is_none());
    assert_eq!(h.manager.len().await, 1);
    assert!(h.log.records().is_empty());

    h.manager.resume();
    let outcome = next_outcome(&mut events).await;
    assert_eq!(outcome.state, ShotState::Done);
    assert!(h.manager.is_idle().await);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pausing_does_not_interrupt_the_shot_in_flight() {
    let h = harness_with(|_| {}, fast_settings());
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();
    h.manager.admit(h.write_lab_shot("a.h5")).await.unwrap();
    h.manager.admit(h.write_lab_shot("b.h5")).await.unwrap();

    wait_for_state(&mut events, ShotState::Running).await;
    h.manager.pause();

    let outcome = next_outcome(&mut events).await;
    assert_eq!(outcome.state, ShotState::Done);
    assert_eq!(outcome.shot.file_name(), "a.h5");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.manager.len().await, 1);
    assert!(h.manager.current().is_none());
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeat_all_requeues_a_fresh_copy() {
    let settings = QueueSettings {
        repeat_mode: RepeatMode::All,
        ..fast_settings()
    };
    let h = harness_with(|_| {}, settings);
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.write_lab_shot("scanA.h5");
    h.manager.admit(path.clone()).await.unwrap();
    let first = next_outcome(&mut events).await;
    assert_eq!(first.state, ShotState::Done);

    let second = next_outcome(&mut events).await;
    assert_eq!(second.shot.file_name(), "scanA_rep00001.h5");
    assert_eq!(second.state, ShotState::Done);

    h.manager.pause();
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeat_last_only_when_queue_is_empty() {
    let settings = QueueSettings {
        repeat_mode: RepeatMode::Last,
        ..fast_settings()
    };
    let h = harness_with(|_| {}, settings);
    let mut events = h.manager.subscribe();

    h.manager.admit(h.write_lab_shot("a.h5")).await.unwrap();
    h.manager.admit(h.write_lab_shot("b.h5")).await.unwrap();
    h.manager.start().unwrap();

    let mut admitted = Vec::new();
    let mut finished = 0;
    while finished < 2 {
        match events.recv().await.unwrap() {
            ShotEvent::Admitted { id, .. } => admitted.push(id.file_name().to_string()),
            ShotEvent::Finished(_) => finished += 1,
            _ => {}
        }
    }
    assert_eq!(admitted, vec!["a.h5", "b.h5", "b_rep00001.h5"]);

    h.manager.pause();
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_the_shot_in_flight() {
    let h = harness_with(|_| {}, fast_settings());
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.path("long.h5");
    common::write_artifact(&path, &lab_shot(path.clone()).with_expected_duration_ms(10_000));
    h.manager.admit(path).await.unwrap();
    wait_for_state(&mut events, ShotState::Running).await;

    h.manager.shutdown().await;

    let outcome = h.manager.recent_outcomes().pop().unwrap();
    assert_eq!(outcome.state, ShotState::Aborted);
    assert_eq!(h.log.total(CallKind::Abort), 3);
}

#[tokio::test(start_paused = true)]
async fn test_readmitting_the_running_shot_queues_a_copy() {
    let h = harness_with(|_| {}, fast_settings());
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.path("long.h5");
    common::write_artifact(&path, &lab_shot(path.clone()).with_expected_duration_ms(200));
    h.manager.admit(path.clone()).await.unwrap();
    wait_for_state(&mut events, ShotState::Running).await;

    let again = h.manager.admit(path.clone()).await.unwrap();
    assert_eq!(again.id.file_name(), "long_rep00001.h5");
    assert_eq!(again.cloned_from, Some(ShotId::from(path.clone())));
    assert_eq!(again.position, 1);

    let first = next_outcome(&mut events).await;
    let second = next_outcome(&mut events).await;
    assert_eq!(first.state, ShotState::Done, "{first}");
    assert_eq!(second.state, ShotState::Done, "{second}");
    assert_eq!(first.shot, ShotId::from(path.clone()));
    assert_eq!(second.shot, again.id);

    // Each run owns its own results
    let store = FileArtifactStore::new();
    let original = store.load(&ShotId::from(path)).await.unwrap();
    let copy = store.load(&again.id).await.unwrap();
    assert_eq!(original.results.unwrap().run_uid, first.run_uid);
    assert_eq!(copy.results.unwrap().run_uid, second.run_uid);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_artifact_with_results_at_dequeue_is_refused() {
    let settings = QueueSettings {
        start_paused: true,
        ..fast_settings()
    };
    let h = harness_with(|_| {}, settings);
    let mut events = h.manager.subscribe();
    h.manager.start().unwrap();

    let path = h.write_lab_shot("scanA.h5");
    h.manager.admit(path.clone()).await.unwrap();

    // Results land on the file while it waits in the queue
    let results = ShotResults {
        run_uid: "external-run".into(),
        completed_at: chrono::Utc::now(),
        final_values: BTreeMap::new(),
    };
    FileArtifactStore::new()
        .append_results(&ShotId::from(path.clone()), &results)
        .await
        .unwrap();

    h.manager.resume();
    let outcome = next_outcome(&mut events).await;
    assert_eq!(outcome.state, ShotState::Error);
    assert!(matches!(
        outcome.error,
        Some(ShotError::ShotPreparation(ref m)) if m.contains("already carries results")
    ));
    assert!(h.log.records().is_empty());
    assert!(h.submitter.submitted.lock().is_empty());

    let stored = FileArtifactStore::new().load(&ShotId::from(path)).await.unwrap();
    assert_eq!(stored.results.unwrap().run_uid, "external-run");
    h.manager.shutdown().await;
}
