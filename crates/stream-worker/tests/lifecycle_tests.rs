//! Lifecycle integration tests.
//!
//! Drives `ShutdownCoordinator` through complete lifecycles with a recording
//! notifier and a gated processor. Timer-driven tests run on paused time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use stream_worker::config::Config;
use stream_worker::control_plane::mock::{NotifierCall, RecordingNotifier};
use stream_worker::control_plane::{ControlPlaneNotifier, StatusExtra, SHUTDOWN_FAILED_EVENT};
use stream_worker::errors::WorkerError;
use stream_worker::lifecycle::{
    InstanceStatus, LifecycleSettings, ShutdownCoordinator, ShutdownReason, ShutdownTimers,
};
use stream_worker::observability::HealthState;
use stream_worker::stream::mock::GatedProcessor;
use stream_worker::stream::StreamProcessor;
use tokio::time::Instant;

struct Instance {
    coordinator: Arc<ShutdownCoordinator>,
    timers: ShutdownTimers,
    notifier: Arc<RecordingNotifier>,
    processor: Arc<GatedProcessor>,
    health: Arc<HealthState>,
}

/// A `Running` instance with started timers.
async fn running_instance(settings: LifecycleSettings) -> Instance {
    let notifier = Arc::new(RecordingNotifier::new());
    let processor = Arc::new(GatedProcessor::new());
    let health = Arc::new(HealthState::new());
    let (coordinator, mut timers) = ShutdownCoordinator::new(
        "sw-lifecycle-test",
        settings,
        Arc::clone(&notifier) as Arc<dyn ControlPlaneNotifier>,
        Arc::clone(&processor) as Arc<dyn StreamProcessor>,
        Arc::clone(&health),
    );

    coordinator.begin_startup().await.unwrap();
    timers.start();
    coordinator.confirm_startup().await.unwrap();

    Instance {
        coordinator,
        timers,
        notifier,
        processor,
        health,
    }
}

fn settings(lifetime_secs: u64, inactivity_secs: u64) -> LifecycleSettings {
    LifecycleSettings {
        lifetime: Duration::from_secs(lifetime_secs),
        inactivity_timeout: Duration::from_secs(inactivity_secs),
        ..LifecycleSettings::default()
    }
}

async fn wait_for_status(coordinator: &ShutdownCoordinator, expected: InstanceStatus) {
    while coordinator.status().await != expected {
        tokio::task::yield_now().await;
    }
}

fn shutdown_requests(notifier: &RecordingNotifier) -> Vec<StatusExtra> {
    notifier
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NotifierCall::Status {
                status: InstanceStatus::ShutdownRequested,
                extra,
            } => Some(extra),
            _ => None,
        })
        .collect()
}

fn reason(value: &str) -> StatusExtra {
    StatusExtra::from([("reason".to_string(), value.to_string())])
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_target_is_never_registered() {
    let instance = running_instance(settings(3600, 900)).await;
    instance.processor.set_unreachable("10.255.0.1:1935");

    let result = instance.coordinator.admit("a", "10.255.0.1:1935").await;

    assert!(matches!(result, Err(WorkerError::TargetUnreachable(_))));
    assert_eq!(instance.coordinator.active_sessions(), 0);
    assert!(instance.notifier.completed_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lifetime_expiry_drains_in_flight_session() {
    let Instance {
        coordinator,
        timers,
        notifier,
        processor,
        health,
    } = running_instance(settings(10, 900)).await;

    coordinator.admit("b", "10.0.0.5:1935").await.unwrap();

    let run = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run(timers, async { Ok(()) }).await })
    };

    tokio::time::sleep(Duration::from_secs(11)).await;
    wait_for_status(&coordinator, InstanceStatus::ShutdownRequested).await;
    assert_eq!(shutdown_requests(&notifier), vec![reason("lifetime")]);
    assert!(!health.is_ready());

    // Admission is closed, but "b" is still running
    let late = coordinator.admit("c", "10.0.0.5:1935").await;
    assert!(matches!(late, Err(WorkerError::AlreadyShuttingDown)));
    assert_eq!(coordinator.active_sessions(), 1);

    // Drain must not complete while "b" is registered
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(coordinator.status().await, InstanceStatus::ShutdownRequested);
    assert!(!run.is_finished());

    processor.release("b");
    let final_status = run.await.unwrap();

    assert_eq!(final_status, InstanceStatus::ShuttingDown);
    assert_eq!(coordinator.active_sessions(), 0);
    assert_eq!(notifier.completed_sessions(), vec!["b".to_string()]);
    assert_eq!(
        notifier.statuses(),
        vec![
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::ShutdownRequested,
            InstanceStatus::ShuttingDown,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_requests_shutdown_for_usage() {
    let instance = running_instance(settings(3600, 900)).await;
    let start = Instant::now();

    let final_status = instance
        .coordinator
        .run(instance.timers, async { Ok(()) })
        .await;

    assert_eq!(final_status, InstanceStatus::ShuttingDown);
    assert!(start.elapsed() >= Duration::from_secs(900));
    assert!(start.elapsed() < Duration::from_secs(901));
    assert!(instance.health.is_live(), "a clean shutdown stays live");
    assert_eq!(shutdown_requests(&instance.notifier), vec![reason("usage")]);
    assert_eq!(
        instance.notifier.statuses(),
        vec![
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::ShutdownRequested,
            InstanceStatus::ShuttingDown,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_timers_cause_single_transition() {
    let instance = running_instance(settings(30, 30)).await;

    let final_status = instance
        .coordinator
        .run(instance.timers, async { Ok(()) })
        .await;

    assert_eq!(final_status, InstanceStatus::ShuttingDown);
    let requests = shutdown_requests(&instance.notifier);
    assert_eq!(requests.len(), 1, "exactly one reason may be acted upon");
    assert!(requests.contains(&reason("lifetime")) || requests.contains(&reason("usage")));
}

#[tokio::test(start_paused = true)]
async fn test_signal_trigger_competes_with_timers() {
    let instance = running_instance(settings(3600, 900)).await;
    let trigger = instance.coordinator.trigger();

    let run = {
        let coordinator = Arc::clone(&instance.coordinator);
        let timers = instance.timers;
        tokio::spawn(async move { coordinator.run(timers, async { Ok(()) }).await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(trigger.fire(ShutdownReason::Signal));

    assert_eq!(run.await.unwrap(), InstanceStatus::ShuttingDown);
    assert_eq!(shutdown_requests(&instance.notifier), vec![reason("signal")]);
}

#[tokio::test(start_paused = true)]
async fn test_transport_stuck_past_grace_period_fails_shutdown() {
    let instance = running_instance(settings(10, 900)).await;
    let start = Instant::now();

    let final_status = instance
        .coordinator
        .run(instance.timers, std::future::pending())
        .await;

    assert_eq!(final_status, InstanceStatus::ShutdownFailed);
    assert!(!instance.health.is_live());
    // Lifetime plus the default 5 second grace period
    assert!(start.elapsed() >= Duration::from_secs(15));
    assert_eq!(
        instance.notifier.statuses().last(),
        Some(&InstanceStatus::ShutdownFailed)
    );

    let events = instance.notifier.events();
    assert_eq!(events.len(), 1);
    assert!(events
        .iter()
        .all(|(reason, message)| reason == SHUTDOWN_FAILED_EVENT && message.contains("5s")));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_control_plane_never_blocks_exit() {
    let instance = running_instance(settings(10, 900)).await;
    instance.notifier.set_failing(true);

    let final_status = instance
        .coordinator
        .run(instance.timers, async { Ok(()) })
        .await;

    assert_eq!(final_status, InstanceStatus::ShuttingDown);
}

#[tokio::test(start_paused = true)]
async fn test_largest_configured_timers_do_not_overflow() {
    let config = Config::from_vars(&HashMap::from([
        ("SW_LIFETIME_SECONDS".to_string(), u64::MAX.to_string()),
        ("SW_INACTIVITY_TIMEOUT_SECONDS".to_string(), u64::MAX.to_string()),
    ]))
    .unwrap();
    let instance = running_instance(config.lifecycle_settings()).await;

    // Admission restarts the inactivity countdown from now
    instance.coordinator.admit("a", "10.0.0.5:1935").await.unwrap();
    instance.processor.release("a");
    assert!(instance.coordinator.trigger().fire(ShutdownReason::Signal));

    let final_status = instance
        .coordinator
        .run(instance.timers, async { Ok(()) })
        .await;

    assert_eq!(final_status, InstanceStatus::ShuttingDown);
    assert_eq!(shutdown_requests(&instance.notifier), vec![reason("signal")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_admission_after_shutdown_requested() {
    for round in 0..20 {
        let instance = running_instance(settings(3600, 900)).await;

        let admits: Vec<_> = (0..32)
            .map(|i| {
                let coordinator = Arc::clone(&instance.coordinator);
                tokio::spawn(async move {
                    let id = format!("r{round}-s{i}");
                    coordinator.admit(&id, "10.0.0.5:1935").await.map(|s| s.id)
                })
            })
            .collect();

        tokio::task::yield_now().await;

        // Park the flip inside its critical section: readiness drops under the
        // status lock, which stays held until the paused report is released
        instance.notifier.pause_status_reports();
        let flip = {
            let coordinator = Arc::clone(&instance.coordinator);
            tokio::spawn(async move {
                coordinator
                    .request_shutdown(ShutdownReason::Lifetime)
                    .await
            })
        };
        while instance.health.is_ready() {
            tokio::task::yield_now().await;
        }

        // Sessions are gated, so everything registered before the flip is still present
        let registered_at_flip: HashSet<String> = instance
            .coordinator
            .sessions()
            .into_iter()
            .map(|s| s.id)
            .collect();
        instance.notifier.resume_status_reports();
        assert!(flip.await.unwrap());

        for admit in admits {
            match admit.await.unwrap() {
                Ok(id) => assert!(
                    registered_at_flip.contains(&id),
                    "round {round}: {id} was admitted after shutdown was requested"
                ),
                Err(WorkerError::AlreadyShuttingDown) => {}
                Err(e) => panic!("round {round}: unexpected admission error: {e}"),
            }
        }

        assert_eq!(
            instance.coordinator.active_sessions(),
            registered_at_flip.len()
        );
        instance.processor.release_all();
        instance.coordinator.drain().await.unwrap();
    }
}
