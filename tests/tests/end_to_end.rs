//! End-to-end scenarios wiring multiple components together, as opposed to
//! the per-module unit tests that live alongside each module in `cf-core`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cf_core::{
    AppState, CircuitBreakerConfig, CircuitState, ConfigFetcher, FlushPolicy,
    LifecycleCoordinator, PersistentQueue, Pipelines, PollingConfig, QueueConfig, QueueProcessor,
    Result, SessionConfig, SessionManager,
};
use cf_core_tests::utils::{
    error_response, fetcher_with, json_response, manager_with, manual_clock, not_modified,
    wait_until, ScriptedTransport, SummaryRecorder,
};

/// Settings come back 304 on the second check: the snapshot, listener set,
/// and cached values from the first successful fetch are left untouched.
#[tokio::test]
async fn settings_unchanged_skips_refresh_and_preserves_snapshot() {
    let clock = manual_clock(0);
    let transport = Arc::new(ScriptedTransport::new(
        vec![
            json_response(200, serde_json::json!({"cf_skip_sdk": false, "cf_account_enabled": true})),
            not_modified(),
        ],
        vec![json_response(
            200,
            serde_json::json!({"configs": {"hero": {"value": true, "variation_id": "v1"}}}),
        )],
    ));
    let fetcher = Arc::new(fetcher_with(transport.clone(), clock.clone(), CircuitBreakerConfig::default()));
    let manager = manager_with(fetcher, clock, PollingConfig::default());

    manager.start();
    manager.force_immediate_check();
    assert!(wait_until(|| manager.snapshot().contains_key("hero"), Duration::from_secs(2)).await);
    assert_eq!(transport.post_calls.load(Ordering::SeqCst), 1);

    manager.force_immediate_check();
    // The second settings fetch is a 304; no extra POST should ever follow it.
    assert!(wait_until(|| transport.get_calls.load(Ordering::SeqCst) >= 2, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.post_calls.load(Ordering::SeqCst), 1);
    assert!(manager.get_boolean("hero", false));

    manager.shutdown();
}

/// A nested `experience_behaviour_response` wins over same-named parent
/// fields once the response has gone through the fetcher and landed in the
/// evaluation API.
#[tokio::test]
async fn nested_experience_response_overrides_parent_fields_end_to_end() {
    let clock = manual_clock(0);
    let transport = Arc::new(ScriptedTransport::new(
        vec![json_response(200, serde_json::json!({"cf_skip_sdk": false, "cf_account_enabled": true}))],
        vec![json_response(
            200,
            serde_json::json!({
                "configs": {
                    "hero": {
                        "enabled": true,
                        "variation": "A",
                        "experience_behaviour_response": {
                            "variation": "B",
                            "version": 2
                        }
                    }
                }
            }),
        )],
    ));
    let fetcher = Arc::new(fetcher_with(transport, clock.clone(), CircuitBreakerConfig::default()));
    let manager = manager_with(fetcher, clock, PollingConfig::default());

    manager.start();
    manager.force_immediate_check();
    assert!(wait_until(|| manager.snapshot().contains_key("hero"), Duration::from_secs(2)).await);

    let hero = manager.get_json("hero", serde_json::Value::Null);
    assert_eq!(hero["variation"], serde_json::json!("B"));
    assert_eq!(hero["enabled"], serde_json::json!(true));
    assert!(hero.get("experience_behaviour_response").is_none());

    manager.shutdown();
}

/// Repeated connectivity failures open the breaker; once open, the fetcher
/// stops calling the transport at all until the reset timeout elapses.
#[tokio::test]
async fn circuit_opens_on_repeated_failures_and_recovers_after_timeout() {
    let clock = manual_clock(0);
    let failing_responses = vec![error_response(500), error_response(500), error_response(500)];
    let transport = Arc::new(ScriptedTransport::new(failing_responses, vec![]));
    let fetcher = fetcher_with(
        transport.clone(),
        clock.clone(),
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 1_000,
        },
    );

    for _ in 0..3 {
        assert!(fetcher.fetch_metadata().await.is_err());
    }
    assert_eq!(transport.get_calls.load(Ordering::SeqCst), 3);

    // Circuit is open now: a further call must short-circuit without
    // reaching the transport.
    let result = fetcher.fetch_metadata().await;
    assert!(result.is_err());
    assert_eq!(transport.get_calls.load(Ordering::SeqCst), 3);

    // Past the reset timeout, the breaker allows a half-open trial through.
    clock.advance(Duration::from_millis(1_500));
    let transport2 = Arc::new(ScriptedTransport::new(
        vec![json_response(200, serde_json::json!({"cf_skip_sdk": false, "cf_account_enabled": true}))],
        vec![],
    ));
    let fetcher2 = fetcher_with(transport2.clone(), clock, CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout_ms: 1_000,
    });
    assert!(fetcher2.fetch_metadata().await.is_ok());
    assert_eq!(transport2.get_calls.load(Ordering::SeqCst), 1);
}

/// A circuit breaker registry snapshot directly exercises the same
/// open-then-recover path against one shared breaker instance (rather than
/// two fetchers as above), confirming the transition through `HalfOpen`.
#[tokio::test]
async fn breaker_registry_reports_half_open_then_closed_after_recovery() {
    use cf_core::CircuitBreakerRegistry;

    let clock = manual_clock(0);
    let registry = CircuitBreakerRegistry::new(
        CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 500,
        },
        clock.clone(),
    );
    let breaker = registry.get_or_create("probe");
    let _ = breaker
        .execute("probe", || async { Err::<(), _>(cf_core::Error::network("boom")) }, None)
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_millis(600));
    let result = breaker.execute("probe", || async { Ok::<_, cf_core::Error>(()) }, None).await;
    assert!(result.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

struct AlwaysSucceeds;
#[async_trait::async_trait]
impl QueueProcessor<TestPayload> for AlwaysSucceeds {
    async fn process(&self, _data: &TestPayload) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct TestPayload {
    value: i32,
}

/// A queue with two same-`unique_key` enqueues (dedup keeps only the last)
/// survives a simulated process restart with its pending list intact.
#[tokio::test]
async fn queue_durability_survives_restart_with_dedup_intact() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock(0);

    {
        let queue = PersistentQueue::new(
            dir.path(),
            "events",
            QueueConfig { jitter_factor: 0.0, ..QueueConfig::default() },
            clock.clone(),
            Arc::new(AlwaysSucceeds),
        )
        .unwrap();
        queue.enqueue(TestPayload { value: 1 }, 0, Some("k".into())).await.unwrap();
        queue.enqueue(TestPayload { value: 2 }, 0, Some("k".into())).await.unwrap();
        queue.enqueue(TestPayload { value: 3 }, 1, None).await.unwrap();
        assert_eq!(queue.pending_count().await, 2);
    }

    let reloaded = PersistentQueue::new(
        dir.path(),
        "events",
        QueueConfig { jitter_factor: 0.0, ..QueueConfig::default() },
        clock,
        Arc::new(AlwaysSucceeds),
    )
    .unwrap();
    assert_eq!(reloaded.pending_count().await, 2);
    let successes = reloaded.drain().await;
    assert_eq!(successes, 2);
}

/// Backgrounding past the threshold and returning to the foreground rotates
/// the session via the Lifecycle Coordinator's wiring, not just direct
/// `SessionManager` calls.
#[tokio::test]
async fn lifecycle_background_past_threshold_rotates_session_on_foreground() {
    let clock = manual_clock(0);
    let session_manager = Arc::new(SessionManager::new(
        SessionConfig {
            background_threshold_ms: 1_000,
            min_session_duration_ms: 0,
            ..SessionConfig::default()
        },
        clock.clone(),
        "cf",
    ));
    let transport = Arc::new(ScriptedTransport::new(vec![not_modified(); 8], vec![]));
    let fetcher = Arc::new(cf_core_tests::utils::fetcher_with(
        transport,
        clock.clone(),
        CircuitBreakerConfig::default(),
    ));
    let manager = cf_core_tests::utils::manager_with(fetcher.clone(), clock.clone(), PollingConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let pipelines = Arc::new(
        Pipelines::new(
            dir.path(),
            Arc::new(cf_core_tests::utils::ScriptedTransport::new(vec![], vec![])),
            cf_core::CircuitBreakerRegistry::new(Default::default(), clock.clone()),
            "https://x/events",
            "https://x/summaries",
            QueueConfig::default(),
            clock.clone(),
            FlushPolicy { queue_size: 100, flush_time_seconds: 60 },
            FlushPolicy { queue_size: 100, flush_time_seconds: 60 },
        )
        .unwrap(),
    );
    let coordinator = LifecycleCoordinator::new(manager, fetcher, session_manager.clone(), pipelines, true);

    let before = session_manager.session_id();
    coordinator.on_app_state_changed(AppState::Background);
    clock.advance(Duration::from_millis(1_500));
    coordinator.on_app_state_changed(AppState::Foreground);
    assert_ne!(session_manager.session_id(), before);
}

/// When the server's SDK settings carry `cf_skip_sdk: true`, evaluation
/// falls back to the caller's default and no summary is pushed for it,
/// even though the Config Manager did successfully fetch a Config.
#[tokio::test]
async fn skip_sdk_gate_suppresses_evaluation_and_summary_push() {
    let clock = manual_clock(0);
    let transport = Arc::new(ScriptedTransport::new(
        vec![json_response(200, serde_json::json!({"cf_skip_sdk": true, "cf_account_enabled": true}))],
        vec![json_response(
            200,
            serde_json::json!({"configs": {"hero": {"value": true, "variation_id": "v1"}}}),
        )],
    ));
    let fetcher = Arc::new(fetcher_with(transport, clock.clone(), CircuitBreakerConfig::default()));
    let manager = manager_with(fetcher, clock, PollingConfig::default());
    let recorder = SummaryRecorder::new();
    manager.set_summary_pusher(recorder.as_pusher());

    manager.start();
    manager.force_immediate_check();
    // The settings check itself still runs (and observes `cf_skip_sdk`), but
    // the gate being closed means no config refresh is ever attempted.
    assert!(wait_until(|| transport.get_calls.load(Ordering::SeqCst) >= 1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.post_calls.load(Ordering::SeqCst), 0);
    assert!(manager.snapshot().is_empty());

    assert!(!manager.get_boolean("hero", false));
    assert!(recorder.pushes.lock().unwrap().is_empty());

    manager.shutdown();
}
