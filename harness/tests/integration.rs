//! Integration Tests for wssiege
//!
//! These tests drive whole runs through the orchestrator, against the
//! in-process stub target and against a real WebSocket echo server.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use wssiege::config::{Preset, RunPlan, TimingConfig};
use wssiege::orchestrator::Orchestrator;
use wssiege::report::{EXIT_THRESHOLDS_FAILED, RunState, ScenarioStatus};
use wssiege::session::Flow;
use wssiege::transport::{ConnectParams, FailurePattern, StubBehavior, StubTransport, WsTransport};

mod common;
use common::*;

// ============================================================================
// Stub Target Runs
// ============================================================================

mod stub_runs {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_constant_concurrency_passes_checks() {
        let transport = StubTransport::new(StubBehavior::default());
        let stats = transport.stats();
        let mut scenario = constant_scenario("stable", Flow::Stable, 5, 2);
        scenario.overrides = hold(500);

        let report = Orchestrator::new(
            plan(vec![scenario], &[("checks", "rate>0.999")]),
            stub_context(transport),
            test_timing(),
        )
        .run()
        .await;

        assert_eq!(report.state, RunState::Completed);
        assert!(report.overall_passed, "{}", report.render_summary());
        assert_eq!(report.exit_status(), 0);

        let counters = report.totals.counters;
        assert!(counters.attempted >= 5);
        assert_eq!(counters.connect_succeeded, counters.attempted);
        assert_eq!(counters.errors, 0);
        assert_eq!(counters.sent, counters.connect_succeeded);
        assert_eq!(stats.peak(), 5);
        assert_eq!(stats.open_now(), 0);
        assert_eq!(report.scenarios[0].peak_concurrency, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_with_half_failures_fails_checks() {
        let transport = StubTransport::new(StubBehavior {
            connect_failures: FailurePattern::Ratio(0.5),
            ..Default::default()
        });
        let mut scenario = arrival_scenario(
            "ramp",
            Flow::Intermittent,
            0.0,
            vec![stage(10.0, 1), stage(10.0, 2)],
        );
        scenario.overrides = hold(200);

        let report = Orchestrator::new(
            plan(vec![scenario], &[("checks", "rate>0.999")]),
            stub_context(transport),
            test_timing(),
        )
        .run()
        .await;

        let counters = report.totals.counters;
        assert_eq!(counters.attempted, 25);
        assert_eq!(counters.connect_failed, 12);
        assert_eq!(counters.connect_succeeded, 13);
        assert_eq!(counters.dropped, 0);

        let checks = &report.thresholds[0];
        assert!(!checks.passed);
        let observed = checks.observed.unwrap();
        assert!((observed - 0.52).abs() < 1e-9, "observed {}", observed);
        assert!(!report.overall_passed);
        assert_eq!(report.exit_status(), EXIT_THRESHOLDS_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_rejections_count_as_errors() {
        let transport = StubTransport::new(StubBehavior {
            max_payload: Some(64 * 1024),
            reject_nul: true,
            ..Default::default()
        });
        let stats = transport.stats();
        let mut scenario = arrival_scenario(
            "malformed",
            Flow::MalformedInjection,
            1.0,
            vec![stage(1.0, 1)],
        );
        scenario.pool_limit = Some(1);

        let report = Orchestrator::new(
            plan(vec![scenario], &[]),
            stub_context(transport),
            test_timing(),
        )
        .run()
        .await;

        let counters = report.scenarios[0].metrics.counters;
        let rejected = stats.sends_rejected.load(Ordering::SeqCst);
        assert_eq!(counters.attempted, 1);
        assert!(rejected >= 1);
        assert_eq!(counters.errors, rejected);
        assert_eq!(counters.sent + counters.errors, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_arrivals_excluded_from_checks() {
        let transport = StubTransport::new(StubBehavior::default());
        let mut scenario = arrival_scenario("burst", Flow::Stable, 10.0, vec![stage(10.0, 1)]);
        scenario.pool_limit = Some(2);
        scenario.overrides = hold(5000);

        let report = Orchestrator::new(
            plan(
                vec![scenario],
                &[("checks", "rate>0.999"), ("ws_dropped_sessions", "count<1")],
            ),
            stub_context(transport),
            test_timing(),
        )
        .run()
        .await;

        let counters = report.totals.counters;
        assert_eq!(counters.attempted, 2);
        assert_eq!(counters.dropped, 8);
        assert_eq!(counters.success_rate(), Some(1.0));

        let passed: Vec<bool> = report.thresholds.iter().map(|t| t.passed).collect();
        assert_eq!(passed, vec![true, false]);
        assert!(!report.overall_passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abuse_preset_honours_offsets() {
        let transport = StubTransport::new(StubBehavior::default());
        let stats = transport.stats();

        let report = Orchestrator::new(
            RunPlan::preset(Preset::Abuse),
            stub_context(transport),
            TimingConfig::default(),
        )
        .run()
        .await;

        assert_eq!(report.state, RunState::Completed);
        assert!(
            report
                .scenarios
                .iter()
                .all(|s| s.status == ScenarioStatus::Completed)
        );

        let offsets = stats.connect_offsets();
        let between = |from: u64, to: u64| {
            offsets
                .iter()
                .filter(|o| **o >= Duration::from_secs(from) && **o <= Duration::from_secs(to))
                .count()
        };
        assert_eq!(offsets.len(), 52);
        assert_eq!(between(0, 1), 1);
        assert_eq!(between(15, 16), 50);
        assert_eq!(between(20, 21), 1);

        let spam = &report.scenarios[0];
        assert_eq!(spam.name, "message_spam");
        assert_eq!(spam.metrics.counters.sent, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_scenario_does_not_stop_siblings() {
        let transport = StubTransport::new(StubBehavior::default());
        let mut valid = constant_scenario("valid", Flow::Stable, 2, 1);
        valid.overrides = hold(200);
        let mut invalid = constant_scenario("invalid", Flow::Stable, 2, 1);
        invalid.constant_value = None;

        let report = Orchestrator::new(
            plan(vec![invalid, valid], &[]),
            stub_context(transport),
            test_timing(),
        )
        .run()
        .await;

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.scenarios[0].status, ScenarioStatus::Failed);
        assert!(report.scenarios[0].error.is_some());
        assert_eq!(report.scenarios[0].metrics.counters.attempted, 0);
        assert_eq!(report.scenarios[1].status, ScenarioStatus::Completed);
        assert!(report.scenarios[1].metrics.counters.connect_succeeded >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_on_rejected_scenario_fails_run() {
        let transport = StubTransport::new(StubBehavior::default());
        let mut ok = constant_scenario("ok", Flow::Stable, 2, 1);
        ok.overrides = hold(200);
        let broken = arrival_scenario("broken", Flow::Stable, 1.0, Vec::new());

        let report = Orchestrator::new(
            plan(
                vec![ok, broken],
                &[("checks", "rate>0.999"), ("checks{scenario:broken}", "rate>0.999")],
            ),
            stub_context(transport),
            test_timing(),
        )
        .run()
        .await;

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.scenarios[1].status, ScenarioStatus::Failed);
        assert!(report.thresholds[0].passed);
        assert_eq!(report.thresholds[1].observed, None);
        assert!(!report.thresholds[1].passed);
        assert!(!report.overall_passed);
        assert_eq!(report.exit_status(), EXIT_THRESHOLDS_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_run() {
        let transport = StubTransport::new(StubBehavior::default());
        let stats = transport.stats();
        let orchestrator = Orchestrator::new(
            plan(vec![constant_scenario("long", Flow::Stable, 3, 600)], &[]),
            stub_context(transport),
            test_timing(),
        );
        let cancel = orchestrator.cancellation_token();
        let run = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(stats.open_now(), 3);
        cancel.cancel();

        let report = run.await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.scenarios[0].status, ScenarioStatus::Interrupted);
        assert!(report.elapsed < Duration::from_secs(10));
        assert_eq!(stats.open_now(), 0);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 3);
    }
}

// ============================================================================
// WebSocket Target Runs
// ============================================================================

mod websocket_runs {
    use super::*;

    fn ws_timing() -> TimingConfig {
        TimingConfig {
            graceful_stop: Duration::from_secs(3),
            force_close: Duration::from_secs(1),
            ..TimingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_echo_target_round_trip() {
        let (addr, server_handle) = start_echo_server().await;
        let mut scenario = constant_scenario("echo", Flow::Stable, 2, 1);
        scenario.overrides = hold(300);

        let session = context(
            Arc::new(WsTransport::new()),
            ConnectParams::new(format!("ws://{}/ws", addr)).with_token("secret", true),
        );
        let report = Orchestrator::new(plan(vec![scenario], &[("checks", "rate>0.999")]), session, ws_timing())
            .run()
            .await;

        let counters = report.totals.counters;
        assert!(counters.connect_succeeded >= 2);
        assert_eq!(counters.connect_failed, 0);
        assert!(counters.sent > 0);
        assert_eq!(counters.received, counters.sent);
        assert!(report.overall_passed, "{}", report.render_summary());
        assert!(report.totals.connect_latency.count() >= 2);

        server_handle.abort();
    }

    #[tokio::test]
    async fn test_refused_handshake_fails_checks() {
        let (addr, server_handle) = start_echo_server().await;
        let scenario = constant_scenario("denied", Flow::Stable, 1, 1);

        let session = context(
            Arc::new(WsTransport::new()),
            ConnectParams::new(format!("ws://{}/deny", addr)),
        );
        let report = Orchestrator::new(plan(vec![scenario], &[("checks", "rate>0.999")]), session, ws_timing())
            .run()
            .await;

        let counters = report.totals.counters;
        assert!(counters.connect_failed >= 1);
        assert_eq!(counters.connect_succeeded, 0);
        assert_eq!(report.thresholds[0].observed, Some(0.0));
        assert!(!report.overall_passed);

        server_handle.abort();
    }
}
