//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

#![allow(dead_code)]

use axum::{
    Router,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::get,
};
use indexmap::IndexMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use wssiege::arrival::{ScenarioMode, Stage};
use wssiege::config::{RunPlan, ScenarioConfig, TimingConfig};
use wssiege::protocol::PayloadTemplates;
use wssiege::session::{Flow, FlowOverrides, HoldPolicy, SessionContext};
use wssiege::threshold::ThresholdDecl;
use wssiege::transport::{ConnectParams, StubTransport, Transport};

/// Session context wired to an in-process stub target
pub fn stub_context(transport: StubTransport) -> SessionContext {
    context(Arc::new(transport), ConnectParams::new("stub://target"))
}

pub fn context(transport: Arc<dyn Transport>, params: ConnectParams) -> SessionContext {
    SessionContext {
        transport,
        params,
        templates: Arc::new(PayloadTemplates::default()),
        connect_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(1),
    }
}

/// Short drain windows so tests finish quickly
pub fn test_timing() -> TimingConfig {
    TimingConfig {
        graceful_stop: Duration::from_secs(3),
        force_close: Duration::from_secs(1),
        progress_interval: Duration::from_secs(1),
        ..TimingConfig::default()
    }
}

pub fn hold(ms: u64) -> FlowOverrides {
    FlowOverrides {
        hold: Some(HoldPolicy::Fixed(Duration::from_millis(ms))),
        ..Default::default()
    }
}

pub fn stage(target: f64, secs: u64) -> Stage {
    Stage {
        target,
        duration: Duration::from_secs(secs),
    }
}

pub fn constant_scenario(name: &str, flow: Flow, sessions: u32, secs: u64) -> ScenarioConfig {
    let mut config = ScenarioConfig::new(name, flow, ScenarioMode::ConstantConcurrency);
    config.constant_value = Some(sessions);
    config.duration = Some(Duration::from_secs(secs));
    config
}

pub fn arrival_scenario(name: &str, flow: Flow, start: f64, stages: Vec<Stage>) -> ScenarioConfig {
    let mut config = ScenarioConfig::new(name, flow, ScenarioMode::RampingArrivalRate);
    config.start_value = start;
    config.stages = stages;
    config
}

pub fn plan(scenarios: Vec<ScenarioConfig>, thresholds: &[(&str, &str)]) -> RunPlan {
    let mut decls: IndexMap<String, Vec<ThresholdDecl>> = IndexMap::new();
    for (key, expr) in thresholds {
        decls
            .entry(key.to_string())
            .or_default()
            .push(ThresholdDecl::from(*expr));
    }
    RunPlan {
        scenarios,
        thresholds: decls,
    }
}

async fn echo_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo)
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn deny() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

/// Start an echo WebSocket target on a random port.
/// `/ws` echoes every message; `/deny` refuses the handshake.
pub async fn start_echo_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/ws", get(echo_handler))
        .route("/deny", get(deny));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, handle)
}
