use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wssiege::config::{Config, RunPlan};
use wssiege::error::HarnessError;
use wssiege::orchestrator::Orchestrator;
use wssiege::protocol::PayloadTemplates;
use wssiege::report::EXIT_SETUP_FAILED;
use wssiege::session::SessionContext;
use wssiege::transport::{ConnectParams, StubBehavior, StubTransport, Transport, WsTransport};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wssiege=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!("Target: {}", config.target.url);

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    let plan = match &config.plan_path {
        Some(path) => match RunPlan::load(path) {
            Ok(plan) => {
                info!("Loaded run plan from {:?}", path);
                plan
            }
            Err(e) => {
                error!("{} ({:?})", HarnessError::from(e), path);
                return Ok(ExitCode::from(EXIT_SETUP_FAILED));
            }
        },
        None => {
            info!("Using {:?} preset", config.preset);
            RunPlan::preset(config.preset)
        }
    };

    let transport: Arc<dyn Transport> = if config.dry_run.enabled {
        warn!(
            "Dry run: no traffic leaves this process (failure rate {})",
            config.dry_run.failure_rate
        );
        Arc::new(StubTransport::new(StubBehavior::dry_run(
            config.dry_run.failure_rate,
        )))
    } else {
        Arc::new(WsTransport::new())
    };

    let mut params = ConnectParams::new(config.target.url.clone());
    if let Some(token) = &config.target.auth_token {
        params = params.with_token(token, config.target.token_in_query);
    }

    let session = SessionContext {
        transport,
        params,
        templates: Arc::new(PayloadTemplates::default()),
        connect_timeout: config.timing.connect_timeout,
        close_timeout: config.timing.close_timeout,
    };

    let orchestrator = Orchestrator::new(plan, session, config.timing.clone());
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping run");
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await;
    println!("{}", report.render_summary());

    if let Some(path) = &config.report_path {
        let json = report.to_json().context("failed to serialize report")?;
        std::fs::write(path, json).with_context(|| format!("failed to write report to {:?}", path))?;
        info!("Report written to {:?}", path);
    }

    Ok(ExitCode::from(report.exit_status()))
}
