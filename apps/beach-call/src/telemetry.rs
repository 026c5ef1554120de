use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

fn describe_metrics() {
    describe_gauge!(
        "beach_call_sessions_registered",
        "Users currently registered for calls"
    );
    describe_gauge!("beach_call_calls_active", "Calls provisioning or in progress");
    describe_counter!(
        "beach_call_calls_started_total",
        "Calls whose media session was established"
    );
    describe_counter!(
        "beach_call_calls_failed_total",
        "Accepted calls that could not be set up"
    );
    describe_counter!(
        "beach_call_candidates_queued_total",
        "Browser candidates held back until their endpoint existed"
    );
    describe_counter!(
        "beach_call_malformed_messages_total",
        "Inbound signaling frames that could not be decoded"
    );
}
