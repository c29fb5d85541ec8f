use std::sync::OnceLock;

use ::metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub fn record_dispatch_result(result: &str) {
    counter!(
        "moxapp_dispatch_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_simulated_response(status: u16) {
    counter!(
        "moxapp_simulated_responses_total",
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_token_refresh(result: &str) {
    counter!(
        "moxapp_token_refresh_total",
        "result" => result.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_prometheus_payload() {
        let handle = init_metrics_recorder();

        record_dispatch_result("success");
        record_simulated_response(200);
        record_token_refresh("failure");

        let rendered = handle.render();
        assert!(
            rendered.contains("moxapp_dispatch_total"),
            "dispatch counter missing: {rendered}"
        );
        assert!(
            rendered.contains("moxapp_simulated_responses_total"),
            "simulated response counter missing: {rendered}"
        );
        assert!(
            rendered.contains("moxapp_token_refresh_total"),
            "token refresh counter missing: {rendered}"
        );
    }
}
