use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder once and returns its render handle.
/// Safe to call again (tests, standalone mode); later calls reuse the
/// first recorder.
pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

/// Renders the current metric snapshot in the Prometheus exposition format.
pub fn render_metrics() -> String {
    match METRICS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}
