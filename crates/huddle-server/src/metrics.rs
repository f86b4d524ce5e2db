//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything records a metric.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections currently registered (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connections torn down (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Events written to sockets (counter, labels: event).
pub const WS_BROADCAST_TOTAL: &str = "ws_broadcast_total";
/// Events discarded for slow connections (counter, labels: event).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Connections closed on a full queue (counter).
pub const WS_QUEUE_FULL_CLOSES_TOTAL: &str = "ws_queue_full_closes_total";
/// Client requests routed (counter, labels: action).
pub const WS_REQUESTS_TOTAL: &str = "ws_requests_total";
/// Push tasks accepted (counter, labels: kind).
pub const PUSH_ENQUEUED_TOTAL: &str = "push_enqueued_total";
/// Pushes accepted by the relay (counter).
pub const PUSH_SENT_TOTAL: &str = "push_sent_total";
/// Pushes that failed (counter, labels: reason).
pub const PUSH_FAILED_TOTAL: &str = "push_failed_total";
/// Devices the relay asked to forget (counter).
pub const PUSH_DEVICE_REMOVED_TOTAL: &str = "push_device_removed_total";
