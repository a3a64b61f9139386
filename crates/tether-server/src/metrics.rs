//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections closed (counter, labels: code).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Connections refused before a socket was created (counter, labels: reason).
pub const WS_REJECTIONS_TOTAL: &str = "ws_rejections_total";
/// Actions blocked by middleware (counter, labels: kind).
pub const MIDDLEWARE_BLOCKS_TOTAL: &str = "middleware_blocks_total";
/// Publications accepted by the broker (counter).
pub const PUBLISHES_TOTAL: &str = "publishes_total";
/// Publications delivered to sockets (counter).
pub const PUBLICATIONS_DELIVERED_TOTAL: &str = "publications_delivered_total";
/// Publications the fan-out task fell behind on (counter).
pub const BROKER_LAGGED_TOTAL: &str = "broker_lagged_total";
/// Active channel subscriptions (gauge).
pub const SUBSCRIPTIONS_ACTIVE: &str = "subscriptions_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_REJECTIONS_TOTAL,
            MIDDLEWARE_BLOCKS_TOTAL,
            PUBLISHES_TOTAL,
            PUBLICATIONS_DELIVERED_TOTAL,
            BROKER_LAGGED_TOTAL,
            SUBSCRIPTIONS_ACTIVE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
