use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup before any
    /// `counter!` / `gauge!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_gauge!(
            "pg_active_connections",
            Unit::Count,
            "Current active client connections"
        );
        describe_counter!(
            "pg_connections_total",
            Unit::Count,
            "Total client connections accepted"
        );
        describe_counter!(
            "pg_tunnels",
            Unit::Count,
            "Tunnels established, labelled by client id"
        );
        describe_counter!(
            "pg_bytes_total",
            Unit::Bytes,
            "Bytes relayed through tunnels, labelled by direction"
        );
        describe_counter!(
            "pg_upstream_failures_total",
            Unit::Count,
            "Upstream dial or handshake failures, labelled by proxy host"
        );
        describe_counter!(
            "pg_health_check_total",
            Unit::Count,
            "Active health check attempts"
        );
        describe_gauge!(
            "pg_upstream_health_status",
            Unit::Count,
            "Upstream health: 1=healthy 0=unhealthy"
        );
        describe_gauge!(
            "pg_upstream_pool_size",
            Unit::Count,
            "Number of upstream proxies currently loaded"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
