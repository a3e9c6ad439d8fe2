use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 35.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "proxy_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "proxy_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_gauge!(
            "proxy_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        // guards & safety
        describe_counter!(
            "proxy_guard_rejected_total",
            Unit::Count,
            "Requests rejected by the source guard"
        );
        describe_counter!(
            "proxy_safety_rejected_total",
            Unit::Count,
            "Upstream targets rejected by the safety filter"
        );

        // upstream
        describe_counter!(
            "proxy_upstream_requests_total",
            Unit::Count,
            "Upstream forwarding attempts by result"
        );
        describe_histogram!(
            "proxy_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration"
        );

        // rules
        describe_counter!(
            "proxy_hardcoded_responses_total",
            Unit::Count,
            "Responses served from hardcoded rules"
        );
        describe_counter!(
            "proxy_rule_reloads_total",
            Unit::Count,
            "Rule file reload attempts by artifact and result"
        );

        // replicator
        describe_counter!(
            "proxy_replicator_received_total",
            Unit::Count,
            "Replicator datagrams received by outcome"
        );
        describe_counter!(
            "proxy_replicator_sent_total",
            Unit::Count,
            "Replicator datagrams transmitted"
        );

        // connections
        describe_gauge!(
            "proxy_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "proxy_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
