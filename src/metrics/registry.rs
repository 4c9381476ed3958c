use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) work anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
/// Installation is idempotent so tests can start several servers in one
/// process.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> Self {
        let handle = HANDLE
            .get_or_init(|| {
                let handle = PrometheusBuilder::new()
                    .set_buckets_for_metric(
                        metrics_exporter_prometheus::Matcher::Suffix(
                            "_latency_seconds".to_string(),
                        ),
                        LATENCY_BUCKETS,
                    )
                    .expect("valid matcher")
                    .set_buckets_for_metric(
                        metrics_exporter_prometheus::Matcher::Suffix(
                            "_duration_seconds".to_string(),
                        ),
                        LATENCY_BUCKETS,
                    )
                    .expect("valid matcher")
                    .install_recorder()
                    .expect("failed to install metrics recorder");
                describe_all();
                handle
            })
            .clone();

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_all() {
    // shared store
    describe_counter!(
        "tungo_redis_operations_total",
        Unit::Count,
        "Registry operations against the shared store"
    );
    describe_histogram!(
        "tungo_redis_latency_seconds",
        Unit::Seconds,
        "Latency of shared-store operations"
    );

    // registry cache
    describe_counter!(
        "tungo_cache_hits_total",
        Unit::Count,
        "Tunnel lookups served from the local cache"
    );
    describe_counter!(
        "tungo_cache_misses_total",
        Unit::Count,
        "Tunnel lookups that fell through to the shared store"
    );
    describe_counter!(
        "tungo_pubsub_messages_total",
        Unit::Count,
        "Invalidation messages received over pub/sub"
    );

    // directory state
    describe_gauge!(
        "tungo_tunnels_active",
        Unit::Count,
        "Live tunnels owned by this server"
    );
    describe_gauge!(
        "tungo_servers_active",
        Unit::Count,
        "Servers currently visible in the directory"
    );

    // peer proxy
    describe_counter!(
        "tungo_proxy_requests_total",
        Unit::Count,
        "Requests forwarded to peer servers"
    );
    describe_histogram!(
        "tungo_proxy_latency_seconds",
        Unit::Seconds,
        "Latency of peer-forwarded requests"
    );

    // public request path
    describe_counter!(
        "tungo_http_requests_total",
        Unit::Count,
        "Public HTTP requests processed"
    );
    describe_histogram!(
        "tungo_http_request_duration_seconds",
        Unit::Seconds,
        "Public request duration from the requester's perspective"
    );

    // control plane
    describe_counter!(
        "tungo_connections_total",
        Unit::Count,
        "Control connection attempts by outcome"
    );
    describe_gauge!(
        "tungo_streams_active",
        Unit::Count,
        "In-flight tunneled streams"
    );
    describe_counter!(
        "tungo_send_buffer_dropped_total",
        Unit::Count,
        "Frames dropped because a bounded queue was full"
    );
}
