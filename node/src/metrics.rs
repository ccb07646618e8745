//! # Prometheus Metrics
//!
//! One [`prometheus::Registry`] per process. Every validator registers its
//! consensus metrics into it (told apart by their `node` label) and the
//! node adds a few gauges of its own. Scraped at `GET /metrics`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Node-level metric handles plus the shared registry.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Validators running in this process.
    pub validators: IntGauge,
    /// Lowest committed height across all validators.
    pub min_committed_height: IntGauge,
    /// Operations handed to the validators' operation pools.
    pub operations_submitted_total: IntCounter,
}

impl NodeMetrics {
    /// Creates the registry and registers the node metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace("isaac_node");

        let validators = IntGauge::with_opts(opts("validators", "Validators in this process"))?;
        let min_committed_height = IntGauge::with_opts(opts(
            "min_committed_height",
            "Lowest committed height across validators",
        ))?;
        let operations_submitted_total = IntCounter::with_opts(opts(
            "operations_submitted_total",
            "Operations submitted to the operation pools",
        ))?;

        registry.register(Box::new(validators.clone()))?;
        registry.register(Box::new(min_committed_height.clone()))?;
        registry.register(Box::new(operations_submitted_total.clone()))?;

        Ok(Self {
            registry,
            validators,
            min_committed_height,
            operations_submitted_total,
        })
    }

    /// The registry validators register their consensus metrics into.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
