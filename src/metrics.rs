//! Prometheus metrics for the auto-upgrade sequence.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for per-phase gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

/// All Prometheus metrics for the upgrader.
pub struct Metrics {
    /// Current upgrade phase (1=active, 0=inactive).
    pub phase_info: Family<PhaseLabels, Gauge>,
    pub claim_attempts_total: Counter,
    pub drain_waits_total: Counter,
    pub steps_applied_total: Counter,
}

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let phase_info = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "suo_upgrade_phase_info",
            "Current upgrade phase (1=active, 0=inactive)",
            phase_info.clone(),
        );

        let claim_attempts_total = Counter::default();
        registry.register(
            "suo_claim_attempts",
            "Total number of upgrade lock claim attempts",
            claim_attempts_total.clone(),
        );

        let drain_waits_total = Counter::default();
        registry.register(
            "suo_drain_waits",
            "Total number of loop iterations spent waiting for connection drain",
            drain_waits_total.clone(),
        );

        let steps_applied_total = Counter::default();
        registry.register(
            "suo_steps_applied",
            "Total number of migration steps applied",
            steps_applied_total.clone(),
        );

        Self {
            phase_info,
            claim_attempts_total,
            drain_waits_total,
            steps_applied_total,
        }
    }

    /// Mark `phase` as the single active phase.
    pub fn set_phase(&self, phase: &str) {
        for known in ["claiming", "planning", "migrating", "last-mile", "done"] {
            self.phase_info
                .get_or_create(&PhaseLabels {
                    phase: known.to_string(),
                })
                .set(i64::from(known == phase));
        }
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
pub async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}
