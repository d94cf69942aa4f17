//! Internal configuration endpoint.
//!
//! Cooperating processes poll `POST /.internal/configuration` for site
//! configuration and service-connection DSNs. While the upgrade window is
//! open, every DSN is replaced by the sentinel value, so dependents hold off
//! instead of connecting against a half-migrated schema.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use super::MIGRATION_IN_PROGRESS_SENTINEL_DSN;

/// Raw configuration payload, mirroring what the service's configuration
/// server normally returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfiguration {
    /// Serialized site configuration (empty object during upgrade).
    pub site: String,
    /// Per-schema connection DSNs, all sentinels during upgrade.
    pub service_connections: BTreeMap<String, String>,
}

impl RawConfiguration {
    /// The holding-pattern payload served throughout the upgrade window.
    pub fn sentinel(schemas: &[String]) -> Self {
        Self {
            site: "{}".to_string(),
            service_connections: schemas
                .iter()
                .map(|s| (s.clone(), MIGRATION_IN_PROGRESS_SENTINEL_DSN.to_string()))
                .collect(),
        }
    }
}

#[derive(Clone)]
struct InternalState {
    schemas: Vec<String>,
}

async fn configuration(State(state): State<InternalState>) -> Json<RawConfiguration> {
    Json(RawConfiguration::sentinel(&state.schemas))
}

/// Router for the internal listener.
pub fn router(schemas: Vec<String>) -> Router {
    Router::new()
        .route("/.internal/configuration", post(configuration))
        .route("/healthz", get(super::healthz))
        .with_state(InternalState { schemas })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_payload_replaces_all_dsns() {
        let payload = RawConfiguration::sentinel(&[
            "frontend".to_string(),
            "codeintel".to_string(),
            "codeinsights".to_string(),
        ]);

        assert_eq!(payload.site, "{}");
        assert_eq!(payload.service_connections.len(), 3);
        for dsn in payload.service_connections.values() {
            assert_eq!(dsn, MIGRATION_IN_PROGRESS_SENTINEL_DSN);
        }
    }

    #[test]
    fn test_sentinel_payload_serialization() {
        let payload = RawConfiguration::sentinel(&["frontend".to_string()]);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["site"], "{}");
        assert_eq!(
            json["serviceConnections"]["frontend"],
            MIGRATION_IN_PROGRESS_SENTINEL_DSN
        );
    }
}
