//! External progress and health endpoints with an embedded progress UI.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use prometheus_client::registry::Registry;
use rust_embed::Embed;
use serde::Serialize;

use crate::error::SuoError;
use crate::metrics::metrics_handler;
use crate::store::{StatusStore, UpgradeStatus};

#[derive(Embed)]
#[folder = "static/"]
struct StaticAssets;

/// Progress payload for the UI and for operators curling the endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub upgrading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UpgradeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
struct ExternalState {
    store: Arc<dyn StatusStore>,
}

/// Always 200: orchestrating infrastructure must not kill the upgrading
/// instance mid-migration, and operators need to see failure state too.
async fn progress(State(state): State<ExternalState>) -> Json<Progress> {
    let payload = match state.store.status().await {
        Ok(status) => Progress {
            upgrading: status.auto_upgrade,
            status: Some(status),
            error: None,
        },
        Err(SuoError::NotInitialized) => Progress {
            upgrading: false,
            status: None,
            error: None,
        },
        Err(e) => Progress {
            upgrading: true,
            status: None,
            error: Some(e.to_string()),
        },
    };
    Json(payload)
}

async fn index() -> impl IntoResponse {
    match StaticAssets::get("index.html") {
        Some(content) => Html(
            std::str::from_utf8(content.data.as_ref())
                .unwrap_or("")
                .to_string(),
        )
        .into_response(),
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

async fn assets(Path(path): Path<String>) -> impl IntoResponse {
    let path = path.trim_start_matches('/');
    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref().to_string())],
                content.data.into_owned(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

/// Router for the external listener.
pub fn router(store: Arc<dyn StatusStore>, registry: Arc<Registry>) -> Router {
    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    Router::new()
        .route("/", get(index))
        .route("/.api/progress", get(progress))
        .route("/.assets/{*path}", get(assets))
        .route("/healthz", get(super::healthz))
        .with_state(ExternalState { store })
        .merge(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_index_present() {
        assert!(StaticAssets::get("index.html").is_some());
    }

    #[test]
    fn test_progress_serialization_skips_empty() {
        let progress = Progress {
            upgrading: false,
            status: None,
            error: None,
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["upgrading"], false);
        assert!(json.get("status").is_none());
        assert!(json.get("error").is_none());
    }
}
