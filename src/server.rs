//! Control-plane HTTP surfaces, active only during the upgrade window.
//!
//! Two independent listeners: an internal configuration endpoint that tells
//! dependent processes to hold off connecting (sentinel DSNs), and an external
//! progress/health endpoint for operators and liveness probes. Both are torn
//! down when the upgrade sequence ends, success or failure.

pub mod external;
pub mod internal;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// DSN handed to dependents in place of real connection configuration while
/// the shared schema is mid-migration. Dependents recognizing it block and
/// re-poll instead of connecting against a half-migrated schema.
pub const MIGRATION_IN_PROGRESS_SENTINEL_DSN: &str = "postgres://migration-in-progress";

/// Bind a listener for one of the control-plane surfaces. A bind failure must
/// abort the upgrade before any claim is taken: migrating without a health or
/// sentinel-configuration surface would leave the fleet blind mid-window.
pub async fn bind(addr: SocketAddr, name: &'static str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {name} server on {addr}"))?;
    info!("{} server listening on {}", name, listener.local_addr()?);
    Ok(listener)
}

/// Run an already-bound listener until the upgrade window closes.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut window: watch::Receiver<bool>,
    name: &'static str,
) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = window.changed().await;
            info!("{} server shutting down", name);
        })
        .await?;
    Ok(())
}

pub(crate) async fn healthz() -> axum::http::StatusCode {
    axum::http::StatusCode::OK
}
