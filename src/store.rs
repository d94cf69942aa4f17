//! Status store interface.
//!
//! The shared Postgres database is both the thing being migrated and the
//! coordination medium: every instance reads the same status row at startup,
//! and the claim write is the only mutation that requires exclusivity.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SuoError;
use crate::plan::MigrationPlan;

/// Outcome of the most recent auto-upgrade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
}

impl Outcome {
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            Some("success") => Self::Success,
            Some("failure") => Self::Failure,
            _ => Self::Unknown,
        }
    }
}

/// The persisted upgrade status row, the single source of truth consulted by
/// every instance at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    pub current_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_version: Option<String>,
    /// True while a fleet-wide upgrade is outstanding. Cleared exactly once,
    /// by the instance that completes the full plan.
    pub auto_upgrade: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<MigrationPlan>,
    pub last_outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Durable upgrade status persistence plus the coordination primitives built
/// on it.
///
/// A fresh store (no status table or row yet) surfaces
/// [`SuoError::NotInitialized`], which callers treat as "nothing to upgrade".
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Bootstrap the status schema if missing. Idempotent.
    async fn ensure_schema(&self) -> Result<(), SuoError>;

    async fn status(&self) -> Result<UpgradeStatus, SuoError>;

    /// Atomically claim the upgrade: transition `current_version` from
    /// `expected_current` to `target` and record this instance as owner.
    /// Returns false when another instance's claim already succeeded.
    async fn claim(&self, expected_current: &str, target: &str) -> Result<bool, SuoError>;

    async fn set_plan(&self, plan: &MigrationPlan) -> Result<(), SuoError>;

    async fn set_auto_upgrade(&self, enabled: bool) -> Result<(), SuoError>;

    async fn set_outcome(&self, success: bool) -> Result<(), SuoError>;

    /// Distinct application identities currently connected to the store,
    /// minus `exclude`. Used only for drain detection; a stale snapshot just
    /// costs one more loop iteration.
    async fn active_applications(&self, exclude: &[String]) -> Result<Vec<String>, SuoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_column() {
        assert_eq!(Outcome::from_column(Some("success")), Outcome::Success);
        assert_eq!(Outcome::from_column(Some("failure")), Outcome::Failure);
        assert_eq!(Outcome::from_column(Some("garbage")), Outcome::Unknown);
        assert_eq!(Outcome::from_column(None), Outcome::Unknown);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = UpgradeStatus {
            current_version: "5.1.0".to_string(),
            desired_version: Some("5.3.2".to_string()),
            auto_upgrade: true,
            plan: None,
            last_outcome: Outcome::Unknown,
            claimed_by: None,
            claimed_at: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["currentVersion"], "5.1.0");
        assert_eq!(json["desiredVersion"], "5.3.2");
        assert_eq!(json["autoUpgrade"], true);
        assert_eq!(json["lastOutcome"], "unknown");
    }
}
