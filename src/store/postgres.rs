//! Postgres-backed status store.
//!
//! A single-row `upgrade_status` table holds the fleet-wide upgrade state; the
//! claim is a conditional UPDATE keyed on `current_version`, so at most one
//! concurrent claimant wins. Connection drain is observed through
//! `pg_stat_activity`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sqlx::Row;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::warn;

use crate::error::SuoError;
use crate::plan::MigrationPlan;
use crate::store::{Outcome, StatusStore, UpgradeStatus};

/// Postgres error code for "relation does not exist": the status table has
/// never been created, i.e. a fresh store.
const UNDEFINED_TABLE: &str = "42P01";

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS upgrade_status (
    id              boolean PRIMARY KEY DEFAULT TRUE CHECK (id),
    current_version text NOT NULL,
    desired_version text,
    auto_upgrade    boolean NOT NULL DEFAULT FALSE,
    plan            jsonb,
    last_outcome    text,
    claimed_by      text,
    claimed_at      timestamptz,
    updated_at      timestamptz NOT NULL DEFAULT now()
)
";

pub struct PgStatusStore {
    pool: PgPool,
    /// Identity recorded with a successful claim and reported as
    /// `application_name` on every connection.
    app_name: String,
}

impl PgStatusStore {
    /// Connect to the shared store. Individual calls fail fast on pool
    /// acquisition so transient faults surface within a few seconds instead of
    /// hanging the claim loop.
    pub async fn connect(database_url: &SecretString, app_name: &str) -> Result<Self, SuoError> {
        let options = PgConnectOptions::from_str(database_url.expose_secret())
            .map_err(|e| SuoError::store("store::postgres", e))?
            .application_name(app_name);

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| SuoError::store("store::postgres", e))?;

        Ok(Self {
            pool,
            app_name: app_name.to_string(),
        })
    }

    fn map_err(err: sqlx::Error) -> SuoError {
        match &err {
            sqlx::Error::RowNotFound => SuoError::NotInitialized,
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
                SuoError::NotInitialized
            }
            _ => SuoError::store("store::postgres", err),
        }
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn ensure_schema(&self) -> Result<(), SuoError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn status(&self) -> Result<UpgradeStatus, SuoError> {
        let row = sqlx::query(
            "SELECT current_version, desired_version, auto_upgrade, plan, last_outcome,
                    claimed_by, claimed_at
             FROM upgrade_status WHERE id",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Self::map_err)?;

        let plan = row
            .try_get::<Option<serde_json::Value>, _>("plan")
            .map_err(Self::map_err)?
            .and_then(|value| match serde_json::from_value::<MigrationPlan>(value) {
                Ok(plan) => Some(plan),
                Err(e) => {
                    warn!("Ignoring undecodable persisted plan: {}", e);
                    None
                }
            });

        Ok(UpgradeStatus {
            current_version: row.try_get("current_version").map_err(Self::map_err)?,
            desired_version: row.try_get("desired_version").map_err(Self::map_err)?,
            auto_upgrade: row.try_get("auto_upgrade").map_err(Self::map_err)?,
            plan,
            last_outcome: Outcome::from_column(
                row.try_get::<Option<String>, _>("last_outcome")
                    .map_err(Self::map_err)?
                    .as_deref(),
            ),
            claimed_by: row.try_get("claimed_by").map_err(Self::map_err)?,
            claimed_at: row.try_get("claimed_at").map_err(Self::map_err)?,
        })
    }

    async fn claim(&self, expected_current: &str, target: &str) -> Result<bool, SuoError> {
        // Compare-and-swap: only one instance observes a row still at the
        // expected version. Losers see rows_affected == 0 and loop; their next
        // up-to-date check ends the loop because the version has advanced.
        let result = sqlx::query(
            "UPDATE upgrade_status
             SET current_version = $2, desired_version = $2,
                 claimed_by = $3, claimed_at = now(), updated_at = now()
             WHERE id AND current_version = $1",
        )
        .bind(expected_current)
        .bind(target)
        .bind(&self.app_name)
        .execute(&self.pool)
        .await
        .map_err(Self::map_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_plan(&self, plan: &MigrationPlan) -> Result<(), SuoError> {
        let value = serde_json::to_value(plan).map_err(|e| SuoError::store("store::postgres", e))?;
        sqlx::query("UPDATE upgrade_status SET plan = $1, updated_at = now() WHERE id")
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn set_auto_upgrade(&self, enabled: bool) -> Result<(), SuoError> {
        sqlx::query("UPDATE upgrade_status SET auto_upgrade = $1, updated_at = now() WHERE id")
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn set_outcome(&self, success: bool) -> Result<(), SuoError> {
        let outcome = if success { "success" } else { "failure" };
        sqlx::query("UPDATE upgrade_status SET last_outcome = $1, updated_at = now() WHERE id")
            .bind(outcome)
            .execute(&self.pool)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn active_applications(&self, exclude: &[String]) -> Result<Vec<String>, SuoError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT application_name FROM pg_stat_activity
             WHERE application_name <> '' AND application_name <> ALL($1)",
        )
        .bind(exclude)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_err)?;
        Ok(rows)
    }
}
