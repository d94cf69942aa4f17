//! Plan execution.
//!
//! Drives the migration Runner and registered out-of-band migrators through an
//! ordered plan: privileged migrations before regular ones within each step,
//! interrupt points fully resolved before the next step starts, and a
//! per-schema last-mile pass once the minor-version plan is done.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::SuoError;
use crate::metrics::Metrics;
use crate::oob::MigratorRegistry;
use crate::plan::MigrationPlan;
use crate::version::Version;

/// The opaque migration execution engine. Applying is expected to be
/// idempotent and resumable; this crate only sequences the calls.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Apply all pending schema migrations for `schemas` up to `to`.
    /// Privileged migrations (requiring elevated database roles) are applied
    /// in a separate earlier pass.
    async fn apply(&self, schemas: &[String], to: &Version, privileged: bool) -> Result<()>;

    /// Apply any trailing patch-level migrations for a single schema,
    /// connecting and disconnecting within the call (last mile).
    async fn apply_patches(&self, schema: &str) -> Result<()>;
}

pub struct Executor<'a> {
    runner: &'a dyn Runner,
    registry: &'a MigratorRegistry,
    /// Interval between out-of-band completion polls at interrupt points.
    oob_poll_interval: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl<'a> Executor<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        registry: &'a MigratorRegistry,
        oob_poll_interval: Duration,
    ) -> Self {
        Self {
            runner,
            registry,
            oob_poll_interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execute the plan in order. Any step or interrupt failure aborts the
    /// whole plan; partial progress stays recorded in the runner's own state,
    /// so a retry after restart resumes rather than starting over.
    pub async fn execute(
        &self,
        plan: &MigrationPlan,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SuoError> {
        if plan.is_noop() {
            info!("Plan has no steps, nothing to migrate");
            return Ok(());
        }

        for (i, step) in plan.steps.iter().enumerate() {
            // Schema changes past an interrupt assume backfilled data; wait
            // out every interrupt scheduled at this step's source version.
            for interrupt in plan.interrupts_at(&step.from) {
                self.wait_for_migrators(interrupt, shutdown).await?;
            }

            info!(
                "Running migration step {}/{}: {} -> {} ({})",
                i + 1,
                plan.steps.len(),
                step.from,
                step.to,
                step.schemas.join(", ")
            );

            for privileged in [true, false] {
                self.runner
                    .apply(&step.schemas, &step.to, privileged)
                    .await
                    .map_err(|e| SuoError::StepFailed {
                        from: step.from.to_string(),
                        to: step.to.to_string(),
                        message: e.to_string(),
                    })?;
            }

            if let Some(metrics) = &self.metrics {
                metrics.steps_applied_total.inc();
            }
        }

        Ok(())
    }

    /// Poll every migrator registered at `version` until all report complete.
    async fn wait_for_migrators(
        &self,
        version: &Version,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SuoError> {
        loop {
            let mut pending = Vec::new();
            for migrator in self.registry.migrators_for(version) {
                let complete = migrator.is_complete().await.map_err(|e| {
                    SuoError::MigratorFailed(migrator.name().to_string(), e.to_string())
                })?;
                if !complete {
                    pending.push(migrator.name().to_string());
                }
            }

            if pending.is_empty() {
                return Ok(());
            }

            warn!(
                version = %version,
                pending = ?pending,
                "Waiting for out-of-band migrations to complete before continuing"
            );

            tokio::select! {
                () = tokio::time::sleep(self.oob_poll_interval) => {}
                _ = shutdown.changed() => {
                    return Err(SuoError::Interrupted("waiting for out-of-band migrations"));
                }
            }
        }
    }

    /// Apply trailing patch-level migrations for each schema independently.
    /// Every schema is attempted even if an earlier one fails; any failure
    /// makes the overall outcome a failure requiring manual intervention.
    pub async fn last_mile(&self, schemas: &[String]) -> Result<(), SuoError> {
        let mut first_failure: Option<SuoError> = None;

        for schema in schemas {
            info!("Running last-mile migrations for schema '{}'", schema);
            if let Err(e) = self.runner.apply_patches(schema).await {
                error!("Last-mile migration failed for schema '{}': {}", schema, e);
                first_failure
                    .get_or_insert(SuoError::LastMile(schema.clone(), e.to_string()));
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
