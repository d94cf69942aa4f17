//! The auto-upgrade sequence.
//!
//! On startup: consult the status store; if an upgrade is pending, raise the
//! control-plane HTTP surfaces, claim the upgrade lock, plan, persist the
//! plan, execute it, clear the flag, run the last-mile pass, record the
//! outcome, and tear the surfaces down. Skip conditions (fresh store, flag
//! unset, unparsable versions) are logged and treated as success-with-no-op so
//! normal startup is never blocked by them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::{ClaimOutcome, Coordinator};
use crate::error::SuoError;
use crate::executor::{Executor, Runner};
use crate::metrics::Metrics;
use crate::oob::MigratorRegistry;
use crate::plan;
use crate::server;
use crate::store::StatusStore;
use crate::version::Version;

pub struct Orchestrator {
    config: Config,
    store: Arc<dyn StatusStore>,
    registry: Arc<MigratorRegistry>,
    runner: Arc<dyn Runner>,
    metrics: Arc<Metrics>,
    prom_registry: Arc<Registry>,
    /// Completion signal: flips to true exactly once, when the sequence ends
    /// (no-op, success, or failure). Dependent services wait on a subscribed
    /// receiver instead of a process-wide global.
    done: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn StatusStore>,
        registry: Arc<MigratorRegistry>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        let mut prom_registry = Registry::default();
        let metrics = Arc::new(Metrics::new(&mut prom_registry));
        let (done, _) = watch::channel(false);

        Self {
            config,
            store,
            registry,
            runner,
            metrics,
            prom_registry: Arc::new(prom_registry),
            done,
        }
    }

    /// Receiver that resolves once the upgrade sequence has finished.
    pub fn completed(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Run the auto-upgrade sequence to completion. Always fires the
    /// completion signal, even on failure.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let result = self.try_auto_upgrade(shutdown).await;
        let _ = self.done.send(true);
        result
    }

    async fn try_auto_upgrade(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let status = match self.store.status().await {
            Ok(status) => status,
            Err(SuoError::NotInitialized) => {
                info!("Status store not initialized (fresh install), skipping auto-upgrade");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !status.auto_upgrade && !self.config.force_auto_upgrade {
            info!("No auto-upgrade pending");
            return Ok(());
        }

        // A corrupt version string must never block ordinary startup.
        let Some(current) = Version::parse(&status.current_version) else {
            warn!(
                "Unexpected string for current schema version, skipping auto-upgrade ({})",
                status.current_version
            );
            return Ok(());
        };
        let Some(target) = Version::parse(&self.config.target_version) else {
            warn!(
                "Unexpected string for desired schema version, skipping auto-upgrade ({})",
                self.config.target_version
            );
            return Ok(());
        };

        info!(
            "Auto-upgrade requested: {} -> {} ({})",
            current,
            target,
            self.config.schemas.join(", ")
        );

        // Bind both surfaces up front; a bind failure aborts before any claim
        // is taken rather than migrating without health checks.
        let internal_listener =
            server::bind(self.config.http_addr_internal, "internal configuration").await?;
        let external_listener = server::bind(self.config.http_addr, "upgrade progress").await?;

        // Upgrade window: both surfaces live until it closes, so health
        // checks keep answering through failure handling too.
        let (window_tx, window_rx) = watch::channel(false);
        let internal = {
            let app = server::internal::router(self.config.schemas.clone());
            let window = window_rx.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    server::serve(internal_listener, app, window, "internal configuration").await
                {
                    error!("Internal configuration server failed: {}", e);
                }
            })
        };
        let external = {
            let app = server::external::router(self.store.clone(), self.prom_registry.clone());
            let window = window_rx.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    server::serve(external_listener, app, window, "upgrade progress").await
                {
                    error!("Upgrade progress server failed: {}", e);
                }
            })
        };

        let result = self.claim_and_execute(&current, &target, &mut shutdown).await;

        let _ = window_tx.send(true);
        let _ = internal.await;
        let _ = external.await;

        result
    }

    async fn claim_and_execute(
        &self,
        current: &Version,
        target: &Version,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.store.ensure_schema().await?;

        self.metrics.set_phase("claiming");
        let coordinator = Coordinator::new(
            self.store.as_ref(),
            target.clone(),
            Duration::from_secs(self.config.claim_interval_secs),
            self.config.max_store_retries,
            self.config.drain_exclusions(),
        )
        .with_metrics(self.metrics.clone());

        match coordinator.claim(shutdown).await? {
            ClaimOutcome::UpToDate => return Ok(()),
            ClaimOutcome::Claimed => {}
        }

        // From here on the claim is ours; whatever happens, the outcome is
        // recorded so operators and other instances can observe it.
        let result = self.execute_upgrade(current, target, shutdown).await;

        if let Err(e) = self.store.set_outcome(result.is_ok()).await {
            error!("Failed to record auto-upgrade outcome: {}", e);
        }

        match &result {
            Ok(()) => info!("Upgrade successful"),
            Err(e) => error!("Auto-upgrade failed: {}", e),
        }
        result
    }

    async fn execute_upgrade(
        &self,
        current: &Version,
        target: &Version,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.metrics.set_phase("planning");
        let plan = plan::plan(current, target, &self.config.schemas, &self.registry)?;
        self.store.set_plan(&plan).await?;
        info!(
            "Planned upgrade: {} steps, {} interrupts",
            plan.steps.len(),
            plan.interrupts.len()
        );

        let executor = Executor::new(
            self.runner.as_ref(),
            &self.registry,
            Duration::from_secs(self.config.oob_poll_interval_secs),
        )
        .with_metrics(self.metrics.clone());

        self.metrics.set_phase("migrating");
        executor.execute(&plan, shutdown).await?;

        // The full plan is done: the fleet may start normally again. The flag
        // is cleared exactly once, here, before the last-mile pass.
        self.store.set_auto_upgrade(false).await?;

        self.metrics.set_phase("last-mile");
        executor.last_mile(&self.config.schemas).await?;

        self.metrics.set_phase("done");
        Ok(())
    }
}
