//! Upgrade lock coordination.
//!
//! Exactly one instance per fleet may execute a given upgrade, and only once
//! no other fleet member still depends on the pre-upgrade schema. Both are
//! enforced through the shared store: a conditional claim write for
//! exclusivity, and the store's own activity view for connection drain.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::SuoError;
use crate::metrics::Metrics;
use crate::store::StatusStore;
use crate::version::Version;

/// Terminal result of the claim loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The persisted version is already at or past the target; no claim was
    /// taken and there is nothing to do.
    UpToDate,
    /// This instance holds the upgrade lock and must execute the plan.
    Claimed,
}

pub struct Coordinator<'a> {
    store: &'a dyn StatusStore,
    target: Version,
    /// Backoff between loop iterations (drain wait and lost races).
    interval: Duration,
    /// Consecutive transient store failures tolerated before escalating.
    max_store_retries: u32,
    /// Identities ignored by drain detection: this instance plus known benign
    /// tools (interactive psql sessions and the like).
    exclude: Vec<String>,
    metrics: Option<Arc<Metrics>>,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        store: &'a dyn StatusStore,
        target: Version,
        interval: Duration,
        max_store_retries: u32,
        exclude: Vec<String>,
    ) -> Self {
        Self {
            store,
            target,
            interval,
            max_store_retries,
            exclude,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Loop until the upgrade lock is claimed or found unnecessary.
    ///
    /// Each iteration: re-read the persisted version (another instance may
    /// have advanced it), wait for connection drain, then attempt the
    /// conditional claim write. The drain wait is unbounded; stuck connections
    /// are an operator problem and are logged every iteration. Transient store
    /// faults are retried up to the configured bound.
    pub async fn claim(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ClaimOutcome, SuoError> {
        let mut consecutive_failures: u32 = 0;

        loop {
            info!("Attempting to claim auto-upgrade lock");
            if let Some(metrics) = &self.metrics {
                metrics.claim_attempts_total.inc();
            }

            match self.try_claim_once().await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {
                    consecutive_failures = 0;
                }
                Err(e) if e.is_transient() => {
                    consecutive_failures += 1;
                    if consecutive_failures > self.max_store_retries {
                        return Err(SuoError::ClaimRetriesExhausted(self.max_store_retries));
                    }
                    warn!(
                        "Transient store error in claim loop (attempt {}/{}): {}",
                        consecutive_failures, self.max_store_retries, e
                    );
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    return Err(SuoError::Interrupted("waiting to claim the upgrade lock"));
                }
            }
        }
    }

    /// One claim iteration. `Ok(Some(_))` is terminal; `Ok(None)` means sleep
    /// and retry (drain pending or lost race).
    async fn try_claim_once(&self) -> Result<Option<ClaimOutcome>, SuoError> {
        let status = self.store.status().await?;

        let current = Version::parse(&status.current_version).ok_or_else(|| {
            SuoError::InvalidVersion(format!(
                "stored current version {:?}",
                status.current_version
            ))
        })?;

        if current.cmp_minor(&self.target) != Ordering::Less {
            if current.cmp_patch(&self.target) == Ordering::Less {
                // Same minor: the schema path is already in place; trailing
                // patches belong to the last-mile pass, not a claimed upgrade.
                info!(
                    "Only a patch-level difference ({} -> {}), no coordinated upgrade needed",
                    current, self.target
                );
            } else {
                info!("Installation is up-to-date, nothing to do!");
            }
            return Ok(Some(ClaimOutcome::UpToDate));
        }

        // Block until every other named connection is gone, so old instances
        // are known to be retired and dependents have picked up the sentinel
        // DSN and stopped connecting.
        let remaining = self.store.active_applications(&self.exclude).await?;
        if !remaining.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.drain_waits_total.inc();
            }
            warn!(
                applications = ?remaining,
                "Named store connections found, waiting for them to shut down; \
                 manually shut down any unexpected ones"
            );
            return Ok(None);
        }

        if self
            .store
            .claim(&status.current_version, &self.target.to_string())
            .await?
        {
            info!("Auto-upgrade lock claimed");
            return Ok(Some(ClaimOutcome::Claimed));
        }

        warn!("Unable to claim auto-upgrade lock, sleeping...");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    use async_trait::async_trait;

    use super::*;
    use crate::plan::MigrationPlan;
    use crate::store::{Outcome, UpgradeStatus};

    /// In-memory store double with CAS claim semantics.
    struct MockStore {
        version: Mutex<String>,
        /// Snapshots handed out per drain query, last one repeated.
        snapshots: Mutex<Vec<Vec<String>>>,
        snapshot_calls: AtomicU32,
        claim_calls: AtomicU32,
        /// Number of leading status() calls that fail with a transient error.
        failing_status_calls: AtomicU32,
    }

    impl MockStore {
        fn new(version: &str, snapshots: Vec<Vec<String>>) -> Self {
            Self {
                version: Mutex::new(version.to_string()),
                snapshots: Mutex::new(snapshots),
                snapshot_calls: AtomicU32::new(0),
                claim_calls: AtomicU32::new(0),
                failing_status_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StatusStore for MockStore {
        async fn ensure_schema(&self) -> Result<(), SuoError> {
            Ok(())
        }

        async fn status(&self) -> Result<UpgradeStatus, SuoError> {
            if self.failing_status_calls.load(AtomicOrdering::SeqCst) > 0 {
                self.failing_status_calls.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(SuoError::store("mock", "connection reset"));
            }
            Ok(UpgradeStatus {
                current_version: self.version.lock().unwrap().clone(),
                desired_version: None,
                auto_upgrade: true,
                plan: None,
                last_outcome: Outcome::Unknown,
                claimed_by: None,
                claimed_at: None,
            })
        }

        async fn claim(&self, expected: &str, target: &str) -> Result<bool, SuoError> {
            self.claim_calls.fetch_add(1, AtomicOrdering::SeqCst);
            let mut version = self.version.lock().unwrap();
            if *version == expected {
                *version = target.to_string();
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn set_plan(&self, _plan: &MigrationPlan) -> Result<(), SuoError> {
            Ok(())
        }

        async fn set_auto_upgrade(&self, _enabled: bool) -> Result<(), SuoError> {
            Ok(())
        }

        async fn set_outcome(&self, _success: bool) -> Result<(), SuoError> {
            Ok(())
        }

        async fn active_applications(&self, _exclude: &[String]) -> Result<Vec<String>, SuoError> {
            self.snapshot_calls.fetch_add(1, AtomicOrdering::SeqCst);
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.len() > 1 {
                Ok(snapshots.remove(0))
            } else {
                Ok(snapshots.first().cloned().unwrap_or_default())
            }
        }
    }

    fn coordinator(store: &MockStore) -> Coordinator<'_> {
        Coordinator::new(
            store,
            Version::new(5, 3, 2),
            Duration::from_millis(1),
            3,
            vec!["suo".to_string(), "psql".to_string()],
        )
    }

    fn shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_up_to_date_takes_no_claim() {
        let store = MockStore::new("5.3.0", vec![vec![]]);
        let outcome = coordinator(&store).claim(&mut shutdown()).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::UpToDate);
        assert_eq!(store.claim_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ahead_of_target_takes_no_claim() {
        let store = MockStore::new("5.4.0", vec![vec![]]);
        let outcome = coordinator(&store).claim(&mut shutdown()).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_drain_blocks_claim_until_empty() {
        // Three iterations with a stale worker, then drained.
        let store = MockStore::new(
            "5.1.0",
            vec![
                vec!["old-worker".to_string()],
                vec!["old-worker".to_string()],
                vec!["old-worker".to_string()],
                vec![],
            ],
        );
        let outcome = coordinator(&store).claim(&mut shutdown()).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
        // No claim write attempted before the fourth iteration.
        assert_eq!(store.snapshot_calls.load(AtomicOrdering::SeqCst), 4);
        assert_eq!(store.claim_calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_claim_is_at_most_one() {
        let store = Arc::new(MockStore::new("5.1.0", vec![vec![]]));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                coordinator(&store).claim(&mut shutdown()).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimOutcome::Claimed {
                claimed += 1;
            }
        }
        // Losers observe the advanced version and report up-to-date.
        assert_eq!(claimed, 1);
        assert_eq!(&*store.version.lock().unwrap(), "5.3.2");
    }

    #[tokio::test]
    async fn test_transient_errors_bounded() {
        let store = MockStore::new("5.1.0", vec![vec![]]);
        store.failing_status_calls.store(10, AtomicOrdering::SeqCst);

        let err = coordinator(&store).claim(&mut shutdown()).await.unwrap_err();
        assert!(matches!(err, SuoError::ClaimRetriesExhausted(3)));
    }

    #[tokio::test]
    async fn test_transient_errors_recover() {
        let store = MockStore::new("5.1.0", vec![vec![]]);
        store.failing_status_calls.store(2, AtomicOrdering::SeqCst);

        let outcome = coordinator(&store).claim(&mut shutdown()).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_unparsable_stored_version_is_fatal_in_loop() {
        let store = MockStore::new("not-a-version", vec![vec![]]);
        let err = coordinator(&store).claim(&mut shutdown()).await.unwrap_err();
        assert!(matches!(err, SuoError::InvalidVersion(_)));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_drain_wait() {
        let store = MockStore::new("5.1.0", vec![vec!["old-worker".to_string()]]);
        let (tx, mut rx) = watch::channel(false);

        let coordinator = Coordinator::new(
            &store,
            Version::new(5, 3, 2),
            Duration::from_secs(60),
            3,
            vec![],
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });

        let err = coordinator.claim(&mut rx).await.unwrap_err();
        assert!(matches!(err, SuoError::Interrupted(_)));
    }
}
