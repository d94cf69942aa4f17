//! Out-of-band migration registry.
//!
//! Out-of-band migrators backfill data in the background, outside the schema
//! migration engine. Versions that depend on a completed backfill are interrupt
//! points: the plan executor must not run schema migrations past them until
//! every migrator registered at that version reports completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::version::Version;

/// A named background data migration, polled for completion at interrupt
/// points. Implementations own their progress tracking; this interface only
/// observes it.
#[async_trait]
pub trait Migrator: Send + Sync {
    fn name(&self) -> &str;

    async fn is_complete(&self) -> Result<bool>;
}

/// Registry of out-of-band migrators keyed by the version whose schema
/// migrations depend on them. Constructed once at startup and passed by
/// reference into the planner and executor.
#[derive(Default)]
pub struct MigratorRegistry {
    by_version: BTreeMap<(u32, u32), Vec<Arc<dyn Migrator>>>,
}

impl MigratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migrator that must complete before schema migrations past
    /// `version` may run.
    pub fn register(&mut self, version: Version, migrator: Arc<dyn Migrator>) {
        self.by_version
            .entry((version.major, version.minor))
            .or_default()
            .push(migrator);
    }

    /// Migrators gating the given version, if any.
    pub fn migrators_for(&self, version: &Version) -> &[Arc<dyn Migrator>] {
        self.by_version
            .get(&(version.major, version.minor))
            .map_or(&[], Vec::as_slice)
    }

    /// Registered interrupt versions within `range`, in ascending order.
    pub fn interrupts_in(&self, range: &[Version]) -> Vec<Version> {
        range
            .iter()
            .filter(|v| self.by_version.contains_key(&(v.major, v.minor)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DoneMigrator(&'static str);

    #[async_trait]
    impl Migrator for DoneMigrator {
        fn name(&self) -> &str {
            self.0
        }

        async fn is_complete(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_migrators_for_empty() {
        let registry = MigratorRegistry::new();
        assert!(registry.migrators_for(&Version::new(5, 2, 0)).is_empty());
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = MigratorRegistry::new();
        registry.register(Version::new(5, 2, 0), Arc::new(DoneMigrator("backfill-a")));
        registry.register(Version::new(5, 2, 0), Arc::new(DoneMigrator("backfill-b")));

        let migrators = registry.migrators_for(&Version::new(5, 2, 0));
        assert_eq!(migrators.len(), 2);
        assert_eq!(migrators[0].name(), "backfill-a");
    }

    #[test]
    fn test_lookup_ignores_patch() {
        let mut registry = MigratorRegistry::new();
        registry.register(Version::new(5, 2, 0), Arc::new(DoneMigrator("backfill")));
        assert_eq!(registry.migrators_for(&Version::new(5, 2, 7)).len(), 1);
    }

    #[test]
    fn test_interrupts_in_range() {
        let mut registry = MigratorRegistry::new();
        registry.register(Version::new(5, 2, 0), Arc::new(DoneMigrator("backfill")));
        registry.register(Version::new(5, 9, 0), Arc::new(DoneMigrator("out-of-range")));

        let range = vec![
            Version::new(5, 1, 0),
            Version::new(5, 2, 0),
            Version::new(5, 3, 0),
        ];
        assert_eq!(registry.interrupts_in(&range), vec![Version::new(5, 2, 0)]);
    }
}
