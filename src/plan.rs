//! Migration planning: decomposes a version range into ordered steps and
//! interrupt points.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::oob::MigratorRegistry;
use crate::version::{Version, upgrade_range};

/// A single minor-version schema migration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub from: Version,
    pub to: Version,
    /// Schemas this step migrates.
    pub schemas: Vec<String>,
}

/// An ordered, immutable upgrade plan between two versions.
///
/// Serialized into the status store after planning so that operators (and a
/// resuming instance) can see what was decided. Construction is deterministic:
/// replanning with the same inputs yields an identical plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub from: Version,
    pub to: Version,
    pub steps: Vec<MigrationStep>,
    /// Versions at which execution pauses until out-of-band migrators report
    /// completion. Always a subset of the step boundaries, ascending.
    pub interrupts: Vec<Version>,
}

impl MigrationPlan {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    /// Interrupt versions scheduled at the given step boundary. The returned
    /// items borrow only the plan, so the boundary may be a temporary.
    pub fn interrupts_at<'p>(
        &'p self,
        boundary: &Version,
    ) -> impl Iterator<Item = &'p Version> + use<'p> {
        let key = (boundary.major, boundary.minor);
        self.interrupts
            .iter()
            .filter(move |v| (v.major, v.minor) == key)
    }
}

/// Build the migration plan from `from` to `to`.
///
/// One step per adjacent pair in the inclusive minor-version range; interrupt
/// points are the registry's versions that fall inside the range. Equal
/// endpoints produce a no-op plan. Downgrades and cross-major ranges error.
pub fn plan(
    from: &Version,
    to: &Version,
    schemas: &[String],
    registry: &MigratorRegistry,
) -> Result<MigrationPlan> {
    let range = upgrade_range(from, to)?;
    let interrupts = registry.interrupts_in(&range);

    let steps = range
        .windows(2)
        .map(|pair| MigrationStep {
            from: pair[0].clone(),
            to: pair[1].clone(),
            schemas: schemas.to_vec(),
        })
        .collect();

    Ok(MigrationPlan {
        from: from.clone(),
        to: to.clone(),
        steps,
        interrupts,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::oob::Migrator;

    struct DoneMigrator;

    #[async_trait]
    impl Migrator for DoneMigrator {
        fn name(&self) -> &str {
            "backfill"
        }

        async fn is_complete(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn schemas() -> Vec<String> {
        vec!["frontend".to_string(), "codeintel".to_string()]
    }

    #[test]
    fn test_plan_covers_range_without_gaps() {
        let plan = plan(
            &Version::new(5, 1, 0),
            &Version::new(5, 3, 2),
            &schemas(),
            &MigratorRegistry::new(),
        )
        .unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].from, Version::new(5, 1, 0));
        assert_eq!(plan.steps[0].to, Version::new(5, 2, 0));
        assert_eq!(plan.steps[1].from, Version::new(5, 2, 0));
        assert_eq!(plan.steps[1].to, Version::new(5, 3, 0));
        // Each step picks up where the previous ended.
        for pair in plan.steps.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
        assert!(plan.interrupts.is_empty());
    }

    #[test]
    fn test_plan_long_range_every_minor_once() {
        let plan = plan(
            &Version::new(5, 0, 0),
            &Version::new(5, 6, 0),
            &schemas(),
            &MigratorRegistry::new(),
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 6);
        for (i, step) in plan.steps.iter().enumerate() {
            assert_eq!(step.from.minor, i as u32);
            assert_eq!(step.to.minor, i as u32 + 1);
        }
    }

    #[test]
    fn test_plan_same_version_is_noop() {
        let plan = plan(
            &Version::new(5, 3, 0),
            &Version::new(5, 3, 0),
            &schemas(),
            &MigratorRegistry::new(),
        )
        .unwrap();
        assert!(plan.is_noop());
        assert!(plan.interrupts.is_empty());
    }

    #[test]
    fn test_plan_rejects_downgrade() {
        assert!(
            plan(
                &Version::new(5, 3, 0),
                &Version::new(5, 1, 0),
                &schemas(),
                &MigratorRegistry::new(),
            )
            .is_err()
        );
    }

    #[test]
    fn test_plan_merges_interrupts() {
        let mut registry = MigratorRegistry::new();
        registry.register(Version::new(5, 2, 0), Arc::new(DoneMigrator));

        let plan = plan(
            &Version::new(5, 1, 0),
            &Version::new(5, 4, 0),
            &schemas(),
            &registry,
        )
        .unwrap();

        assert_eq!(plan.interrupts, vec![Version::new(5, 2, 0)]);
        let at_boundary: Vec<_> = plan.interrupts_at(&Version::new(5, 2, 0)).collect();
        assert_eq!(at_boundary.len(), 1);
        assert_eq!(plan.interrupts_at(&Version::new(5, 3, 0)).count(), 0);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let registry = MigratorRegistry::new();
        let a = plan(
            &Version::new(5, 1, 0),
            &Version::new(5, 3, 0),
            &schemas(),
            &registry,
        )
        .unwrap();
        let b = plan(
            &Version::new(5, 1, 0),
            &Version::new(5, 3, 0),
            &schemas(),
            &registry,
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_serialization_round_trip() {
        let plan = plan(
            &Version::new(5, 1, 0),
            &Version::new(5, 3, 0),
            &schemas(),
            &MigratorRegistry::new(),
        )
        .unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let restored: MigrationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, restored);
    }
}
