//! Schema version parsing, comparison, and upgrade range calculation.

use std::cmp::Ordering;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::SuoError;

/// A service schema version: major.minor.patch with an optional pre-release
/// marker (e.g. `5.3.2` or `5.4.0-rc.1`). Immutable once parsed.
///
/// Version comparison is patch-insensitive by default: two versions on the same
/// (major, minor) are considered equal unless [`Version::cmp_patch`] is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<String>,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse a version string. A leading `v` is tolerated, the patch component
    /// is optional, and anything after `-` or `+` is kept as a pre-release
    /// marker. Returns `None` on malformed input; stored versions that fail to
    /// parse must skip auto-upgrade rather than abort startup.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().strip_prefix('v').unwrap_or(s.trim());
        if s.is_empty() {
            return None;
        }

        let (numbers, pre) = match s.find(['-', '+']) {
            Some(idx) => {
                let marker = &s[idx + 1..];
                if marker.is_empty() {
                    return None;
                }
                (&s[..idx], Some(marker.to_string()))
            }
            None => (s, None),
        };

        let mut parts = numbers.split('.');
        let major: u32 = parts.next()?.parse().ok()?;
        let minor: u32 = parts.next()?.parse().ok()?;
        let patch: u32 = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// Compare on (major, minor) only. Patch and pre-release differences never
    /// reorder versions relative to a different minor.
    pub fn cmp_minor(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }

    /// Full comparison including the patch component. Pre-release sorts before
    /// the corresponding release.
    pub fn cmp_patch(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

/// Calculate the inclusive minor-version range from `from` to `to`.
///
/// Returns `[from, ..., to]` at minor granularity; a single-element range when
/// the versions share a minor (sync mode, nothing to step through). Downgrades
/// and cross-major ranges are not supported.
pub fn upgrade_range(from: &Version, to: &Version) -> Result<Vec<Version>> {
    if from.major != to.major {
        return Err(SuoError::UpgradeNotPossible(
            "cross-major version upgrades are not supported".to_string(),
        )
        .into());
    }
    if to.minor < from.minor {
        return Err(SuoError::UpgradeNotPossible(format!(
            "target version {to} is lower than current version {from} (downgrade not supported)"
        ))
        .into());
    }

    let mut range = Vec::with_capacity((to.minor - from.minor + 1) as usize);
    for minor in from.minor..=to.minor {
        range.push(Version::new(from.major, minor, 0));
    }
    Ok(range)
}
