//! Custom error types for suo.

use thiserror::Error;

/// Errors that can occur while coordinating and executing an auto-upgrade.
#[derive(Error, Debug)]
pub enum SuoError {
    /// The status store has never been bootstrapped (fresh install). Callers
    /// treat this as "nothing to upgrade", not as a failure.
    #[error("status store is not initialized")]
    NotInitialized,

    #[error("[{0}] store error: {1}")]
    Store(String, String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Upgrade not possible: {0}")]
    UpgradeNotPossible(String),

    #[error("Migration step {from} -> {to} failed: {message}")]
    StepFailed {
        from: String,
        to: String,
        message: String,
    },

    #[error("Out-of-band migrator '{0}' failed: {1}")]
    MigratorFailed(String, String),

    #[error("Last-mile migration failed for schema '{0}': {1}")]
    LastMile(String, String),

    #[error("Claim loop aborted after {0} consecutive store failures")]
    ClaimRetriesExhausted(u32),

    #[error("Shut down while {0}")]
    Interrupted(&'static str),
}

impl SuoError {
    /// Create a store error from any error type, tagged with the component
    /// that observed it.
    pub fn store<E: std::fmt::Display>(component: &str, err: E) -> Self {
        Self::Store(component.to_string(), err.to_string())
    }

    /// Returns true if this error is transient and the claim loop should retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_, _))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_version() {
        let err = SuoError::InvalidVersion("bogus".to_string());
        assert_eq!(err.to_string(), "Invalid version format: bogus");
    }

    #[test]
    fn test_error_display_not_initialized() {
        assert_eq!(
            SuoError::NotInitialized.to_string(),
            "status store is not initialized"
        );
    }

    #[test]
    fn test_error_store_helper() {
        let err = SuoError::store("store::postgres", "connection refused");
        assert!(err.to_string().contains("[store::postgres]"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_display_step_failed() {
        let err = SuoError::StepFailed {
            from: "5.1".to_string(),
            to: "5.2".to_string(),
            message: "dirty schema".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Migration step 5.1 -> 5.2 failed: dirty schema"
        );
    }

    #[test]
    fn test_error_display_last_mile() {
        let err = SuoError::LastMile("codeintel".to_string(), "timeout".to_string());
        assert_eq!(
            err.to_string(),
            "Last-mile migration failed for schema 'codeintel': timeout"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(SuoError::store("x", "y").is_transient());
        assert!(!SuoError::NotInitialized.is_transient());
        assert!(!SuoError::InvalidVersion("x".into()).is_transient());
        assert!(!SuoError::ClaimRetriesExhausted(3).is_transient());
    }
}
