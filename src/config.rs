//! Environment-based configuration.

use std::env;
use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use secrecy::SecretString;

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// DSN of the shared store being upgraded (and coordinated through).
    pub database_url: SecretString,
    /// Identity this instance reports as `application_name` and records with
    /// a successful claim.
    pub app_name: String,
    /// Version to upgrade to. Defaults to the build version.
    pub target_version: String,
    /// Schemas covered by each migration step and the last-mile pass.
    pub schemas: Vec<String>,
    /// Force auto-upgrade even when the stored flag is false.
    pub force_auto_upgrade: bool,

    /// External progress/health listener.
    pub http_addr: SocketAddr,
    /// Internal configuration listener polled by dependent processes.
    pub http_addr_internal: SocketAddr,

    /// Seconds between claim-loop iterations.
    pub claim_interval_secs: u64,
    /// Seconds between out-of-band completion polls at interrupt points.
    pub oob_poll_interval_secs: u64,
    /// Consecutive transient store failures tolerated by the claim loop.
    pub max_store_retries: u32,
    /// Connection identities ignored by drain detection, in addition to this
    /// instance's own.
    pub excluded_apps: Vec<String>,

    /// External migrator binary invoked by the exec runner.
    pub migrator_bin: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let database_url = SecretString::from(get_env_required("SUO_DATABASE_URL")?);

        let app_name = get_env_with_default("SUO_APP_NAME", "suo-autoupgrader");
        let target_version =
            get_env_with_default("SUO_TARGET_VERSION", env!("CARGO_PKG_VERSION"));
        let schemas = split_csv(&get_env_with_default(
            "SUO_SCHEMAS",
            "frontend,codeintel,codeinsights",
        ));
        let force_auto_upgrade = get_env_bool("SUO_AUTO_UPGRADE");

        let http_addr = parse_addr("SUO_HTTP_ADDR", "0.0.0.0:3080")?;
        let http_addr_internal = parse_addr("SUO_HTTP_ADDR_INTERNAL", "127.0.0.1:3090")?;

        let claim_interval_secs = get_env_u64_with_default("SUO_CLAIM_INTERVAL_SECS", 10);
        let oob_poll_interval_secs = get_env_u64_with_default("SUO_OOB_POLL_INTERVAL_SECS", 5);
        let max_store_retries = get_env_u32_with_default("SUO_MAX_STORE_RETRIES", 3);
        let excluded_apps = split_csv(&get_env_with_default("SUO_EXCLUDED_APPS", "psql"));

        let migrator_bin = get_env_with_default("SUO_MIGRATOR_BIN", "migrator");

        let config = Self {
            database_url,
            app_name,
            target_version,
            schemas,
            force_auto_upgrade,
            http_addr,
            http_addr_internal,
            claim_interval_secs,
            oob_poll_interval_secs,
            max_store_retries,
            excluded_apps,
            migrator_bin,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(anyhow!("SUO_APP_NAME must not be empty"));
        }
        if self.schemas.is_empty() {
            return Err(anyhow!("SUO_SCHEMAS must name at least one schema"));
        }
        if self.claim_interval_secs == 0 {
            return Err(anyhow!("SUO_CLAIM_INTERVAL_SECS must be at least 1"));
        }
        Ok(())
    }

    /// Identities excluded from drain detection: this instance plus the
    /// configured benign tools.
    pub fn drain_exclusions(&self) -> Vec<String> {
        let mut exclude = vec![self.app_name.clone()];
        exclude.extend(self.excluded_apps.iter().cloned());
        exclude
    }
}

fn get_env_required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("Environment variable {key} is required but not set"))
}

fn get_env_with_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn get_env_u64_with_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_u32_with_default(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr> {
    get_env_with_default(key, default)
        .parse()
        .with_context(|| format!("{key} must be a valid socket address"))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
impl Config {
    pub fn new_for_test() -> Self {
        Self {
            database_url: SecretString::from("postgres://localhost/suo_test".to_string()),
            app_name: "suo-autoupgrader".to_string(),
            target_version: "5.3.2".to_string(),
            schemas: vec!["frontend".to_string(), "codeintel".to_string()],
            force_auto_upgrade: false,
            http_addr: "127.0.0.1:0".parse().unwrap(),
            http_addr_internal: "127.0.0.1:0".parse().unwrap(),
            claim_interval_secs: 1,
            oob_poll_interval_secs: 1,
            max_store_retries: 3,
            excluded_apps: vec!["psql".to_string()],
            migrator_bin: "migrator".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::new_for_test();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_schemas() {
        let mut config = Config::new_for_test();
        config.schemas.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::new_for_test();
        config.claim_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_drain_exclusions_include_self() {
        let config = Config::new_for_test();
        let exclude = config.drain_exclusions();
        assert!(exclude.contains(&"suo-autoupgrader".to_string()));
        assert!(exclude.contains(&"psql".to_string()));
    }

    #[test]
    fn test_split_csv() {
        assert_eq!(split_csv("a, b ,c"), vec!["a", "b", "c"]);
        assert!(split_csv("").is_empty());
        assert_eq!(split_csv("one"), vec!["one"]);
    }
}
