//! Production [`Runner`] implementation that shells out to the external
//! migrator binary. The migration engine itself stays opaque: this adapter
//! only sequences invocations and reports their exit status.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::executor::Runner;
use crate::version::Version;

pub struct ExecRunner {
    bin: String,
    database_url: SecretString,
    app_name: String,
}

impl ExecRunner {
    pub fn new(bin: &str, database_url: SecretString, app_name: &str) -> Self {
        Self {
            bin: bin.to_string(),
            database_url,
            app_name: app_name.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.args(args)
            .env("MIGRATOR_DATABASE_URL", self.database_url.expose_secret())
            .env("MIGRATOR_APPLICATION_NAME", &self.app_name);

        debug!("Running: {} {}", self.bin, args.join(" "));

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'. Is the migrator installed?", self.bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} {} failed: {}", self.bin, args.join(" "), stderr.trim());
        }

        Ok(())
    }
}

#[async_trait]
impl Runner for ExecRunner {
    async fn apply(&self, schemas: &[String], to: &Version, privileged: bool) -> Result<()> {
        let to = to.to_string();
        let mut args = vec!["upgrade", "--to", &to];
        for schema in schemas {
            args.push("--schema");
            args.push(schema);
        }
        if privileged {
            args.push("--privileged");
        }
        self.run(&args).await
    }

    async fn apply_patches(&self, schema: &str) -> Result<()> {
        // Per-schema dial-apply-disconnect pass; the binary owns the
        // connection lifecycle.
        self.run(&["up", "--schema", schema]).await
    }
}
