//! The seam to the external orchestrator.
//!
//! The scaler never manipulates processes itself; it asks an
//! `Orchestrator` for the current replica count and hands it a target.
//! `ShellOrchestrator` runs configurable command templates, which is how
//! docker/kubectl/systemd-style tooling is plugged in.

use tracing::{debug, info};

pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Replica management interface.
pub trait Orchestrator: Send + Sync {
    /// Current replica count for the named service.
    fn current_replicas(&self, service: &str) -> BoxFuture<anyhow::Result<u32>>;
    /// Set the replica count for the named service.
    fn scale_to(&self, service: &str, replicas: u32) -> BoxFuture<anyhow::Result<()>>;
}

/// Orchestrator invoking shell command templates.
///
/// `{service}` and `{replicas}` placeholders are substituted before the
/// command runs under `sh -c`. The count command must print the replica
/// count as the first token of stdout.
pub struct ShellOrchestrator {
    scale_command: String,
    count_command: String,
}

impl ShellOrchestrator {
    pub fn new(scale_command: &str, count_command: &str) -> Self {
        Self {
            scale_command: scale_command.to_string(),
            count_command: count_command.to_string(),
        }
    }
}

impl Orchestrator for ShellOrchestrator {
    fn current_replicas(&self, service: &str) -> BoxFuture<anyhow::Result<u32>> {
        let command = self.count_command.replace("{service}", service);
        Box::pin(async move {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .output()
                .await?;
            if !output.status.success() {
                anyhow::bail!(
                    "replica count command failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            let count = stdout
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("unparseable replica count: {stdout:?}"))?;
            debug!(command = %command, count, "queried replica count");
            Ok(count)
        })
    }

    fn scale_to(&self, service: &str, replicas: u32) -> BoxFuture<anyhow::Result<()>> {
        let command = self
            .scale_command
            .replace("{service}", service)
            .replace("{replicas}", &replicas.to_string());
        Box::pin(async move {
            info!(command = %command, replicas, "invoking orchestrator scale command");
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .output()
                .await?;
            if !output.status.success() {
                anyhow::bail!(
                    "scale command failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        })
    }
}
