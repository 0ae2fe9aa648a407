// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Concrete `ContainerDriver` backed by the `docker` CLI.
//!
//! One of the two runtime variants called out as "supplied out of the
//! box": native (`buildfarm_core::executor::NativeRunner`) and this
//! one. Shells out to `docker` rather than linking a container-runtime
//! client crate, since the workspace carries no such dependency.

use std::path::Path;

use async_trait::async_trait;
use buildfarm_core::error::ExecutionError;
use buildfarm_core::executor::{ContainerDriver, ExecutionOutcome};
use tokio::process::Command;
use tracing::warn;

/// Drives containers via `docker create` / `start` / `exec` / `rm -f`.
pub struct DockerCliDriver;

#[async_trait]
impl ContainerDriver for DockerCliDriver {
    async fn create(&self, image: &str, config_mount: &Path, output_dir: &Path) -> Result<String, ExecutionError> {
        let output = Command::new("docker")
            .args(["create", "-v"])
            .arg(format!("{}:/config:ro", config_mount.display()))
            .arg("-v")
            .arg(format!("{}:/output:rw", output_dir.display()))
            .arg(image)
            .args(["sleep", "infinity"])
            .output()
            .await
            .map_err(|e| ExecutionError::SandboxStartFailed(format!("docker create: {e}")))?;

        if !output.status.success() {
            return Err(ExecutionError::SandboxStartFailed(format!(
                "docker create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    async fn start(&self, container_id: &str) -> Result<(), ExecutionError> {
        let status = Command::new("docker")
            .args(["start", container_id])
            .status()
            .await
            .map_err(|e| ExecutionError::SandboxStartFailed(format!("docker start: {e}")))?;
        if !status.success() {
            return Err(ExecutionError::SandboxStartFailed(format!("docker start exited with {status}")));
        }
        Ok(())
    }

    async fn exec(&self, container_id: &str, command: &[String], env: &[(String, String)]) -> Result<ExecutionOutcome, ExecutionError> {
        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        for (k, v) in env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(container_id);
        cmd.args(command);

        let output = cmd.output().await.map_err(|e| ExecutionError::SandboxStartFailed(format!("docker exec: {e}")))?;
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecutionOutcome { log, exit_code: output.status.code() })
    }

    async fn cleanup(&self, container_id: &str) {
        let result = Command::new("docker").args(["rm", "-f", container_id]).status().await;
        if let Err(e) = result {
            warn!(container_id, error = %e, "failed to remove build container");
        }
    }
}
