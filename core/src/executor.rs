// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Sandbox executor (C7): runs one build inside a container or
//! natively, streams its log, and locates the resulting artifact.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::ExecutionError;
use crate::job::JobRequest;

/// Default hard timeout for a single build (2 hours).
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Number of artifact-discovery retries, tolerating asynchronous
/// filesystem propagation from the sandbox.
const ARTIFACT_DISCOVERY_RETRIES: u32 = 10;
const ARTIFACT_DISCOVERY_SLEEP: Duration = Duration::from_millis(200);

/// Which runtime executes the build command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Launch a container from a configured image; bind-mount config and
    /// output directories.
    Sandboxed,
    /// Run the build command directly on the builder's host.
    Native,
}

/// Combined stdout+stderr output plus exit status of one build attempt.
pub struct ExecutionOutcome {
    /// Captured combined output.
    pub log: String,
    /// Process exit code, if the process actually ran and exited.
    pub exit_code: Option<i32>,
}

/// Runs one build and reports a combined log plus exit status. Narrow
/// interface so the container driver and the native runner share a
/// contract (§9's "container runtime... polymorphic over a capability
/// set").
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Execute the build for `request` with `options` applied, writing
    /// artifacts under `output_dir`. Returns the captured log and exit
    /// status, or an `ExecutionError` for setup failures distinct from a
    /// non-zero exit (which is reported via `ExecutionOutcome`).
    async fn run(&self, request: &JobRequest, output_dir: &Path) -> Result<ExecutionOutcome, ExecutionError>;
}

#[async_trait]
impl BuildRunner for Box<dyn BuildRunner> {
    async fn run(&self, request: &JobRequest, output_dir: &Path) -> Result<ExecutionOutcome, ExecutionError> {
        (**self).run(request, output_dir).await
    }
}

/// Native runner: invokes the configured build command directly under
/// the builder's host environment via `tokio::process::Command`,
/// capturing combined output.
pub struct NativeRunner {
    /// Build command and arguments, e.g. `["emerge", "--buildpkg"]`.
    pub command: Vec<String>,
}

#[async_trait]
impl BuildRunner for NativeRunner {
    async fn run(&self, request: &JobRequest, output_dir: &Path) -> Result<ExecutionOutcome, ExecutionError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ExecutionError::SandboxStartFailed("empty build command".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("BUILDFARM_OUTPUT_DIR", output_dir);
        cmd.env("BUILDFARM_PACKAGE", request.atom());
        if let Some(version) = &request.version {
            cmd.env("BUILDFARM_VERSION", version);
        }
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        for (opt, enabled) in &request.options {
            cmd.env(format!("BUILDFARM_USE_{}", opt.to_uppercase()), if *enabled { "1" } else { "0" });
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| ExecutionError::SandboxStartFailed(e.to_string()))?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecutionOutcome { log, exit_code: output.status.code() })
    }
}

/// Sandboxed runner: delegates container lifecycle to an injected
/// driver. The container runtime itself is out of scope (§1); this
/// struct only sequences create/start/exec/stop/remove around it and
/// guarantees cleanup on every exit path.
pub struct SandboxedRunner<D: ContainerDriver> {
    /// Container image to launch the build inside.
    pub image: String,
    /// Build command to run inside the container.
    pub command: Vec<String>,
    /// Host configuration tree bind-mounted read-only.
    pub config_mount: PathBuf,
    driver: D,
}

impl<D: ContainerDriver> SandboxedRunner<D> {
    /// Construct a sandboxed runner over the given container driver.
    pub fn new(image: String, command: Vec<String>, config_mount: PathBuf, driver: D) -> Self {
        Self { image, command, config_mount, driver }
    }
}

/// Capability set a container runtime must expose (§9 interface
/// polymorphism: Run/Create/Start/Stop/Remove/Exec/Copy).
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container from `image`, bind-mounting `config_mount`
    /// read-only and `output_dir` writable. Returns an opaque container id.
    async fn create(&self, image: &str, config_mount: &Path, output_dir: &Path) -> Result<String, ExecutionError>;
    /// Start a previously created container.
    async fn start(&self, container_id: &str) -> Result<(), ExecutionError>;
    /// Execute `command` inside the running container, with `env`
    /// applied, returning combined output and exit code.
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecutionOutcome, ExecutionError>;
    /// Stop and remove the container. Must be called on every exit path.
    async fn cleanup(&self, container_id: &str);
}

#[async_trait]
impl ContainerDriver for Box<dyn ContainerDriver> {
    async fn create(&self, image: &str, config_mount: &Path, output_dir: &Path) -> Result<String, ExecutionError> {
        (**self).create(image, config_mount, output_dir).await
    }

    async fn start(&self, container_id: &str) -> Result<(), ExecutionError> {
        (**self).start(container_id).await
    }

    async fn exec(&self, container_id: &str, command: &[String], env: &[(String, String)]) -> Result<ExecutionOutcome, ExecutionError> {
        (**self).exec(container_id, command, env).await
    }

    async fn cleanup(&self, container_id: &str) {
        (**self).cleanup(container_id).await
    }
}

#[async_trait]
impl<D: ContainerDriver> BuildRunner for SandboxedRunner<D> {
    async fn run(&self, request: &JobRequest, output_dir: &Path) -> Result<ExecutionOutcome, ExecutionError> {
        let container_id = self.driver.create(&self.image, &self.config_mount, output_dir).await?;

        let result = async {
            self.driver.start(&container_id).await?;

            let mut env: Vec<(String, String)> =
                vec![("BUILDFARM_PACKAGE".into(), request.atom())];
            if let Some(version) = &request.version {
                env.push(("BUILDFARM_VERSION".into(), version.clone()));
            }
            for (k, v) in &request.env {
                env.push((k.clone(), v.clone()));
            }
            for (opt, enabled) in &request.options {
                env.push((format!("BUILDFARM_USE_{}", opt.to_uppercase()), if *enabled { "1" } else { "0" }.into()));
            }

            self.driver.exec(&container_id, &self.command, &env).await
        }
        .await;

        // Cleanup on every exit path, including failure.
        self.driver.cleanup(&container_id).await;
        result
    }
}

/// Runs a build under a hard timeout, then discovers, by largest
/// matching-extension file, the artifact it produced.
pub struct SandboxExecutor<R: BuildRunner> {
    runner: R,
    mode: ExecutionMode,
    timeout: Duration,
    artifact_extension: String,
}

impl<R: BuildRunner> SandboxExecutor<R> {
    /// Construct an executor around `runner`, wrapping every build in
    /// `timeout` and discovering artifacts by `artifact_extension`
    /// (e.g. `"tbz2"`).
    #[must_use]
    pub fn new(runner: R, mode: ExecutionMode, timeout: Duration, artifact_extension: String) -> Self {
        Self { runner, mode, timeout, artifact_extension }
    }

    /// Which execution mode this executor runs builds under.
    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run one build to completion: execute under the hard timeout, then
    /// discover the artifact. On timeout the job fails with
    /// `ExecutionError::Timeout` regardless of what the runner itself
    /// returns. On non-zero exit, fails with `BuildNonZeroExit` before
    /// attempting discovery. On success with no matching artifact, fails
    /// with `ArtifactNotFound` even though the build command succeeded.
    pub async fn execute(
        &self,
        request: &JobRequest,
        output_dir: &Path,
    ) -> Result<(PathBuf, String), ExecutionError> {
        let outcome = match timeout(self.timeout, self.runner.run(request, output_dir)).await {
            Ok(result) => result?,
            Err(_) => return Err(ExecutionError::Timeout),
        };

        match outcome.exit_code {
            Some(0) => {}
            Some(code) => return Err(ExecutionError::BuildNonZeroExit(code)),
            None => return Err(ExecutionError::BuildNonZeroExit(-1)),
        }

        let artifact = discover_artifact(output_dir, &self.artifact_extension).await?;
        Ok((artifact, outcome.log))
    }
}

/// Walk `output_dir` for files matching `extension` and select the
/// single largest match. Retries up to `ARTIFACT_DISCOVERY_RETRIES`
/// times with a short sleep and an `fsync`-equivalent directory read in
/// between, to tolerate asynchronous filesystem propagation from a
/// sandbox (§4.6).
pub async fn discover_artifact(output_dir: &Path, extension: &str) -> Result<PathBuf, ExecutionError> {
    for attempt in 0..ARTIFACT_DISCOVERY_RETRIES {
        if let Some(path) = scan_largest(output_dir, extension).await {
            return Ok(path);
        }
        if attempt + 1 < ARTIFACT_DISCOVERY_RETRIES {
            tokio::time::sleep(ARTIFACT_DISCOVERY_SLEEP).await;
        }
    }
    warn!(dir = %output_dir.display(), extension, "no artifact found after all discovery retries");
    Err(ExecutionError::ArtifactNotFound)
}

async fn scan_largest(output_dir: &Path, extension: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(output_dir).await.ok()?;
    let mut best: Option<(PathBuf, u64)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else { continue };
        let size = meta.len();
        if best.as_ref().map_or(true, |(_, best_size)| size > *best_size) {
            best = Some((path, size));
        }
    }

    if best.is_some() {
        info!(path = ?best.as_ref().map(|(p, _)| p), "artifact discovered");
    }
    best.map(|(p, _)| p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_request() -> JobRequest {
        JobRequest {
            category: "dev-lang".into(),
            name: "python".into(),
            version: Some("3.11".into()),
            arch: "amd64".into(),
            options: HashMap::new(),
            env: HashMap::new(),
            config_bundle: None,
        }
    }

    struct EchoRunner {
        exit_code: i32,
    }

    #[async_trait]
    impl BuildRunner for EchoRunner {
        async fn run(&self, _request: &JobRequest, _output_dir: &Path) -> Result<ExecutionOutcome, ExecutionError> {
            Ok(ExecutionOutcome { log: "built".into(), exit_code: Some(self.exit_code) })
        }
    }

    #[tokio::test]
    async fn discovers_largest_matching_artifact() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("small.tbz2"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(dir.path().join("large.tbz2"), vec![0u8; 1000]).await.unwrap();
        tokio::fs::write(dir.path().join("ignored.log"), b"not an artifact").await.unwrap();

        let found = discover_artifact(dir.path(), "tbz2").await.unwrap();
        assert_eq!(found.file_name().unwrap(), "large.tbz2");
    }

    #[tokio::test]
    async fn missing_artifact_fails_even_on_build_success() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(
            EchoRunner { exit_code: 0 },
            ExecutionMode::Native,
            Duration::from_secs(5),
            "tbz2".into(),
        );
        let err = executor.execute(&sample_request(), dir.path()).await.unwrap_err();
        assert_eq!(err, ExecutionError::ArtifactNotFound);
    }

    #[tokio::test]
    async fn nonzero_exit_is_fatal_before_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(
            EchoRunner { exit_code: 1 },
            ExecutionMode::Native,
            Duration::from_secs(5),
            "tbz2".into(),
        );
        let err = executor.execute(&sample_request(), dir.path()).await.unwrap_err();
        assert_eq!(err, ExecutionError::BuildNonZeroExit(1));
    }

    #[tokio::test]
    async fn successful_build_with_artifact_returns_path_and_log() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("out.tbz2"), vec![1u8; 50]).await.unwrap();
        let executor = SandboxExecutor::new(
            EchoRunner { exit_code: 0 },
            ExecutionMode::Native,
            Duration::from_secs(5),
            "tbz2".into(),
        );
        let (path, log) = executor.execute(&sample_request(), dir.path()).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "out.tbz2");
        assert_eq!(log, "built");
    }
}
