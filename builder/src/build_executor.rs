// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wires the sandbox executor (C7) and artifact pipeline (C8) together
//! behind the worker pool's (C6) `JobExecutor` contract.

use std::path::PathBuf;

use async_trait::async_trait;
use buildfarm_core::artifact::{ArtifactPipeline, ArtifactStore, Signer};
use buildfarm_core::error::ExecutionError;
use buildfarm_core::executor::{BuildRunner, SandboxExecutor};
use buildfarm_core::job::{JobId, JobRequest, JobResult};
use buildfarm_core::worker_pool::JobExecutor;

/// Runs a job end to end: execute under the sandbox, then run the
/// discovered artifact through copy/sign/upload/publish.
pub struct BuildJobExecutor {
    sandbox: SandboxExecutor<Box<dyn BuildRunner>>,
    pipeline: ArtifactPipeline<Box<dyn Signer>, Box<dyn ArtifactStore>>,
    work_dir: PathBuf,
}

impl BuildJobExecutor {
    /// Construct an executor over the given runner/pipeline, running
    /// each job's build under its own subdirectory of `work_dir`.
    #[must_use]
    pub fn new(
        sandbox: SandboxExecutor<Box<dyn BuildRunner>>,
        pipeline: ArtifactPipeline<Box<dyn Signer>, Box<dyn ArtifactStore>>,
        work_dir: PathBuf,
    ) -> Self {
        Self { sandbox, pipeline, work_dir }
    }
}

#[async_trait]
impl JobExecutor for BuildJobExecutor {
    async fn execute(&self, job_id: &JobId, request: &JobRequest) -> Result<JobResult, (String, JobResult)> {
        let output_dir = self.work_dir.join(job_id);
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            return Err((format!("failed to create output directory: {e}"), JobResult::default()));
        }

        let (artifact_path, log) = match self.sandbox.execute(request, &output_dir).await {
            Ok(ok) => ok,
            Err(e) => return Err((e.to_string(), JobResult { log: partial_log(&e), ..JobResult::default() })),
        };

        let mut result = JobResult { log, ..JobResult::default() };
        let canonical_name = canonical_artifact_name(request, &artifact_path);

        if let Err(e) = self.pipeline.publish(&artifact_path, &canonical_name, &mut result).await {
            return Err((e.to_string(), result));
        }

        Ok(result)
    }
}

fn partial_log(e: &ExecutionError) -> String {
    format!("build failed before an artifact could be produced: {e}")
}

fn canonical_artifact_name(request: &JobRequest, artifact_path: &std::path::Path) -> String {
    let extension = artifact_path.extension().and_then(|e| e.to_str()).unwrap_or("bin");
    let version = request.version.as_deref().unwrap_or("0");
    format!("{}-{}-{}.{}", request.category, request.name, version, extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildfarm_core::executor::ExecutionMode;
    use buildfarm_core::job::OptionsMap;
    use std::collections::HashMap;
    use std::time::Duration;

    struct FakeRunner;
    #[async_trait]
    impl BuildRunner for FakeRunner {
        async fn run(&self, _request: &JobRequest, output_dir: &std::path::Path) -> Result<buildfarm_core::executor::ExecutionOutcome, ExecutionError> {
            tokio::fs::write(output_dir.join("out.tbz2"), b"artifact").await.unwrap();
            Ok(buildfarm_core::executor::ExecutionOutcome { log: "built ok".into(), exit_code: Some(0) })
        }
    }

    fn sample_request() -> JobRequest {
        JobRequest {
            category: "dev-lang".into(),
            name: "rust".into(),
            version: Some("1.75.0".into()),
            arch: "amd64".into(),
            options: OptionsMap::new(),
            env: HashMap::new(),
            config_bundle: None,
        }
    }

    #[tokio::test]
    async fn successful_build_copies_and_publishes_artifact() {
        let work_dir = tempfile::tempdir().unwrap();
        let artifact_dir = tempfile::tempdir().unwrap();

        let sandbox: SandboxExecutor<Box<dyn BuildRunner>> =
            SandboxExecutor::new(Box::new(FakeRunner), ExecutionMode::Native, Duration::from_secs(5), "tbz2".into());
        let pipeline: ArtifactPipeline<Box<dyn Signer>, Box<dyn ArtifactStore>> =
            ArtifactPipeline::new(artifact_dir.path().to_path_buf(), None, None);
        let executor = BuildJobExecutor::new(sandbox, pipeline, work_dir.path().to_path_buf());

        let request = sample_request();
        let result = executor.execute(&"job-1".to_string(), &request).await.unwrap();

        assert!(result.artifact_url.unwrap().contains("dev-lang-rust-1.75.0.tbz2"));
    }
}
