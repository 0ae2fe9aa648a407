// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Artifact pipeline (C8): discover -> copy -> sign -> upload -> publish.
//!
//! Only the copy stage is fatal to the job. Sign and upload are
//! best-effort: a failure there is recorded in job metadata and logged
//! as a warning, never rolling the job back to failed (§4.7, Open
//! Question: no retry on flaky signer -- current behavior is a single
//! attempt, best-effort).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::error::ExecutionError;
use crate::job::JobResult;

/// Invokes the external signer over a file. Out of scope per §1; only
/// this narrow interface is specified here.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `path` in place (or alongside it). Failure is recovered
    /// locally by the pipeline, never propagated as a job failure.
    async fn sign(&self, path: &Path) -> anyhow::Result<()>;
}

/// Pushes a file to a remote store and returns its public URL. Out of
/// scope per §1; only this narrow interface is specified here (§9:
/// "two storage kinds: object-store, HTTP base").
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload `path`, returning the URL it is now reachable at.
    async fn upload(&self, path: &Path) -> anyhow::Result<String>;
}

#[async_trait]
impl Signer for Box<dyn Signer> {
    async fn sign(&self, path: &Path) -> anyhow::Result<()> {
        (**self).sign(path).await
    }
}

#[async_trait]
impl ArtifactStore for Box<dyn ArtifactStore> {
    async fn upload(&self, path: &Path) -> anyhow::Result<String> {
        (**self).upload(path).await
    }
}

/// Ordered, best-effort-after-copy artifact pipeline.
pub struct ArtifactPipeline<S: Signer, U: ArtifactStore> {
    /// Destination directory for canonical local artifact copies.
    pub artifact_dir: PathBuf,
    /// `Some` when signing is enabled.
    pub signer: Option<S>,
    /// `Some` when a remote store is configured.
    pub store: Option<U>,
}

impl<S: Signer, U: ArtifactStore> ArtifactPipeline<S, U> {
    /// Construct a pipeline. Pass `None` for `signer`/`store` to disable
    /// those stages entirely.
    #[must_use]
    pub fn new(artifact_dir: PathBuf, signer: Option<S>, store: Option<U>) -> Self {
        Self { artifact_dir, signer, store }
    }

    /// Run the pipeline over a discovered artifact at `source`, writing
    /// the outcome into `result`. `canonical_name` is the filename the
    /// artifact is copied to under `artifact_dir`.
    pub async fn publish(&self, source: &Path, canonical_name: &str, result: &mut JobResult) -> Result<(), ExecutionError> {
        let dest = self.artifact_dir.join(canonical_name);
        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|e| ExecutionError::ArtifactCopyFailed(e.to_string()))?;
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| ExecutionError::ArtifactCopyFailed(e.to_string()))?;

        let mut published_url = dest.to_string_lossy().into_owned();

        if let Some(signer) = &self.signer {
            match signer.sign(&dest).await {
                Ok(()) => {
                    result.metadata.insert("signed".into(), serde_json::Value::Bool(true));
                }
                Err(e) => {
                    warn!(artifact = %dest.display(), error = %e, "signing failed, continuing unsigned");
                    result.metadata.insert("signed".into(), serde_json::Value::Bool(false));
                }
            }
        }

        if let Some(store) = &self.store {
            match store.upload(&dest).await {
                Ok(url) => {
                    published_url = url;
                    result.metadata.insert("uploaded".into(), serde_json::Value::Bool(true));
                }
                Err(e) => {
                    warn!(artifact = %dest.display(), error = %e, "upload failed, publishing local path");
                    result.metadata.insert("uploaded".into(), serde_json::Value::Bool(false));
                }
            }
        }

        result.artifact_url = Some(published_url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct AlwaysOkSigner;
    #[async_trait]
    impl Signer for AlwaysOkSigner {
        async fn sign(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFailSigner;
    #[async_trait]
    impl Signer for AlwaysFailSigner {
        async fn sign(&self, _path: &Path) -> anyhow::Result<()> {
            anyhow::bail!("signer unreachable")
        }
    }

    struct FakeStore {
        called: Arc<AtomicBool>,
    }
    #[async_trait]
    impl ArtifactStore for FakeStore {
        async fn upload(&self, path: &Path) -> anyhow::Result<String> {
            self.called.store(true, Ordering::SeqCst);
            Ok(format!("https://artifacts.example/{}", path.file_name().unwrap().to_string_lossy()))
        }
    }

    #[tokio::test]
    async fn copy_then_publish_local_when_no_signer_or_store() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("pkg.tbz2");
        tokio::fs::write(&src, b"data").await.unwrap();

        let pipeline: ArtifactPipeline<AlwaysOkSigner, FakeStore> =
            ArtifactPipeline::new(dest_dir.path().to_path_buf(), None, None);

        let mut result = JobResult::default();
        pipeline.publish(&src, "pkg.tbz2", &mut result).await.unwrap();

        assert!(dest_dir.path().join("pkg.tbz2").exists());
        assert_eq!(result.artifact_url.unwrap(), dest_dir.path().join("pkg.tbz2").to_string_lossy());
    }

    #[tokio::test]
    async fn signing_failure_does_not_fail_the_pipeline() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("pkg.tbz2");
        tokio::fs::write(&src, b"data").await.unwrap();

        let pipeline: ArtifactPipeline<AlwaysFailSigner, FakeStore> =
            ArtifactPipeline::new(dest_dir.path().to_path_buf(), Some(AlwaysFailSigner), None);

        let mut result = JobResult::default();
        pipeline.publish(&src, "pkg.tbz2", &mut result).await.unwrap();

        assert_eq!(result.metadata.get("signed"), Some(&serde_json::Value::Bool(false)));
        assert!(result.artifact_url.is_some());
    }

    #[tokio::test]
    async fn upload_replaces_artifact_url_with_remote_url() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("pkg.tbz2");
        tokio::fs::write(&src, b"data").await.unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let pipeline: ArtifactPipeline<AlwaysOkSigner, FakeStore> = ArtifactPipeline::new(
            dest_dir.path().to_path_buf(),
            None,
            Some(FakeStore { called: called.clone() }),
        );

        let mut result = JobResult::default();
        pipeline.publish(&src, "pkg.tbz2", &mut result).await.unwrap();

        assert!(called.load(Ordering::SeqCst));
        assert_eq!(result.artifact_url.unwrap(), "https://artifacts.example/pkg.tbz2");
        assert_eq!(result.metadata.get("uploaded"), Some(&serde_json::Value::Bool(true)));
    }
}
