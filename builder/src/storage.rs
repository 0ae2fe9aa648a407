// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Concrete `Signer` and `ArtifactStore` implementations.
//!
//! `GpgSigner` shells out to the `gpg` binary rather than linking a PGP
//! crate, matching the narrow-interface boundary the pipeline expects
//! (§9: external signer is out of scope, only the interface is
//! specified). `HttpUploadStore` is the "HTTP base" storage variant;
//! the "object-store" variant is left to an implementer (no object
//! storage SDK is carried by the workspace).

use std::path::Path;

use async_trait::async_trait;
use buildfarm_core::artifact::{ArtifactStore, Signer};
use tokio::process::Command;

/// Detached-signs artifacts with a configured GPG key id via the `gpg`
/// CLI.
pub struct GpgSigner {
    /// Key id or fingerprint passed to `gpg --local-user`.
    pub key_id: String,
}

#[async_trait]
impl Signer for GpgSigner {
    async fn sign(&self, path: &Path) -> anyhow::Result<()> {
        let status = Command::new("gpg")
            .args(["--batch", "--yes", "--detach-sign", "--local-user"])
            .arg(&self.key_id)
            .arg(path)
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("gpg exited with {status}");
        }
        Ok(())
    }
}

/// Uploads artifacts by POSTing their bytes to a base URL, returning
/// the resulting `{base_url}/{filename}` location.
pub struct HttpUploadStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploadStore {
    /// Construct a store that uploads under `base_url`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_owned() }
    }
}

#[async_trait]
impl ArtifactStore for HttpUploadStore {
    async fn upload(&self, path: &Path) -> anyhow::Result<String> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("artifact path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let body = tokio::fs::read(path).await?;
        let url = format!("{}/{}", self.base_url, file_name);

        let response = self.http.put(&url).body(body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("upload to {url} failed with status {}", response.status());
        }
        Ok(url)
    }
}
