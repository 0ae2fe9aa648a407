// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Process configuration for the coordinator and builder binaries.
//!
//! Precedence (later overrides earlier): defaults, config file, then
//! environment variables. Coordinator and builder each get their own
//! env prefix and config file name so the two binaries' configuration
//! never collides when colocated on one host.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;

/// Environment variable prefix for coordinator configuration overrides.
pub const COORDINATOR_ENV_PREFIX: &str = "BUILDFARM_COORDINATOR";
/// Environment variable prefix for builder configuration overrides.
pub const BUILDER_ENV_PREFIX: &str = "BUILDFARM_BUILDER";
/// Separator between nested field segments in environment overrides,
/// e.g. `BUILDFARM_BUILDER_SANDBOX__IMAGE`.
const ENV_SEPARATOR: &str = "__";
/// XDG-style config directory name both binaries share (they use
/// different file names within it).
const CONFIG_DIR_NAME: &str = "buildfarm";

/// Coordinator process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address the HTTP API binds to, e.g. "0.0.0.0:8080".
    #[validate(min_length = 1)]
    pub bind_address: String,
    /// Path to the coordinator's job store file.
    pub job_store_path: PathBuf,
    /// Maximum concurrent builds across the whole fleet.
    #[validate(minimum = 1)]
    pub max_parallel_builds: usize,
    /// Seconds after which a builder with no heartbeat is marked offline.
    #[validate(minimum = 1)]
    pub heartbeat_timeout_seconds: u64,
    /// Hours a terminal job is retained before eviction.
    #[validate(minimum = 1)]
    pub job_retention_hours: i64,
    /// Whether GPG public-key serving is enabled.
    pub gpg_enabled: bool,
    /// Path to the GPG public key file, if `gpg_enabled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpg_public_key_path: Option<PathBuf>,
    /// Statically configured builder endpoints to seed the registry
    /// with at startup, in addition to those that self-register.
    #[serde(default)]
    pub seed_builders: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            job_store_path: PathBuf::from("jobs.json"),
            max_parallel_builds: 64,
            heartbeat_timeout_seconds: 90,
            job_retention_hours: 24,
            gpg_enabled: false,
            gpg_public_key_path: None,
            seed_builders: Vec::new(),
        }
    }
}

/// Builder process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct BuilderConfig {
    /// Address the HTTP API binds to.
    #[validate(min_length = 1)]
    pub bind_address: String,
    /// Stable builder identity announced at registration.
    #[validate(min_length = 1)]
    pub builder_id: String,
    /// URL this builder is reachable at from the coordinator.
    #[validate(min_length = 1)]
    pub public_endpoint: String,
    /// Coordinator base URL for registration and heartbeats.
    #[validate(min_length = 1)]
    pub coordinator_url: String,
    /// Declared target architecture.
    pub architecture: String,
    /// Maximum concurrent jobs.
    #[validate(minimum = 1)]
    pub capacity: u32,
    /// Worker pool size (may differ from `capacity` for I/O-bound builds).
    #[validate(minimum = 1)]
    pub workers: usize,
    /// Worker input channel bound.
    #[validate(minimum = 1)]
    pub queue_capacity: usize,
    /// Seconds between heartbeats.
    #[validate(minimum = 1)]
    pub heartbeat_interval_seconds: u64,
    /// Hard per-build timeout in seconds.
    #[validate(minimum = 1)]
    pub build_timeout_seconds: u64,
    /// Path to the builder's job store file.
    pub job_store_path: PathBuf,
    /// Directory published artifacts are copied into.
    pub artifact_dir: PathBuf,
    /// Extension of the artifact file to discover after a build.
    pub artifact_extension: String,
    /// `true` to run builds in a container, `false` to run natively.
    pub sandboxed: bool,
    /// Container image, required when `sandboxed` is `true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_image: Option<String>,
    /// Host directory bind-mounted read-only into the build container.
    pub sandbox_config_mount: PathBuf,
    /// Build command and arguments.
    #[validate(min_length = 1)]
    pub build_command: Vec<String>,
    /// Whether the artifact-signing stage is enabled.
    pub signing_enabled: bool,
    /// GPG key id passed to `--local-user`, required when `signing_enabled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpg_key_id: Option<String>,
    /// Whether the artifact-upload stage is enabled.
    pub upload_enabled: bool,
    /// Base URL artifacts are PUT under, required when `upload_enabled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_base_url: Option<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".into(),
            builder_id: "builder-1".into(),
            public_endpoint: "http://localhost:9000".into(),
            coordinator_url: "http://localhost:8080".into(),
            architecture: "amd64".into(),
            capacity: num_cpus::get() as u32,
            workers: num_cpus::get(),
            queue_capacity: 256,
            heartbeat_interval_seconds: 30,
            build_timeout_seconds: 2 * 60 * 60,
            job_store_path: PathBuf::from("jobs.json"),
            artifact_dir: PathBuf::from("artifacts"),
            artifact_extension: "tbz2".into(),
            sandboxed: false,
            sandbox_image: None,
            sandbox_config_mount: PathBuf::from("/etc/buildfarm"),
            build_command: vec!["emerge".into(), "--buildpkg".into()],
            signing_enabled: false,
            gpg_key_id: None,
            upload_enabled: false,
            upload_base_url: None,
        }
    }
}

/// Loads a `T: Default + Validate + DeserializeOwned` configuration
/// from defaults, an optional file, then environment variables, in
/// that precedence order.
#[derive(Debug)]
pub struct ConfigLoader<T> {
    env_prefix: &'static str,
    file_name: &'static str,
    custom_file: Option<PathBuf>,
    skip_default_file: bool,
    skip_env: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T> ConfigLoader<T>
where
    T: Default + serde::Serialize + serde::de::DeserializeOwned + Validate,
{
    /// Construct a loader for `T`, using `env_prefix` for environment
    /// overrides and `file_name` as the config file's base name under
    /// the standard `buildfarm` config directory.
    #[must_use]
    pub fn new(env_prefix: &'static str, file_name: &'static str) -> Self {
        Self { env_prefix, file_name, custom_file: None, skip_default_file: false, skip_env: false, _marker: std::marker::PhantomData }
    }

    /// Use `path` instead of searching the default config directory.
    #[must_use]
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip the default config-file search entirely (still honors
    /// [`Self::with_file`] if set).
    #[must_use]
    pub fn skip_default_file(mut self) -> Self {
        self.skip_default_file = true;
        self
    }

    /// Skip environment variable overrides entirely.
    #[must_use]
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load and validate the configuration.
    pub fn load(&self) -> Result<T> {
        let mut builder = ConfigBuilder::builder();

        let defaults = T::default();
        let defaults_value = serde_json::to_value(&defaults).map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        builder = builder.add_source(config::Config::try_from(&defaults_value)?);

        if !self.skip_default_file {
            if let Some(path) = self.find_config_file() {
                tracing::debug!(path = %path.display(), "loading config file");
                builder = builder.add_source(File::from(path).required(false).format(config::FileFormat::Toml));
            }
        }

        if let Some(custom_path) = &self.custom_file {
            tracing::info!(path = %custom_path.display(), "loading custom config file");
            builder = builder.add_source(File::from(custom_path.as_path()).required(true).format(config::FileFormat::Toml));
        }

        if !self.skip_env {
            builder = builder.add_source(Environment::with_prefix(self.env_prefix).separator(ENV_SEPARATOR).try_parsing(true));
        }

        let built = builder.build().context("failed to build configuration")?;
        let config: T = built.try_deserialize().context("failed to deserialize configuration")?;
        config.validate().map_err(|e| anyhow::anyhow!("configuration validation failed: {e}"))?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(dir) = dirs::config_dir() {
            let candidate = dir.join(CONFIG_DIR_NAME).join(self.file_name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        let local = PathBuf::from(self.file_name);
        if local.exists() {
            return Some(local);
        }
        None
    }
}

/// Construct the default coordinator config loader.
#[must_use]
pub fn coordinator_loader() -> ConfigLoader<CoordinatorConfig> {
    ConfigLoader::new(COORDINATOR_ENV_PREFIX, "coordinator.toml")
}

/// Construct the default builder config loader.
#[must_use]
pub fn builder_loader() -> ConfigLoader<BuilderConfig> {
    ConfigLoader::new(BUILDER_ENV_PREFIX, "builder.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_coordinator_config_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn default_builder_config_is_valid() {
        assert!(BuilderConfig::default().validate().is_ok());
    }

    #[test]
    fn loader_applies_env_override_over_defaults() {
        std::env::set_var("BUILDFARM_COORDINATOR_BIND_ADDRESS", "127.0.0.1:9999");
        let loader = coordinator_loader().skip_default_file();
        let cfg = loader.load().unwrap();
        assert_eq!(cfg.bind_address, "127.0.0.1:9999");
        std::env::remove_var("BUILDFARM_COORDINATOR_BIND_ADDRESS");
    }

    #[test]
    fn loader_reads_custom_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "max_parallel_builds = 7\n").unwrap();

        let cfg = coordinator_loader().skip_default_file().skip_env().with_file(&path).load().unwrap();
        assert_eq!(cfg.max_parallel_builds, 7);
    }
}
