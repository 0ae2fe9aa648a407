// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job store (C2): durable snapshot of job records with atomic
//! replacement and age-based eviction.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::job::{JobId, JobRecord, JobState};

/// On-disk envelope. A bare map (no `jobs`/`updated_at` wrapper) is also
/// accepted on load for backward compatibility.
#[derive(Debug, Serialize, Deserialize)]
struct JobStoreEnvelope {
    jobs: HashMap<JobId, JobRecord>,
    updated_at: DateTime<Utc>,
}

/// Durable job-record store backed by a single JSON file, written via
/// stage-to-temp-file-then-rename for atomicity.
///
/// Concurrency: an internal exclusive lock serializes `save`; `load` is
/// only called once at startup in the normal path but still takes the
/// same lock in shared mode so it can run concurrently with other
/// readers without racing a save.
pub struct JobStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JobStore {
    /// Construct a store rooted at `path`. The parent directory must
    /// exist and be writable; this is checked eagerly so storage
    /// unavailability is surfaced at construction rather than on first
    /// save.
    pub fn new(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| CoreError::Durability(format!("cannot create {}: {e}", parent.display())))?;
            }
        }
        Ok(Self { path, lock: RwLock::new(()) })
    }

    /// Persist the full job map. Writes are atomic: the new content is
    /// staged to a sibling temporary file, fsynced, then renamed over
    /// the target path. On any failure the temporary file is removed
    /// and a `Durability` error is returned; the in-memory map the
    /// caller holds is left untouched.
    pub fn save(&self, jobs: &HashMap<JobId, JobRecord>) -> CoreResult<()> {
        let _guard = self.lock.write();
        let envelope = JobStoreEnvelope { jobs: jobs.clone(), updated_at: Utc::now() };
        let encoded = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| CoreError::Durability(format!("serialize jobs.json: {e}")))?;

        let tmp_path = self.tmp_path();
        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(CoreError::Durability(format!("write {}: {e}", tmp_path.display())));
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CoreError::Durability(format!("rename {} -> {}: {e}", tmp_path.display(), self.path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }

        Ok(())
    }

    /// Load the job map from disk. Returns an empty map if the file
    /// does not exist yet. A file that parses as a bare `{id: record}`
    /// map (no envelope) is accepted for backward compatibility. A file
    /// that fails to parse at all is a corrupt-file error returned to
    /// the caller, who must decide whether to start fresh.
    pub fn load(&self) -> CoreResult<HashMap<JobId, JobRecord>> {
        let _guard = self.lock.read();
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(CoreError::Durability(format!("read {}: {e}", self.path.display()))),
        };

        if let Ok(envelope) = serde_json::from_slice::<JobStoreEnvelope>(&bytes) {
            return Ok(envelope.jobs);
        }
        serde_json::from_slice::<HashMap<JobId, JobRecord>>(&bytes)
            .map_err(|e| CoreError::Durability(format!("corrupt jobs.json: {e}")))
    }

    /// Drop terminal jobs whose `ended_at` is older than `now - retention`.
    /// Non-terminal jobs are never purged regardless of age. Returns the
    /// number of jobs removed.
    pub fn clean_old(jobs: &mut HashMap<JobId, JobRecord>, retention: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - retention;
        let before = jobs.len();
        jobs.retain(|_, job| {
            if !job.state.is_terminal() {
                return true;
            }
            match job.ended_at {
                Some(ended_at) => ended_at > cutoff,
                None => true,
            }
        });
        before - jobs.len()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
            _ => PathBuf::from(name),
        }
    }
}

/// Sweep jobs for retention directly against a file path, used by the
/// persister's periodic clean-old-jobs loop: loads, cleans, and saves
/// back in one step.
pub fn clean_old_jobs_in_store(store: &JobStore, retention: Duration) -> CoreResult<usize> {
    let mut jobs = store.load()?;
    let dropped = JobStore::clean_old(&mut jobs, retention, Utc::now());
    if dropped > 0 {
        store.save(&jobs)?;
    }
    Ok(dropped)
}
