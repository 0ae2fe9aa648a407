// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core error taxonomy shared by the scheduler, registry, executor, and
//! dispatcher.
//!
//! Each variant here maps to one of the error kinds described by the
//! error-handling design: validation, not-found, capacity, transient
//! remote, execution, durability, and internal invariant violations.
//! HTTP layers translate these into status codes; everything else
//! treats them as ordinary `std::error::Error` values.

use thiserror::Error;

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Request failed validation at a boundary (bad input shape, missing
    /// required field). Surfaced as 400 at the HTTP layer.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced job, builder, or artifact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A submission was rejected with the same job id twice.
    #[error("duplicate job id: {0}")]
    DuplicateJobId(String),

    /// The scheduler could not hand out work right now: distinguishes
    /// "try again later" conditions from permanent failures.
    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),

    /// An HTTP call to a builder or the coordinator failed transiently
    /// (connection refused, timeout, non-2xx). Retried by the caller;
    /// only surfaced after retries are exhausted.
    #[error("transient remote error contacting {target}: {message}")]
    TransientRemote {
        /// Human-readable identifier of the remote peer (builder id or URL).
        target: String,
        /// Underlying error text.
        message: String,
    },

    /// The sandboxed or native build execution failed terminally.
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// The job store failed to persist or load state. Logged; the
    /// in-memory hot path continues regardless.
    #[error("durability error: {0}")]
    Durability(String),

    /// A safety invariant was violated; indicates a bug rather than bad
    /// input. Always logged with the job id that triggered it.
    #[error("internal invariant violation: {0}")]
    Invariant(String),
}

/// Distinct reasons `GetNextTask` can fail to hand out work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// The builder id is not present in the registry.
    #[error("unknown builder: {0}")]
    UnknownBuilder(String),

    /// The builder has been administratively disabled.
    #[error("builder disabled: {0}")]
    BuilderDisabled(String),

    /// The builder's last heartbeat is older than the configured timeout.
    #[error("builder unhealthy: {0}")]
    BuilderUnhealthy(String),

    /// The builder is already running `capacity` jobs.
    #[error("builder at capacity: {0}")]
    BuilderAtCapacity(String),

    /// The scheduler-wide parallelism cap has been reached.
    #[error("global parallelism cap reached ({0})")]
    GlobalCapReached(usize),

    /// There is no ready task to hand out.
    #[error("queue empty")]
    QueueEmpty,

    /// The worker pool's bounded input channel is full.
    #[error("worker queue full (capacity {0})")]
    QueueFull(usize),
}

/// Reasons a build execution terminates in failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The sandbox/container could not be created.
    #[error("sandbox create failed: {0}")]
    SandboxCreateFailed(String),

    /// The sandbox/container was created but failed to start.
    #[error("sandbox start failed: {0}")]
    SandboxStartFailed(String),

    /// The build command exited with a non-zero status.
    #[error("build exited non-zero: {0}")]
    BuildNonZeroExit(i32),

    /// Execution ran past the configured hard timeout and was cancelled.
    #[error("build timed out")]
    Timeout,

    /// The build reported success but no artifact file could be found.
    #[error("artifact not found")]
    ArtifactNotFound,

    /// Copying the discovered artifact into the artifact directory failed.
    #[error("artifact copy failed: {0}")]
    ArtifactCopyFailed(String),
}

/// Convenience alias used throughout the core crate.
pub type CoreResult<T> = Result<T, CoreError>;
