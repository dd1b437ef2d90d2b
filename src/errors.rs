//! Typed error hierarchy for the Crucible orchestrator.
//!
//! One enum per subsystem seam:
//! - `LockError`: the single-pipeline process lock
//! - `StoreError`: work-item documents under `context/groups/`
//! - `PipelineError`: phase execution failures that stop progression
//! - `GateError`: report files read by the quality gates
//!
//! Everything else propagates as `anyhow::Error` with context attached.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the process lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another pipeline is already running (pid {pid}, lock file {path})")]
    Held { pid: i32, path: PathBuf },

    #[error("Failed to access lock file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the work-item state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Work group '{group}' not found under {dir}")]
    GroupNotFound { group: String, dir: PathBuf },

    #[error("Work item '{id}' not found in group '{group}'")]
    ItemNotFound { group: String, id: String },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that stop pipeline progression.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to spawn agent '{cmd}': {source}")]
    AgentSpawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors reading a quality-gate report.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Failed to read report {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Report {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
