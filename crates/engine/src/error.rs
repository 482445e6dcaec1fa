#![forbid(unsafe_code)]

use cx_core::JobId;
use cx_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("task join failed: {0}")]
    Join(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("a job already exists for origin {source_id}")]
    DuplicateOrigin {
        source_id: String,
        existing: Option<JobId>,
    },
    #[error("dispatch failed for job {job_id}: {reason}")]
    Dispatch { job_id: JobId, reason: String },
    #[error(transparent)]
    Store(EngineError),
}
