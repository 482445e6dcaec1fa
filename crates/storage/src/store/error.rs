#![forbid(unsafe_code)]

use cx_core::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown id")]
    UnknownId,
    #[error("duplicate origin (source_id={source_id})")]
    DuplicateOrigin { source_id: String },
    #[error("duplicate job id ({0})")]
    DuplicateJobId(String),
    #[error("invalid status transition ({from} -> {to})")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("revision mismatch (expected={expected}, actual={actual})")]
    RevisionMismatch { expected: i64, actual: i64 },
    #[error("invalid row: {0}")]
    InvalidRow(&'static str),
    #[error("store lock poisoned")]
    Poisoned,
}
