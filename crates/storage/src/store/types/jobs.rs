#![forbid(unsafe_code)]

use cx_core::{ArtifactRef, JobId, JobStatus, OriginRef, PersonaId};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobRow {
    pub id: JobId,
    pub revision: i64,
    pub persona_id: PersonaId,
    pub query: String,
    pub status: JobStatus,
    pub origin: Option<OriginRef>,
    pub result_ref: Option<ArtifactRef>,
    pub error: Option<String>,
    pub reply_posted: bool,
    pub reply_posted_at_ms: Option<i64>,
    pub reply_receipt: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStatusUpdateRow {
    pub seq: i64,
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct JobCreateRequest {
    pub id: JobId,
    pub persona_id: PersonaId,
    pub query: String,
    pub origin: Option<OriginRef>,
}

#[derive(Clone, Debug)]
pub struct JobCreateResult {
    pub job: JobRow,
    pub created_update: JobStatusUpdateRow,
}

#[derive(Clone, Debug)]
pub struct JobStatusRequest {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub result_ref: Option<ArtifactRef>,
    pub error: Option<String>,
}

impl JobStatusRequest {
    pub fn progress(job_id: &JobId, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.clone(),
            status: JobStatus::Processing,
            message: message.into(),
            result_ref: None,
            error: None,
        }
    }

    pub fn completed(job_id: &JobId, result_ref: ArtifactRef, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.clone(),
            status: JobStatus::Completed,
            message: message.into(),
            result_ref: Some(result_ref),
            error: None,
        }
    }

    pub fn failed(job_id: &JobId, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            job_id: job_id.clone(),
            status: JobStatus::Error,
            message: error.clone(),
            result_ref: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobStatusResult {
    pub job: JobRow,
    pub update: JobStatusUpdateRow,
}

#[derive(Clone, Debug)]
pub struct JobsListRequest {
    pub status: Option<JobStatus>,
    pub limit: usize,
}

#[derive(Clone, Debug)]
pub struct JobsListResult {
    pub jobs: Vec<JobRow>,
    pub has_more: bool,
}

/// Position after a job in reconcile order, `(completed_at_ms, id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileCursor {
    pub completed_at_ms: i64,
    pub job_id: JobId,
}

impl ReconcileCursor {
    pub fn after(job: &JobRow) -> Self {
        Self {
            completed_at_ms: job.completed_at_ms.unwrap_or(0),
            job_id: job.id.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReplyClaimRequest {
    pub job_id: JobId,
    pub claimant: String,
    pub ttl_ms: u64,
}
