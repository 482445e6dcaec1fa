#![forbid(unsafe_code)]

use crate::dispatch::JobQueue;
use crate::error::{EngineError, IntakeError};
use crate::store_handle::StoreHandle;
use cx_core::{JobId, OriginRef, PersonaId};
use cx_storage::{DispatchPayload, JobCreateRequest, JobStatusRequest, StoreError};
use std::sync::Arc;

/// Single entry point for new jobs, whether requested directly or spawned
/// from an external mention.
pub struct JobIntake {
    store: StoreHandle,
    queue: Arc<dyn JobQueue>,
}

impl JobIntake {
    pub fn new(store: StoreHandle, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn submit(
        &self,
        persona_id: &str,
        query: &str,
        origin: Option<OriginRef>,
    ) -> Result<JobId, IntakeError> {
        let persona_id = PersonaId::try_new(persona_id)
            .map_err(|err| IntakeError::InvalidInput(format!("persona_id: {err}")))?;
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(IntakeError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }

        if let Some(origin) = origin.as_ref() {
            let source_id = origin.source_id.clone();
            let existing = self
                .store
                .call(move |store| store.job_find_by_origin(&source_id))
                .await
                .map_err(IntakeError::Store)?;
            if let Some(existing) = existing {
                tracing::info!(
                    source_id = %origin.source_id,
                    job_id = %existing.id,
                    "origin already has a job"
                );
                return Err(IntakeError::DuplicateOrigin {
                    source_id: origin.source_id.clone(),
                    existing: Some(existing.id),
                });
            }
        }

        let request = JobCreateRequest {
            id: JobId::generate(),
            persona_id: persona_id.clone(),
            query,
            origin,
        };
        let created = match self
            .store
            .call(move |store| store.job_create(request))
            .await
        {
            Ok(created) => created,
            Err(EngineError::Store(StoreError::DuplicateOrigin { source_id })) => {
                return Err(IntakeError::DuplicateOrigin {
                    source_id,
                    existing: None,
                });
            }
            Err(EngineError::Store(StoreError::InvalidInput(msg))) => {
                return Err(IntakeError::InvalidInput(msg.to_string()));
            }
            Err(err) => return Err(IntakeError::Store(err)),
        };
        let job_id = created.job.id;

        let payload = DispatchPayload {
            job_id: job_id.clone(),
            persona_id,
            query: created.job.query,
        };
        if let Err(err) = self.queue.enqueue(payload).await {
            let reason = err.to_string();
            tracing::error!(job_id = %job_id, error = %reason, "dispatch failed");
            let failed = JobStatusRequest::failed(&job_id, format!("dispatch failed: {reason}"));
            if let Err(record_err) = self
                .store
                .call(move |store| store.job_append_status(failed))
                .await
            {
                tracing::error!(
                    job_id = %job_id,
                    error = %record_err,
                    "could not record dispatch failure"
                );
            }
            return Err(IntakeError::Dispatch { job_id, reason });
        }

        tracing::info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }
}
