#![forbid(unsafe_code)]

//! Sequences the five stages of one job and records every step in the store.
//!
//! ```text
//! explanation -> speech -> ( persona video || visuals ) -> composition
//! ```
//!
//! Every stage call runs on its own task and the two middle stages run as
//! siblings. The first branch failure aborts the other one and fails the job.
//! A store failure or a panicking stage is returned to the caller as an
//! `EngineError` so the dispatch message can be redelivered.

use crate::error::EngineError;
use crate::store_handle::StoreHandle;
use cx_core::{
    ArtifactRef, CompositionError, CompositionStage, ExplanationError, ExplanationStage, JobId,
    JobStatus, PersonaVideoError, PersonaVideoStage, SpeechError, SpeechStage, StageName,
    VisualsError, VisualsStage,
};
use cx_storage::{JobStatusRequest, JobStatusResult};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const MSG_GENERATING: &str = "generating explanation";
const MSG_RESTARTING: &str = "restarting pipeline after redelivery";
const MSG_SPEECH: &str = "synthesizing speech";
const MSG_FORK: &str = "rendering persona video and visuals";
const MSG_COMPOSING: &str = "composing final video";
const MSG_READY: &str = "video ready";

#[derive(Clone)]
pub struct Stages {
    pub explanation: Arc<dyn ExplanationStage>,
    pub speech: Arc<dyn SpeechStage>,
    pub persona_video: Arc<dyn PersonaVideoStage>,
    pub visuals: Arc<dyn VisualsStage>,
    pub composition: Arc<dyn CompositionStage>,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    /// Upper bound for a single stage call; `None` waits indefinitely.
    pub stage_timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed: {reason}")]
pub struct StageFailure {
    pub stage: StageName,
    pub kind: &'static str,
    pub reason: String,
}

impl StageFailure {
    fn timed_out(stage: StageName, limit: Duration) -> Self {
        Self {
            stage,
            kind: "TimedOut",
            reason: format!("timed out after {}s", limit.as_secs_f64()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed(ArtifactRef),
    Failed(StageFailure),
    /// The job had already finished before this run; no stage was invoked.
    AlreadyTerminal(JobStatus),
}

trait FailureKind {
    fn failure_kind(&self) -> &'static str;
}

macro_rules! failure_kind {
    ($($ty:ty),+ $(,)?) => {
        $(impl FailureKind for $ty {
            fn failure_kind(&self) -> &'static str {
                self.kind()
            }
        })+
    };
}

failure_kind!(
    ExplanationError,
    SpeechError,
    PersonaVideoError,
    VisualsError,
    CompositionError,
);

async fn guarded<T, E, F>(
    stage: StageName,
    timeout: Option<Duration>,
    call: F,
) -> Result<T, StageFailure>
where
    E: FailureKind + Display,
    F: Future<Output = Result<T, E>>,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => return Err(StageFailure::timed_out(stage, limit)),
        },
        None => call.await,
    };
    result.map_err(|err| StageFailure {
        stage,
        kind: err.failure_kind(),
        reason: err.to_string(),
    })
}

/// Runs `call` on a task of its own. A panic inside it comes back as
/// `EngineError::Join` and dropping the returned future aborts the task.
async fn isolated<T, F>(call: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let mut task = JoinSet::new();
    task.spawn(call);
    match task.join_next().await {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(EngineError::Join(err.to_string())),
        None => Err(EngineError::Join("stage task vanished".to_string())),
    }
}

enum Branch {
    Video(ArtifactRef),
    Visuals(ArtifactRef),
}

pub struct Pipeline {
    store: StoreHandle,
    stages: Stages,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(store: StoreHandle, stages: Stages, config: PipelineConfig) -> Self {
        Self {
            store,
            stages,
            config,
        }
    }

    pub async fn run(&self, job_id: &JobId) -> Result<RunOutcome, EngineError> {
        let job = {
            let id = job_id.clone();
            self.store.call(move |store| store.job_get(&id)).await?
        };
        if job.status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %job.status, "job already finished; skipping");
            return Ok(RunOutcome::AlreadyTerminal(job.status));
        }

        let timeout = self.config.stage_timeout;
        let opening = match job.status {
            JobStatus::Processing => MSG_RESTARTING,
            _ => MSG_GENERATING,
        };
        self.progress(job_id, opening).await?;

        let explained = {
            let stage = Arc::clone(&self.stages.explanation);
            let persona_id = job.persona_id.clone();
            let query = job.query.clone();
            isolated(async move {
                guarded(
                    StageName::Explanation,
                    timeout,
                    stage.generate(&persona_id, &query),
                )
                .await
            })
            .await?
        };
        let text = match explained {
            Ok(text) => text,
            Err(failure) => return self.fail(job_id, failure).await,
        };

        self.progress(job_id, MSG_SPEECH).await?;
        let spoken = {
            let stage = Arc::clone(&self.stages.speech);
            let id = job_id.clone();
            let persona_id = job.persona_id.clone();
            isolated(async move {
                guarded(
                    StageName::Speech,
                    timeout,
                    stage.synthesize(&id, &persona_id, &text),
                )
                .await
            })
            .await?
        };
        let speech = match spoken {
            Ok(speech) => speech,
            Err(failure) => return self.fail(job_id, failure).await,
        };

        self.progress(job_id, MSG_FORK).await?;
        let mut branches = JoinSet::new();
        {
            let stage = Arc::clone(&self.stages.persona_video);
            let persona_id = job.persona_id.clone();
            let audio = speech.audio.clone();
            branches.spawn(async move {
                guarded(
                    StageName::PersonaVideo,
                    timeout,
                    stage.render(&persona_id, &audio),
                )
                .await
                .map(Branch::Video)
            });
        }
        {
            let stage = Arc::clone(&self.stages.visuals);
            let transcript = speech.transcript;
            branches.spawn(async move {
                guarded(StageName::Visuals, timeout, stage.produce(&transcript))
                    .await
                    .map(Branch::Visuals)
            });
        }

        let mut video = None;
        let mut visuals = None;
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok(Ok(Branch::Video(artifact))) => video = Some(artifact),
                Ok(Ok(Branch::Visuals(artifact))) => visuals = Some(artifact),
                Ok(Err(failure)) => {
                    branches.abort_all();
                    return self.fail(job_id, failure).await;
                }
                Err(err) => {
                    branches.abort_all();
                    return Err(EngineError::Join(err.to_string()));
                }
            }
        }
        let (Some(video), Some(visuals)) = (video, visuals) else {
            return Err(EngineError::Join(
                "fork finished without both branch results".to_string(),
            ));
        };

        self.progress(job_id, MSG_COMPOSING).await?;
        let composed = {
            let stage = Arc::clone(&self.stages.composition);
            isolated(async move {
                guarded(
                    StageName::Composition,
                    timeout,
                    stage.compose(&video, &visuals),
                )
                .await
            })
            .await?
        };
        let final_ref = match composed {
            Ok(artifact) => artifact,
            Err(failure) => return self.fail(job_id, failure).await,
        };

        self.append(JobStatusRequest::completed(
            job_id,
            final_ref.clone(),
            MSG_READY,
        ))
        .await?;
        tracing::info!(job_id = %job_id, result_ref = %final_ref, "job completed");
        Ok(RunOutcome::Completed(final_ref))
    }

    async fn progress(&self, job_id: &JobId, message: &'static str) -> Result<(), EngineError> {
        self.append(JobStatusRequest::progress(job_id, message))
            .await?;
        tracing::debug!(job_id = %job_id, "{message}");
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, failure: StageFailure) -> Result<RunOutcome, EngineError> {
        tracing::warn!(
            job_id = %job_id,
            stage = failure.stage.key(),
            kind = failure.kind,
            reason = %failure.reason,
            "stage failed"
        );
        self.append(JobStatusRequest::failed(job_id, failure.to_string()))
            .await?;
        Ok(RunOutcome::Failed(failure))
    }

    async fn append(&self, request: JobStatusRequest) -> Result<JobStatusResult, EngineError> {
        self.store
            .call(move |store| store.job_append_status(request))
            .await
    }
}
