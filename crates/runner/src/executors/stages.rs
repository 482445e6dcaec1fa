#![forbid(unsafe_code)]

use super::command::{CommandFailure, CommandSpec, invoke};
use async_trait::async_trait;
use cx_core::{
    ArtifactRef, CompositionError, CompositionStage, ExplanationError, ExplanationStage, JobId,
    PersonaId, PersonaVideoError, PersonaVideoStage, SpeechError, SpeechOutput, SpeechStage,
    StageName, Transcript, VisualsError, VisualsStage,
};
use serde::{Deserialize, Serialize};

/// A stage fulfilled by an external command.
#[derive(Clone, Debug)]
pub(crate) struct CommandStage {
    stage: StageName,
    spec: CommandSpec,
}

impl CommandStage {
    pub(crate) fn new(stage: StageName, spec: CommandSpec) -> Self {
        Self { stage, spec }
    }

    async fn call<Req, Resp>(
        &self,
        job_id: Option<&JobId>,
        request: &Req,
    ) -> Result<Resp, CommandFailure>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        invoke(&self.spec, self.stage.key(), job_id, request).await
    }
}

#[derive(Serialize)]
struct ExplanationRequest<'a> {
    persona_id: &'a PersonaId,
    query: &'a str,
}

#[derive(Deserialize)]
struct ExplanationResponse {
    text: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    job_id: &'a JobId,
    persona_id: &'a PersonaId,
    text: &'a str,
}

#[derive(Serialize)]
struct PersonaVideoRequest<'a> {
    persona_id: &'a PersonaId,
    audio: &'a ArtifactRef,
}

#[derive(Serialize)]
struct VisualsRequest<'a> {
    transcript: &'a Transcript,
}

#[derive(Serialize)]
struct CompositionRequest<'a> {
    video: &'a ArtifactRef,
    visuals: &'a ArtifactRef,
}

#[derive(Deserialize)]
struct ArtifactResponse {
    artifact: ArtifactRef,
}

#[async_trait]
impl ExplanationStage for CommandStage {
    async fn generate(
        &self,
        persona_id: &PersonaId,
        query: &str,
    ) -> Result<String, ExplanationError> {
        let request = ExplanationRequest { persona_id, query };
        match self.call::<_, ExplanationResponse>(None, &request).await {
            Ok(response) if response.text.trim().is_empty() => Err(
                ExplanationError::GenerationFailed("empty explanation".to_string()),
            ),
            Ok(response) => Ok(response.text),
            Err(failure) => Err(ExplanationError::from_kind(
                &failure.kind().to_string(),
                failure.into_message(),
            )),
        }
    }
}

#[async_trait]
impl SpeechStage for CommandStage {
    async fn synthesize(
        &self,
        job_id: &JobId,
        persona_id: &PersonaId,
        text: &str,
    ) -> Result<SpeechOutput, SpeechError> {
        let request = SpeechRequest {
            job_id,
            persona_id,
            text,
        };
        self.call(Some(job_id), &request).await.map_err(|failure| {
            SpeechError::from_kind(&failure.kind().to_string(), failure.into_message())
        })
    }
}

#[async_trait]
impl PersonaVideoStage for CommandStage {
    async fn render(
        &self,
        persona_id: &PersonaId,
        audio: &ArtifactRef,
    ) -> Result<ArtifactRef, PersonaVideoError> {
        let request = PersonaVideoRequest { persona_id, audio };
        self.call::<_, ArtifactResponse>(None, &request)
            .await
            .map(|response| response.artifact)
            .map_err(|failure| {
                PersonaVideoError::from_kind(&failure.kind().to_string(), failure.into_message())
            })
    }
}

#[async_trait]
impl VisualsStage for CommandStage {
    async fn produce(&self, transcript: &Transcript) -> Result<ArtifactRef, VisualsError> {
        let request = VisualsRequest { transcript };
        self.call::<_, ArtifactResponse>(None, &request)
            .await
            .map(|response| response.artifact)
            .map_err(|failure| {
                VisualsError::from_kind(&failure.kind().to_string(), failure.into_message())
            })
    }
}

#[async_trait]
impl CompositionStage for CommandStage {
    async fn compose(
        &self,
        video: &ArtifactRef,
        visuals: &ArtifactRef,
    ) -> Result<ArtifactRef, CompositionError> {
        let request = CompositionRequest { video, visuals };
        self.call::<_, ArtifactResponse>(None, &request)
            .await
            .map(|response| response.artifact)
            .map_err(|failure| {
                CompositionError::from_kind(&failure.kind().to_string(), failure.into_message())
            })
    }
}
