#![forbid(unsafe_code)]

//! Contracts for the externally fulfilled pipeline stages.
//!
//! The executor only sees these traits; vendor calls live behind them. Every
//! stage may be invoked again for the same job after a redelivery, so
//! implementations must tolerate re-execution.

use crate::ids::{JobId, PersonaId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque locator of an artifact produced by a stage (a path, URL or key).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimedWord {
    pub word: String,
    pub start_s: f64,
    pub end_s: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub words: Vec<TimedWord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeechOutput {
    pub audio: ArtifactRef,
    pub transcript: Transcript,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageName {
    Explanation,
    Speech,
    PersonaVideo,
    Visuals,
    Composition,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Explanation,
        StageName::Speech,
        StageName::PersonaVideo,
        StageName::Visuals,
        StageName::Composition,
    ];

    /// Stable key used in configuration and logs.
    pub fn key(self) -> &'static str {
        match self {
            Self::Explanation => "explanation",
            Self::Speech => "speech",
            Self::PersonaVideo => "persona_video",
            Self::Visuals => "visuals",
            Self::Composition => "composition",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Explanation => "generate explanation",
            Self::Speech => "synthesize speech",
            Self::PersonaVideo => "produce persona video",
            Self::Visuals => "produce visuals",
            Self::Composition => "compose final video",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExplanationError {
    #[error("persona not found: {0}")]
    PersonaNotFound(String),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

impl ExplanationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PersonaNotFound(_) => "PersonaNotFound",
            Self::GenerationFailed(_) => "GenerationFailed",
        }
    }

    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "PersonaNotFound" => Self::PersonaNotFound(message),
            _ => Self::GenerationFailed(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SpeechError {
    #[error("voice not configured: {0}")]
    VoiceNotConfigured(String),
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),
}

impl SpeechError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VoiceNotConfigured(_) => "VoiceNotConfigured",
            Self::SynthesisFailed(_) => "SynthesisFailed",
        }
    }

    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "VoiceNotConfigured" => Self::VoiceNotConfigured(message),
            _ => Self::SynthesisFailed(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PersonaVideoError {
    #[error("source video missing: {0}")]
    SourceVideoMissing(String),
    #[error("render failed: {0}")]
    RenderFailed(String),
}

impl PersonaVideoError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceVideoMissing(_) => "SourceVideoMissing",
            Self::RenderFailed(_) => "RenderFailed",
        }
    }

    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "SourceVideoMissing" => Self::SourceVideoMissing(message),
            _ => Self::RenderFailed(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VisualsError {
    #[error("visual planning failed: {0}")]
    PlanningFailed(String),
    #[error("render failed: {0}")]
    RenderFailed(String),
}

impl VisualsError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanningFailed(_) => "PlanningFailed",
            Self::RenderFailed(_) => "RenderFailed",
        }
    }

    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "PlanningFailed" => Self::PlanningFailed(message),
            _ => Self::RenderFailed(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    #[error("composition failed: {0}")]
    CompositionFailed(String),
}

impl CompositionError {
    pub fn kind(&self) -> &'static str {
        "CompositionFailed"
    }

    pub fn from_kind(_kind: &str, message: String) -> Self {
        Self::CompositionFailed(message)
    }
}

#[async_trait]
pub trait ExplanationStage: Send + Sync {
    async fn generate(
        &self,
        persona_id: &PersonaId,
        query: &str,
    ) -> Result<String, ExplanationError>;
}

#[async_trait]
pub trait SpeechStage: Send + Sync {
    async fn synthesize(
        &self,
        job_id: &JobId,
        persona_id: &PersonaId,
        text: &str,
    ) -> Result<SpeechOutput, SpeechError>;
}

#[async_trait]
pub trait PersonaVideoStage: Send + Sync {
    async fn render(
        &self,
        persona_id: &PersonaId,
        audio: &ArtifactRef,
    ) -> Result<ArtifactRef, PersonaVideoError>;
}

#[async_trait]
pub trait VisualsStage: Send + Sync {
    async fn produce(&self, transcript: &Transcript) -> Result<ArtifactRef, VisualsError>;
}

#[async_trait]
pub trait CompositionStage: Send + Sync {
    async fn compose(
        &self,
        video: &ArtifactRef,
        visuals: &ArtifactRef,
    ) -> Result<ArtifactRef, CompositionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_map_back_to_variants() {
        let err = VisualsError::from_kind("PlanningFailed", "no scenes".to_string());
        assert_eq!(err.kind(), "PlanningFailed");
        assert_eq!(err.to_string(), "visual planning failed: no scenes");

        let unknown = ExplanationError::from_kind("Weird", "boom".to_string());
        assert_eq!(unknown, ExplanationError::GenerationFailed("boom".to_string()));
    }

    #[test]
    fn transcript_words_default_to_empty() {
        let t: Transcript = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert!(t.words.is_empty());
    }
}
