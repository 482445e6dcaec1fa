#![forbid(unsafe_code)]

pub mod ids;
pub mod model;
pub mod personas;
pub mod reply;
pub mod stages;

pub use ids::{IdError, JobId, PersonaId};
pub use model::{JobStatus, OriginRef, OriginRefError};
pub use personas::{PersonaDirectory, PersonaLoadError};
pub use reply::{ArtifactStore, DeliveryReceipt, ReplyDelivery, ReplyError, ReplyRequest};
pub use stages::{
    ArtifactRef, CompositionError, CompositionStage, ExplanationError, ExplanationStage,
    PersonaVideoError, PersonaVideoStage, SpeechError, SpeechOutput, SpeechStage, StageName,
    TimedWord, Transcript, VisualsError, VisualsStage,
};
