#![forbid(unsafe_code)]

mod dispatch;
mod error;
mod intake;
mod pipeline;
mod reconcile;
mod reply;
mod store_handle;

pub use dispatch::{
    DeliveryOutcome, JobQueue, SqliteJobQueue, WorkerPool, WorkerPoolConfig,
};
pub use error::{EngineError, IntakeError};
pub use intake::JobIntake;
pub use pipeline::{Pipeline, PipelineConfig, RunOutcome, StageFailure, Stages};
pub use reconcile::{CycleReport, ReconcileConfig, Reconciler};
pub use reply::{FALLBACK_PERSONA_NAME, ReplyFormat, compose_reply};
pub use store_handle::StoreHandle;
