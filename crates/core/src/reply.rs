#![forbid(unsafe_code)]

use crate::model::OriginRef;
use crate::stages::ArtifactRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub origin: OriginRef,
    pub text: String,
    pub media: Option<ArtifactRef>,
}

/// Confirmation returned by the platform; stored verbatim, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryReceipt(pub String);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("reply delivery failed: {0}")]
pub struct ReplyError(pub String);

/// Posts a reply to the external request a job came from.
#[async_trait]
pub trait ReplyDelivery: Send + Sync {
    async fn deliver(&self, request: &ReplyRequest) -> Result<DeliveryReceipt, ReplyError>;
}

/// Answers whether an artifact can still be fetched for attachment.
pub trait ArtifactStore: Send + Sync {
    fn is_retrievable(&self, artifact: &ArtifactRef) -> bool;
}
