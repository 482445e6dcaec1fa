#![forbid(unsafe_code)]

use cx_core::{JobId, PersonaId};
use serde::{Deserialize, Serialize};

/// Body of a dispatch message; the executor re-reads the job row anyway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub job_id: JobId,
    pub persona_id: PersonaId,
    pub query: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Ready,
    Leased,
    Acked,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Leased => "leased",
            Self::Acked => "acked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ready" => Some(Self::Ready),
            "leased" => Some(Self::Leased),
            "acked" => Some(Self::Acked),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueMessageRow {
    pub id: i64,
    pub job_id: JobId,
    pub state: QueueState,
    pub deliveries: u32,
    pub visible_at_ms: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at_ms: Option<i64>,
    pub enqueued_at_ms: i64,
    pub acked_at_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct QueueEnqueueRequest {
    pub payload: DispatchPayload,
}

#[derive(Clone, Debug)]
pub struct QueueLeaseRequest {
    pub worker_id: String,
    pub lease_ttl_ms: u64,
}

/// One delivery of a message to a worker. `deliveries` counts this one.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueDelivery {
    pub message_id: i64,
    pub payload: DispatchPayload,
    pub deliveries: u32,
    pub lease_expires_at_ms: i64,
    pub redelivered: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub leased: u64,
}
