#![forbid(unsafe_code)]

use super::command::{CommandSpec, invoke};
use async_trait::async_trait;
use cx_core::{DeliveryReceipt, ReplyDelivery, ReplyError, ReplyRequest};
use serde::Deserialize;

#[derive(Clone, Debug)]
pub(crate) struct CommandReplyDelivery {
    spec: CommandSpec,
}

impl CommandReplyDelivery {
    pub(crate) fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[derive(Deserialize)]
struct ReplyResponse {
    #[serde(default)]
    receipt: String,
}

#[async_trait]
impl ReplyDelivery for CommandReplyDelivery {
    async fn deliver(&self, request: &ReplyRequest) -> Result<DeliveryReceipt, ReplyError> {
        let response: ReplyResponse = invoke(&self.spec, "reply", None, request)
            .await
            .map_err(|failure| ReplyError(failure.into_message()))?;
        Ok(DeliveryReceipt(response.receipt))
    }
}
